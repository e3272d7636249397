//! Scheduling-slice reconstruction from kernel context switch traces.
//!
//! A [`session::Session`] drives an [`tracer::EventSource`] on a dedicated
//! consumer thread, turns thread lifecycle and context switch records into
//! [`sched::SchedulingSlice`]s and hands each one to a
//! [`sched::SliceListener`] as soon as it closes.

pub mod clock;
pub mod config;
pub mod pid;
pub mod sched;
pub mod session;
pub mod sink;
pub mod tracer;
