//! Ready-made [`SliceListener`](crate::sched::SliceListener) implementations.

pub mod jsonl;
pub mod summary;

pub use self::jsonl::JsonLinesSink;
pub use self::summary::{ProcessSummary, SummarySink};
