//! Scheduling-slice reconstruction.
//!
//! A slice is the interval between two adjacent context switches on the same
//! core where the thread switched in by the first is the thread switched out
//! by the second. The switch that closes one slice opens the next.

pub mod aggregator;
pub mod cores;

use serde::Serialize;

pub use self::aggregator::{AggregatorStats, SliceAggregator};
pub use self::cores::PerCoreTable;

/// Process id emitted when no tid to pid mapping exists at slice close.
pub const UNKNOWN_PID: u32 = u32::MAX;

/// A single observed context switch on one core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSwitch {
    pub timestamp_ns: u64,
    pub old_tid: u32,
    pub new_tid: u32,
}

/// A closed interval during which `tid` ran on `core`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SchedulingSlice {
    /// Owning process, or [`UNKNOWN_PID`].
    pub pid: u32,
    pub tid: u32,
    pub core: u16,
    pub duration_ns: u64,
    /// Timestamp of the switch that ended the slice.
    pub out_timestamp_ns: u64,
}

impl SchedulingSlice {
    /// Timestamp of the switch that started the slice.
    pub fn in_timestamp_ns(&self) -> u64 {
        self.out_timestamp_ns - self.duration_ns
    }

    pub fn has_known_pid(&self) -> bool {
        self.pid != UNKNOWN_PID
    }
}

/// Receives every emitted slice, synchronously, from the consumer thread.
pub trait SliceListener: Send + Sync {
    fn on_scheduling_slice(&self, slice: SchedulingSlice);
}

impl<F> SliceListener for F
where
    F: Fn(SchedulingSlice) + Send + Sync,
{
    fn on_scheduling_slice(&self, slice: SchedulingSlice) {
        self(slice)
    }
}
