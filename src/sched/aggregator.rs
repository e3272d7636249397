use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::cores::PerCoreTable;
use super::{ContextSwitch, SchedulingSlice, SliceListener, UNKNOWN_PID};
use crate::pid::TidToPidTable;

/// Quality counters for one aggregation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    pub processed_cpu_events: u64,
    pub processed_thread_events: u64,
    /// Adjacent switches on a core whose incoming and outgoing tids differ.
    pub tid_mismatches: u64,
    /// Switches older than the previous switch on the same core.
    pub out_of_order_switches: u64,
    pub slices: u64,
    pub slices_with_unknown_pid: u64,
    /// Slices emitted with `duration_ns == 0`; these are kept, not dropped.
    pub zero_duration_slices: u64,
    pub tid_table_resets: u64,
    /// Slices still open on some core when the run ended.
    pub pending_slices_discarded: u64,
    pub tids_without_pid: BTreeSet<u32>,
}

/// Closes scheduling slices from the stream of context switches.
///
/// Owns the per-core table and the tid to pid table; the process id is
/// joined when a slice closes, so a mapping that arrives between the two
/// switches of a slice still counts.
pub struct SliceAggregator {
    cores: PerCoreTable,
    tids: TidToPidTable,
    listener: Arc<dyn SliceListener>,
    stats: AggregatorStats,
}

impl std::fmt::Debug for SliceAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceAggregator")
            .field("cores", &self.cores.capacity())
            .field("tids", &self.tids.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl SliceAggregator {
    /// Create an aggregator emitting to `listener`.
    pub fn new(listener: Arc<dyn SliceListener>) -> Self {
        Self::with_tables(listener, PerCoreTable::default(), TidToPidTable::default())
    }

    /// Create an aggregator over pre-sized tables.
    pub fn with_tables(
        listener: Arc<dyn SliceListener>,
        cores: PerCoreTable,
        tids: TidToPidTable,
    ) -> Self {
        Self {
            cores,
            tids,
            listener,
            stats: AggregatorStats::default(),
        }
    }

    /// Record the owning process of a thread from a start or rundown event.
    pub fn on_thread(&mut self, tid: u32, pid: u32) {
        self.stats.processed_thread_events += 1;
        self.tids.record_mapping(tid, pid);
    }

    /// Feed one context switch, emitting the slice it closes, if any.
    pub fn on_context_switch(&mut self, core: u16, old_tid: u32, new_tid: u32, timestamp_ns: u64) {
        self.stats.processed_cpu_events += 1;

        let next = ContextSwitch {
            timestamp_ns,
            old_tid,
            new_tid,
        };

        let Some(prev) = self.cores.get_and_replace(core, next) else {
            return;
        };

        if prev.new_tid != old_tid {
            self.stats.tid_mismatches += 1;
            return;
        }

        let Some(duration_ns) = timestamp_ns.checked_sub(prev.timestamp_ns) else {
            self.stats.out_of_order_switches += 1;
            warn!(
                core,
                tid = old_tid,
                previous_ns = prev.timestamp_ns,
                timestamp_ns,
                "context switch out of order on core, dropping slice"
            );
            return;
        };

        let pid = match self.tids.lookup(prev.new_tid) {
            Some(pid) => pid,
            None => {
                self.stats.slices_with_unknown_pid += 1;
                if self.stats.tids_without_pid.insert(prev.new_tid) {
                    debug!(tid = prev.new_tid, core, "closing slice for thread without pid");
                }
                UNKNOWN_PID
            }
        };

        if duration_ns == 0 {
            self.stats.zero_duration_slices += 1;
        }
        self.stats.slices += 1;

        self.listener.on_scheduling_slice(SchedulingSlice {
            pid,
            tid: prev.new_tid,
            core,
            duration_ns,
            out_timestamp_ns: timestamp_ns,
        });
    }

    /// Read-only view of the counters so far.
    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }

    /// End the run: half-open slices are discarded, never closed with a
    /// made-up end time. Returns the final counters.
    pub fn finish(mut self) -> AggregatorStats {
        self.stats.pending_slices_discarded = self.cores.occupied() as u64;
        self.stats.tid_table_resets = self.tids.resets();
        self.cores.clear();
        self.stats
    }
}
