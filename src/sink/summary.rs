use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::Serialize;

use crate::sched::{SchedulingSlice, SliceListener};

#[derive(Debug, Default)]
struct ProcessAccum {
    on_cpu_ns: u64,
    slices: u64,
    max_slice_ns: u64,
    threads: HashSet<u32>,
    cores: HashSet<u16>,
}

/// On-CPU totals for one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    pub pid: u32,
    pub on_cpu_ns: u64,
    pub slices: u64,
    pub max_slice_ns: u64,
    pub threads: usize,
    pub cores: usize,
}

/// Accumulates per-process on-CPU time from emitted slices.
#[derive(Debug, Default)]
pub struct SummarySink {
    processes: Mutex<HashMap<u32, ProcessAccum>>,
}

impl SummarySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct processes seen, including the unknown pid.
    pub fn process_count(&self) -> usize {
        self.processes.lock().len()
    }

    /// The `n` processes with the most on-CPU time, largest first. Ties are
    /// broken by pid so the order is stable.
    pub fn top(&self, n: usize) -> Vec<ProcessSummary> {
        let processes = self.processes.lock();
        let mut all: Vec<ProcessSummary> = processes
            .iter()
            .map(|(pid, acc)| ProcessSummary {
                pid: *pid,
                on_cpu_ns: acc.on_cpu_ns,
                slices: acc.slices,
                max_slice_ns: acc.max_slice_ns,
                threads: acc.threads.len(),
                cores: acc.cores.len(),
            })
            .collect();
        drop(processes);

        all.sort_unstable_by(|a, b| b.on_cpu_ns.cmp(&a.on_cpu_ns).then(a.pid.cmp(&b.pid)));
        all.truncate(n);
        all
    }
}

impl SliceListener for SummarySink {
    fn on_scheduling_slice(&self, slice: SchedulingSlice) {
        let mut processes = self.processes.lock();
        let acc = processes.entry(slice.pid).or_default();
        acc.on_cpu_ns = acc.on_cpu_ns.saturating_add(slice.duration_ns);
        acc.slices += 1;
        acc.max_slice_ns = acc.max_slice_ns.max(slice.duration_ns);
        acc.threads.insert(slice.tid);
        acc.cores.insert(slice.core);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::UNKNOWN_PID;

    fn slice(pid: u32, tid: u32, core: u16, duration_ns: u64) -> SchedulingSlice {
        SchedulingSlice {
            pid,
            tid,
            core,
            duration_ns,
            out_timestamp_ns: duration_ns,
        }
    }

    #[test]
    fn test_accumulates_per_process() {
        let sink = SummarySink::new();
        sink.on_scheduling_slice(slice(10, 1, 0, 100));
        sink.on_scheduling_slice(slice(10, 2, 1, 50));
        sink.on_scheduling_slice(slice(10, 1, 0, 25));
        sink.on_scheduling_slice(slice(20, 7, 3, 400));

        let top = sink.top(10);
        assert_eq!(
            top,
            vec![
                ProcessSummary {
                    pid: 20,
                    on_cpu_ns: 400,
                    slices: 1,
                    max_slice_ns: 400,
                    threads: 1,
                    cores: 1,
                },
                ProcessSummary {
                    pid: 10,
                    on_cpu_ns: 175,
                    slices: 3,
                    max_slice_ns: 100,
                    threads: 2,
                    cores: 2,
                },
            ]
        );
    }

    #[test]
    fn test_top_truncates_and_breaks_ties_by_pid() {
        let sink = SummarySink::new();
        sink.on_scheduling_slice(slice(3, 1, 0, 10));
        sink.on_scheduling_slice(slice(1, 2, 0, 10));
        sink.on_scheduling_slice(slice(2, 3, 0, 10));

        let pids: Vec<u32> = sink.top(2).iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![1, 2]);
        assert_eq!(sink.process_count(), 3);
    }

    #[test]
    fn test_unknown_pid_is_its_own_bucket() {
        let sink = SummarySink::new();
        sink.on_scheduling_slice(slice(UNKNOWN_PID, 5, 0, 0));
        let top = sink.top(1);
        assert_eq!(top[0].pid, UNKNOWN_PID);
        assert_eq!(top[0].slices, 1);
        assert_eq!(top[0].on_cpu_ns, 0);
    }
}
