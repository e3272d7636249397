use std::collections::HashMap;

use tracing::warn;

/// Maps live thread ids to their owning process id.
///
/// Entries are written by thread start and rundown events and read when a
/// scheduling slice closes. Nothing is removed on thread exit: a slice for a
/// thread that just exited can still close after its end event. Owned by the
/// consumer thread, so no locking.
#[derive(Debug)]
pub struct TidToPidTable {
    pids: HashMap<u32, u32>,
    soft_cap: Option<usize>,
    resets: u64,
}

impl TidToPidTable {
    /// Create an empty table pre-sized for `capacity` threads.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pids: HashMap::with_capacity(capacity),
            soft_cap: None,
            resets: 0,
        }
    }

    /// Clear the table whenever an insert would push it past `cap` entries.
    pub fn with_soft_cap(mut self, cap: Option<usize>) -> Self {
        self.soft_cap = cap.filter(|c| *c > 0);
        self
    }

    /// Record that `tid` belongs to `pid`. The latest observation wins.
    pub fn record_mapping(&mut self, tid: u32, pid: u32) {
        if let Some(cap) = self.soft_cap {
            if self.pids.len() >= cap && !self.pids.contains_key(&tid) {
                warn!(
                    entries = self.pids.len(),
                    cap, "tid to pid table exceeded soft cap, resetting"
                );
                self.pids.clear();
                self.resets += 1;
            }
        }

        self.pids.insert(tid, pid);
    }

    /// Return the owning process of `tid`, if one has been recorded.
    #[inline]
    pub fn lookup(&self, tid: u32) -> Option<u32> {
        self.pids.get(&tid).copied()
    }

    /// Number of threads currently mapped.
    pub fn len(&self) -> usize {
        self.pids.len()
    }

    /// Whether no thread is mapped.
    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    /// Number of times the soft cap forced a reset.
    pub fn resets(&self) -> u64 {
        self.resets
    }
}

impl Default for TidToPidTable {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}
