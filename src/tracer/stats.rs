use std::sync::atomic::{AtomicU64, Ordering};

use super::event::{EventKind, MAX_EVENT_KIND};

/// Lock-free per-EventKind counters, shared between the consumer thread and
/// whoever reports on it.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
pub struct EventStats {
    counts: [AtomicU64; MAX_EVENT_KIND + 1],
    malformed: AtomicU64,
    slices: AtomicU64,
}

/// One reporting interval's worth of counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventStatsSnapshot {
    pub by_kind: Vec<(EventKind, u64)>,
    pub malformed: u64,
    pub slices: u64,
}

impl EventStatsSnapshot {
    /// Count for `kind`, zero if absent.
    pub fn count(&self, kind: EventKind) -> u64 {
        self.by_kind
            .iter()
            .find(|(k, _)| *k == kind)
            .map_or(0, |(_, v)| *v)
    }

    pub fn total(&self) -> u64 {
        self.by_kind.iter().map(|(_, v)| *v).sum()
    }
}

impl EventStats {
    /// Create a new zeroed EventStats.
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            malformed: AtomicU64::new(0),
            slices: AtomicU64::new(0),
        }
    }

    /// Increment the counter for the given event kind by one.
    #[inline]
    pub fn record(&self, kind: EventKind) {
        if let Some(counter) = self.counts.get(kind as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_slice(&self) {
        self.slices.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters, keeping only non-zero kinds.
    pub fn snapshot(&self) -> EventStatsSnapshot {
        let mut by_kind = Vec::new();

        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(kind) = EventKind::from_u8(i as u8) {
                    by_kind.push((kind, v));
                }
            }
        }

        EventStatsSnapshot {
            by_kind,
            malformed: self.malformed.swap(0, Ordering::Relaxed),
            slices: self.slices.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for EventStats {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStats").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = EventStats::new();
        stats.record(EventKind::ContextSwitch);
        stats.record(EventKind::ContextSwitch);
        stats.record(EventKind::ThreadStart);

        let snap = stats.snapshot();
        assert_eq!(snap.by_kind.len(), 2);
        assert_eq!(snap.count(EventKind::ContextSwitch), 2);
        assert_eq!(snap.count(EventKind::ThreadStart), 1);
        assert_eq!(snap.count(EventKind::ThreadEnd), 0);
        assert_eq!(snap.total(), 3);
    }

    #[test]
    fn test_snapshot_resets_counters() {
        let stats = EventStats::new();
        stats.record(EventKind::Other);
        stats.record_malformed();
        stats.record_slice();

        let snap1 = stats.snapshot();
        assert_eq!(snap1.by_kind.len(), 1);
        assert_eq!(snap1.malformed, 1);
        assert_eq!(snap1.slices, 1);

        let snap2 = stats.snapshot();
        assert_eq!(snap2, EventStatsSnapshot::default());
    }
}
