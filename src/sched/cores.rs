use super::ContextSwitch;

/// Most recent context switch per logical CPU.
///
/// Dense and indexed by CPU number; grows on demand when a higher index shows
/// up than the table was sized for.
#[derive(Debug, Default)]
pub struct PerCoreTable {
    slots: Vec<Option<ContextSwitch>>,
}

impl PerCoreTable {
    /// Create a table pre-sized for `cores` CPUs.
    pub fn with_cores(cores: usize) -> Self {
        Self {
            slots: vec![None; cores],
        }
    }

    /// Store `switch` as the latest switch on `core`, returning the one it
    /// replaces. `None` on the first switch ever seen for that core.
    #[inline]
    pub fn get_and_replace(&mut self, core: u16, switch: ContextSwitch) -> Option<ContextSwitch> {
        let idx = usize::from(core);
        if idx >= self.slots.len() {
            self.slots.resize(idx + 1, None);
        }

        self.slots.get_mut(idx).and_then(|slot| slot.replace(switch))
    }

    /// Number of cores with a switch recorded, i.e. with a slice still open.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Number of core slots currently allocated.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Forget every recorded switch.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn switch(ts: u64, old_tid: u32, new_tid: u32) -> ContextSwitch {
        ContextSwitch {
            timestamp_ns: ts,
            old_tid,
            new_tid,
        }
    }

    #[test]
    fn test_first_switch_returns_none() {
        let mut table = PerCoreTable::with_cores(4);
        assert_eq!(table.get_and_replace(0, switch(0, 1, 2)), None);
        assert_eq!(table.occupied(), 1);
    }

    #[test]
    fn test_replace_returns_previous() {
        let mut table = PerCoreTable::with_cores(1);
        table.get_and_replace(0, switch(0, 1, 2));
        let prev = table.get_and_replace(0, switch(5, 2, 1));
        assert_eq!(prev, Some(switch(0, 1, 2)));
        assert_eq!(
            table.get_and_replace(0, switch(9, 1, 3)),
            Some(switch(5, 2, 1))
        );
    }

    #[test]
    fn test_cores_are_independent() {
        let mut table = PerCoreTable::with_cores(2);
        table.get_and_replace(0, switch(0, 1, 2));
        assert_eq!(table.get_and_replace(1, switch(1, 10, 20)), None);
        assert_eq!(table.occupied(), 2);
    }

    #[test]
    fn test_grows_for_unseen_core() {
        let mut table = PerCoreTable::default();
        assert_eq!(table.capacity(), 0);
        assert_eq!(table.get_and_replace(63, switch(0, 1, 2)), None);
        assert_eq!(table.capacity(), 64);
        assert_eq!(table.occupied(), 1);
        assert_eq!(table.get_and_replace(62, switch(1, 1, 2)), None);
    }

    #[test]
    fn test_clear() {
        let mut table = PerCoreTable::with_cores(2);
        table.get_and_replace(0, switch(0, 1, 2));
        table.get_and_replace(1, switch(0, 1, 2));
        table.clear();
        assert_eq!(table.occupied(), 0);
        assert_eq!(table.get_and_replace(0, switch(9, 1, 2)), None);
    }
}
