use std::fmt;

/// Kernel thread provider (`Thread` MOF class), which also carries `CSwitch`.
pub const THREAD_PROVIDER: u128 = 0x3d6f_a8d1_fe05_11d0_9dda_00c0_4fd7_ba7c;

/// Opcodes of the thread provider.
pub mod opcode {
    pub const THREAD_START: u8 = 1;
    pub const THREAD_END: u8 = 2;
    /// `DCStart`: enumerates threads alive when the trace begins.
    pub const THREAD_RUNDOWN_START: u8 = 3;
    /// `DCEnd`: enumerates threads alive when the trace ends.
    pub const THREAD_RUNDOWN_END: u8 = 4;
    pub const CONTEXT_SWITCH: u8 = 36;
}

/// Minimum payload read from a thread event: `ProcessId`, `TThreadId`.
pub const THREAD_PAYLOAD_MIN: usize = 8;
/// Nominal 64-bit `Thread_TypeGroup1` payload size.
pub const THREAD_PAYLOAD_SIZE: usize = 72;
/// Minimum payload read from a context switch: `NewThreadId`, `OldThreadId`.
pub const CSWITCH_PAYLOAD_MIN: usize = 8;
/// Nominal `CSwitch` payload size.
pub const CSWITCH_PAYLOAD_SIZE: usize = 24;

/// EventKind classifies a raw record by provider and opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    Other = 0,
    ThreadStart = 1,
    ThreadEnd = 2,
    ThreadRundownStart = 3,
    ThreadRundownEnd = 4,
    ContextSwitch = 5,
}

/// Maximum EventKind value, used for array sizing.
pub const MAX_EVENT_KIND: usize = 5;

impl EventKind {
    /// Classify a record from its provider GUID and opcode.
    #[inline]
    pub fn classify(provider: u128, op: u8) -> Self {
        if provider != THREAD_PROVIDER {
            return Self::Other;
        }

        match op {
            opcode::THREAD_START => Self::ThreadStart,
            opcode::THREAD_END => Self::ThreadEnd,
            opcode::THREAD_RUNDOWN_START => Self::ThreadRundownStart,
            opcode::THREAD_RUNDOWN_END => Self::ThreadRundownEnd,
            opcode::CONTEXT_SWITCH => Self::ContextSwitch,
            _ => Self::Other,
        }
    }

    /// Returns the canonical log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Other => "other",
            Self::ThreadStart => "thread_start",
            Self::ThreadEnd => "thread_end",
            Self::ThreadRundownStart => "thread_rundown_start",
            Self::ThreadRundownEnd => "thread_rundown_end",
            Self::ContextSwitch => "context_switch",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Other),
            1 => Some(Self::ThreadStart),
            2 => Some(Self::ThreadEnd),
            3 => Some(Self::ThreadRundownStart),
            4 => Some(Self::ThreadRundownEnd),
            5 => Some(Self::ContextSwitch),
            _ => None,
        }
    }

    /// Whether this kind carries a tid to pid mapping.
    pub const fn maps_thread(self) -> bool {
        matches!(
            self,
            Self::ThreadStart | Self::ThreadRundownStart | Self::ThreadRundownEnd
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record as delivered by the kernel trace session.
#[derive(Debug, Clone, Copy)]
pub struct RawEvent<'a> {
    pub provider: u128,
    pub opcode: u8,
    /// Raw performance-counter ticks from the event header.
    pub timestamp_ticks: u64,
    /// Logical CPU the record was logged on.
    pub cpu: u16,
    pub payload: &'a [u8],
}

impl RawEvent<'_> {
    pub fn kind(&self) -> EventKind {
        EventKind::classify(self.provider, self.opcode)
    }
}

/// A record after payload decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedEvent {
    /// Thread start or rundown: `tid` belongs to `pid`.
    ThreadMapping { kind: EventKind, tid: u32, pid: u32 },
    ContextSwitch {
        cpu: u16,
        old_tid: u32,
        new_tid: u32,
        timestamp_ticks: u64,
    },
    /// Classified but carries nothing the aggregator needs.
    Ignored(EventKind),
}

/// Owned counterpart of [`RawEvent`], for scripted sources and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedEvent {
    pub provider: u128,
    pub opcode: u8,
    pub timestamp_ticks: u64,
    pub cpu: u16,
    pub payload: Vec<u8>,
}

impl OwnedEvent {
    pub fn as_raw(&self) -> RawEvent<'_> {
        RawEvent {
            provider: self.provider,
            opcode: self.opcode,
            timestamp_ticks: self.timestamp_ticks,
            cpu: self.cpu,
            payload: &self.payload,
        }
    }

    fn thread(op: u8, tid: u32, pid: u32, ticks: u64) -> Self {
        let mut payload = Vec::with_capacity(THREAD_PAYLOAD_SIZE);
        payload.extend_from_slice(&pid.to_le_bytes());
        payload.extend_from_slice(&tid.to_le_bytes());
        payload.resize(THREAD_PAYLOAD_SIZE, 0);

        Self {
            provider: THREAD_PROVIDER,
            opcode: op,
            timestamp_ticks: ticks,
            cpu: 0,
            payload,
        }
    }

    pub fn thread_start(tid: u32, pid: u32, ticks: u64) -> Self {
        Self::thread(opcode::THREAD_START, tid, pid, ticks)
    }

    pub fn thread_end(tid: u32, pid: u32, ticks: u64) -> Self {
        Self::thread(opcode::THREAD_END, tid, pid, ticks)
    }

    pub fn thread_rundown_start(tid: u32, pid: u32, ticks: u64) -> Self {
        Self::thread(opcode::THREAD_RUNDOWN_START, tid, pid, ticks)
    }

    pub fn thread_rundown_end(tid: u32, pid: u32, ticks: u64) -> Self {
        Self::thread(opcode::THREAD_RUNDOWN_END, tid, pid, ticks)
    }

    pub fn context_switch(cpu: u16, old_tid: u32, new_tid: u32, ticks: u64) -> Self {
        let mut payload = Vec::with_capacity(CSWITCH_PAYLOAD_SIZE);
        payload.extend_from_slice(&new_tid.to_le_bytes());
        payload.extend_from_slice(&old_tid.to_le_bytes());
        payload.resize(CSWITCH_PAYLOAD_SIZE, 0);

        Self {
            provider: THREAD_PROVIDER,
            opcode: opcode::CONTEXT_SWITCH,
            timestamp_ticks: ticks,
            cpu,
            payload,
        }
    }

    /// A record from some other provider or opcode.
    pub fn other(provider: u128, op: u8, ticks: u64) -> Self {
        Self {
            provider,
            opcode: op,
            timestamp_ticks: ticks,
            cpu: 0,
            payload: Vec::new(),
        }
    }

    /// Cut the payload short, producing a malformed record.
    pub fn truncated(mut self, len: usize) -> Self {
        self.payload.truncate(len);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_thread_opcodes() {
        assert_eq!(EventKind::classify(THREAD_PROVIDER, 1), EventKind::ThreadStart);
        assert_eq!(EventKind::classify(THREAD_PROVIDER, 2), EventKind::ThreadEnd);
        assert_eq!(
            EventKind::classify(THREAD_PROVIDER, 3),
            EventKind::ThreadRundownStart
        );
        assert_eq!(
            EventKind::classify(THREAD_PROVIDER, 4),
            EventKind::ThreadRundownEnd
        );
        assert_eq!(
            EventKind::classify(THREAD_PROVIDER, 36),
            EventKind::ContextSwitch
        );
        // ReadyThread shares the provider but is not consumed.
        assert_eq!(EventKind::classify(THREAD_PROVIDER, 50), EventKind::Other);
    }

    #[test]
    fn test_classify_foreign_provider() {
        assert_eq!(EventKind::classify(0x1234, 36), EventKind::Other);
    }

    #[test]
    fn test_from_u8_roundtrips_all_kinds() {
        for raw in 0..=MAX_EVENT_KIND as u8 {
            let kind = EventKind::from_u8(raw).expect("valid kind");
            assert_eq!(kind as u8, raw);
        }
        assert_eq!(EventKind::from_u8(MAX_EVENT_KIND as u8 + 1), None);
    }

    #[test]
    fn test_maps_thread() {
        assert!(EventKind::ThreadStart.maps_thread());
        assert!(EventKind::ThreadRundownStart.maps_thread());
        assert!(EventKind::ThreadRundownEnd.maps_thread());
        assert!(!EventKind::ThreadEnd.maps_thread());
        assert!(!EventKind::ContextSwitch.maps_thread());
    }

    #[test]
    fn test_context_switch_payload_layout() {
        let ev = OwnedEvent::context_switch(3, 10, 20, 99);
        assert_eq!(ev.payload.len(), CSWITCH_PAYLOAD_SIZE);
        assert_eq!(&ev.payload[0..4], &20u32.to_le_bytes());
        assert_eq!(&ev.payload[4..8], &10u32.to_le_bytes());
        assert_eq!(ev.as_raw().kind(), EventKind::ContextSwitch);
        assert_eq!(ev.as_raw().cpu, 3);
    }

    #[test]
    fn test_thread_payload_layout() {
        let ev = OwnedEvent::thread_start(7, 8, 0);
        assert_eq!(ev.payload.len(), THREAD_PAYLOAD_SIZE);
        assert_eq!(&ev.payload[0..4], &8u32.to_le_bytes());
        assert_eq!(&ev.payload[4..8], &7u32.to_le_bytes());
    }

    #[test]
    fn test_display() {
        assert_eq!(EventKind::ContextSwitch.to_string(), "context_switch");
    }
}
