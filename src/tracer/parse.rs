//! Payload decoding for kernel thread and context switch records.
//!
//! Only the leading fields the aggregator needs are read. Length checks
//! happen once per payload against the minimum layout; the remaining bytes
//! (priorities, wait reasons, stack bounds) are never touched, so payloads
//! longer than the nominal size are accepted as-is.

use thiserror::Error;

use super::event::{
    EventKind, ParsedEvent, RawEvent, CSWITCH_PAYLOAD_MIN, THREAD_PAYLOAD_MIN,
};

/// Errors that can occur during payload decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("reading {event_name}: payload is {size} bytes, need at least {need}")]
    PayloadTruncated {
        event_name: &'static str,
        size: usize,
        need: usize,
    },
}

/// Decode a raw record into a [`ParsedEvent`].
///
/// Records of other providers and thread end events decode to
/// [`ParsedEvent::Ignored`] without looking at the payload.
pub fn parse_event(raw: &RawEvent<'_>) -> Result<ParsedEvent, ParseError> {
    let kind = raw.kind();

    match kind {
        EventKind::ContextSwitch => parse_context_switch(raw),
        k if k.maps_thread() => parse_thread(k, raw.payload),
        k => Ok(ParsedEvent::Ignored(k)),
    }
}

fn parse_context_switch(raw: &RawEvent<'_>) -> Result<ParsedEvent, ParseError> {
    let data = raw.payload;
    ensure_payload(data, CSWITCH_PAYLOAD_MIN, EventKind::ContextSwitch.as_str())?;

    Ok(ParsedEvent::ContextSwitch {
        cpu: raw.cpu,
        new_tid: read_u32_le(data, 0),
        old_tid: read_u32_le(data, 4),
        timestamp_ticks: raw.timestamp_ticks,
    })
}

fn parse_thread(kind: EventKind, data: &[u8]) -> Result<ParsedEvent, ParseError> {
    ensure_payload(data, THREAD_PAYLOAD_MIN, kind.as_str())?;

    Ok(ParsedEvent::ThreadMapping {
        kind,
        pid: read_u32_le(data, 0),
        tid: read_u32_le(data, 4),
    })
}

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    debug_assert!(offset + N <= data.len());
    // Safety: callers ensure `offset + N <= data.len()` via `ensure_payload`.
    unsafe { (data.as_ptr().add(offset) as *const [u8; N]).read_unaligned() }
}

fn ensure_payload(data: &[u8], need: usize, name: &'static str) -> Result<(), ParseError> {
    if data.len() < need {
        Err(ParseError::PayloadTruncated {
            event_name: name,
            size: data.len(),
            need,
        })
    } else {
        Ok(())
    }
}
