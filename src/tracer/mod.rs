pub mod dispatch;
pub mod event;
pub mod parse;
pub mod scripted;
pub mod stats;

#[cfg(all(windows, feature = "etw"))]
pub mod etw;

use anyhow::Result;
use serde::Serialize;

use crate::config::TraceConfig;

use self::event::RawEvent;

/// OS-side counters of a kernel trace session, read when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub buffers_allocated: u64,
    pub buffers_free: u64,
    pub buffers_written: u64,
    /// Log buffers plus real-time delivery buffers the OS dropped.
    pub buffers_lost: u64,
    /// Handled plus lost.
    pub events_total: u64,
    pub events_handled: u64,
    pub events_lost: u64,
}

impl SessionStats {
    /// Whether the OS reported any loss at all.
    pub fn has_loss(&self) -> bool {
        self.buffers_lost > 0 || self.events_lost > 0
    }
}

/// Receives every record delivered by an [`EventPump`], on the pump's thread.
pub trait EventHandler {
    fn on_event(&mut self, event: &RawEvent<'_>);
}

/// The blocking delivery loop of an opened trace session.
pub trait EventPump: Send {
    /// Deliver records to `handler` until the owning source is stopped.
    /// Records still buffered when the stop arrives are drained first.
    fn run(self: Box<Self>, handler: &mut dyn EventHandler) -> Result<()>;
}

/// A kernel trace session the runtime can open and stop.
///
/// Methods take `&self` because `stop` must be callable from another thread
/// while `open` is still in progress.
pub trait EventSource: Send + Sync + 'static {
    /// Ticks per second of the timestamps this source delivers.
    fn tick_frequency(&self) -> Result<u64>;

    /// Configure and start the session, returning its delivery loop.
    fn open(&self, config: &TraceConfig) -> Result<Box<dyn EventPump>>;

    /// Request the session to stop. The running pump returns once drained.
    fn stop(&self) -> Result<SessionStats>;
}
