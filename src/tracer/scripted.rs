//! In-memory event source.
//!
//! Replays a fixed list of records through the same pump contract the
//! kernel session uses, then blocks until stopped. Runs on every platform.

use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::{Condvar, Mutex};

use super::event::OwnedEvent;
use super::{EventHandler, EventPump, EventSource, SessionStats};
use crate::config::TraceConfig;

#[derive(Debug, Default)]
struct ScriptState {
    opens: u64,
    /// An open call is parked waiting for `release_open`.
    opening: bool,
    released: bool,
    stopped: bool,
    /// A pump exists that has not finished replaying.
    draining: bool,
    delivered: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<ScriptState>,
    changed: Condvar,
}

/// Scripted [`EventSource`] for tests, benches and dry runs.
#[derive(Debug)]
pub struct ScriptedSource {
    events: Arc<Vec<OwnedEvent>>,
    tick_frequency: u64,
    os_stats: SessionStats,
    fail_open: Option<String>,
    hold_open: bool,
    shared: Arc<Shared>,
}

impl ScriptedSource {
    /// Replay `events` with nanosecond ticks.
    pub fn new(events: Vec<OwnedEvent>) -> Self {
        Self {
            events: Arc::new(events),
            tick_frequency: 1_000_000_000,
            os_stats: SessionStats::default(),
            fail_open: None,
            hold_open: false,
            shared: Arc::default(),
        }
    }

    pub fn with_tick_frequency(mut self, hz: u64) -> Self {
        self.tick_frequency = hz;
        self
    }

    /// Buffer counters and lost events to report at stop. Handled and total
    /// event counts are derived from what was actually delivered.
    pub fn with_os_stats(mut self, stats: SessionStats) -> Self {
        self.os_stats = stats;
        self
    }

    /// Make every `open` fail with `reason`.
    pub fn failing_open(mut self, reason: impl Into<String>) -> Self {
        self.fail_open = Some(reason.into());
        self
    }

    /// Park `open` until [`release_open`](Self::release_open) or `stop`.
    pub fn holding_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Let a parked `open` proceed.
    pub fn release_open(&self) {
        let mut state = self.shared.state.lock();
        state.released = true;
        self.shared.changed.notify_all();
    }

    /// Block until an `open` call is parked.
    pub fn wait_until_opening(&self) {
        let mut state = self.shared.state.lock();
        while !state.opening {
            self.shared.changed.wait(&mut state);
        }
    }

    /// Number of times `open` has been called.
    pub fn opens(&self) -> u64 {
        self.shared.state.lock().opens
    }
}

impl EventSource for ScriptedSource {
    fn tick_frequency(&self) -> Result<u64> {
        Ok(self.tick_frequency)
    }

    fn open(&self, _config: &TraceConfig) -> Result<Box<dyn EventPump>> {
        let mut state = self.shared.state.lock();
        state.opens += 1;
        state.stopped = false;
        state.delivered = 0;

        if let Some(reason) = &self.fail_open {
            bail!("{reason}");
        }

        if self.hold_open {
            state.opening = true;
            self.shared.changed.notify_all();
            while !state.released && !state.stopped {
                self.shared.changed.wait(&mut state);
            }
            state.opening = false;
            state.released = false;

            if state.stopped {
                bail!("trace session stopped while opening");
            }
        }

        state.draining = true;
        Ok(Box::new(ScriptedPump {
            events: Arc::clone(&self.events),
            shared: Arc::clone(&self.shared),
        }))
    }

    fn stop(&self) -> Result<SessionStats> {
        let mut state = self.shared.state.lock();
        state.stopped = true;
        self.shared.changed.notify_all();

        // Like a kernel session, stopping flushes what is already buffered.
        while state.draining {
            self.shared.changed.wait(&mut state);
        }

        let handled = state.delivered;
        Ok(SessionStats {
            events_handled: handled,
            events_total: handled + self.os_stats.events_lost,
            ..self.os_stats
        })
    }
}

struct ScriptedPump {
    events: Arc<Vec<OwnedEvent>>,
    shared: Arc<Shared>,
}

impl ScriptedPump {
    fn finish_draining(&self) {
        let mut state = self.shared.state.lock();
        if state.draining {
            state.draining = false;
            self.shared.changed.notify_all();
        }
    }
}

impl EventPump for ScriptedPump {
    fn run(self: Box<Self>, handler: &mut dyn EventHandler) -> Result<()> {
        for event in self.events.iter() {
            handler.on_event(&event.as_raw());
            self.shared.state.lock().delivered += 1;
        }
        self.finish_draining();

        let mut state = self.shared.state.lock();
        while !state.stopped {
            self.shared.changed.wait(&mut state);
        }

        Ok(())
    }
}

impl Drop for ScriptedPump {
    fn drop(&mut self) {
        self.finish_draining();
    }
}
