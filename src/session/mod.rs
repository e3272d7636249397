//! Session runtime: owns the trace source, the consumer thread and the
//! diagnostics of the last run.
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Idle
//!            |                                 ^
//!            +------- setup error / stop ------+
//! ```
//!
//! All slice state lives on the consumer thread. `start` and `stop` only
//! spawn and join that thread and ask the source to stop.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::ClockConverter;
use crate::config::{AggregatorConfig, Config, TraceConfig};
use crate::pid::TidToPidTable;
use crate::sched::{AggregatorStats, PerCoreTable, SliceAggregator, SliceListener};
use crate::tracer::dispatch::{Dispatcher, EventCounts};
use crate::tracer::stats::EventStats;
use crate::tracer::{EventPump, EventSource, SessionStats};

const CONSUMER_THREAD_NAME: &str = "slicetrace-consumer";
const CANCEL_RETRY_PERIOD: Duration = Duration::from_millis(20);

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl SessionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced synchronously from [`Session::start`].
#[derive(Error, Debug)]
pub enum SessionError {
    /// The trace session could not be configured or started. No consumer
    /// thread is left running.
    #[error("trace session setup failed")]
    SetupFailed(#[source] anyhow::Error),

    /// `stop` was called while the session was starting.
    #[error("trace session start cancelled by stop")]
    StartCancelled,

    #[error("trace session is already {state}")]
    AlreadyStarted { state: SessionState },
}

/// Everything known about a run, produced when it stops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub session: SessionStats,
    pub aggregator: AggregatorStats,
    pub events: EventCounts,
}

impl Diagnostics {
    /// Emit the diagnostics as structured log records.
    pub fn log(&self) {
        let agg = &self.aggregator;
        info!(
            slices = agg.slices,
            processed_cpu_events = agg.processed_cpu_events,
            processed_thread_events = agg.processed_thread_events,
            tid_mismatches = agg.tid_mismatches,
            out_of_order_switches = agg.out_of_order_switches,
            slices_with_unknown_pid = agg.slices_with_unknown_pid,
            tids_without_pid = agg.tids_without_pid.len(),
            zero_duration_slices = agg.zero_duration_slices,
            pending_slices_discarded = agg.pending_slices_discarded,
            tid_table_resets = agg.tid_table_resets,
            "aggregator diagnostics"
        );

        info!(
            events_total = self.events.events_total,
            malformed_events = self.events.malformed_events,
            ignored_events = self.events.ignored_events,
            buffers_allocated = self.session.buffers_allocated,
            buffers_written = self.session.buffers_written,
            os_events_handled = self.session.events_handled,
            "event diagnostics"
        );

        if self.session.has_loss() {
            warn!(
                buffers_lost = self.session.buffers_lost,
                events_lost = self.session.events_lost,
                tid_mismatches = agg.tid_mismatches,
                "kernel trace session reported loss"
            );
        }
    }
}

struct Inner {
    state: SessionState,
    cancel_requested: bool,
    consumer: Option<JoinHandle<Dispatcher>>,
    diagnostics: Option<Diagnostics>,
}

/// A restartable kernel trace session that reconstructs scheduling slices.
pub struct Session<S: EventSource> {
    source: S,
    trace: TraceConfig,
    aggregator: AggregatorConfig,
    listener: Arc<dyn SliceListener>,
    live: Arc<EventStats>,
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl<S: EventSource> Session<S> {
    /// Create an idle session delivering slices to `listener`.
    pub fn new(source: S, config: &Config, listener: Arc<dyn SliceListener>) -> Self {
        Self {
            source,
            trace: config.trace.clone(),
            aggregator: config.aggregator.clone(),
            listener,
            live: Arc::new(EventStats::new()),
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                cancel_requested: false,
                consumer: None,
                diagnostics: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// Start tracing. Returns once the consumer thread has entered the
    /// delivery loop, or with the reason it never will.
    pub fn start(&self) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Idle {
                return Err(SessionError::AlreadyStarted { state: inner.state });
            }
            inner.state = SessionState::Starting;
            inner.cancel_requested = false;
            inner.diagnostics = None;
        }

        info!(session = %self.trace.session_name, "starting trace session");

        let (dispatcher, pump) = match self.prepare() {
            Ok(prepared) => prepared,
            Err(e) => return Err(self.abort_start(Some(e))),
        };

        if self.inner.lock().cancel_requested {
            drop(pump);
            self.stop_source_quietly();
            return Err(self.abort_start(None));
        }

        let (entered_tx, entered_rx) = mpsc::sync_channel(1);
        let spawned = thread::Builder::new()
            .name(CONSUMER_THREAD_NAME.to_string())
            .spawn(move || run_consumer(pump, dispatcher, entered_tx));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.stop_source_quietly();
                return Err(self.abort_start(Some(
                    anyhow::Error::new(e).context("spawning consumer thread"),
                )));
            }
        };

        if entered_rx.recv().is_err() {
            self.stop_source_quietly();
            let _ = handle.join();
            return Err(self.abort_start(Some(anyhow!(
                "consumer thread exited before entering the delivery loop"
            ))));
        }

        let mut inner = self.inner.lock();
        if inner.cancel_requested {
            drop(inner);
            self.stop_source_quietly();
            if handle.join().is_err() {
                error!("consumer thread panicked");
            }
            return Err(self.abort_start(None));
        }

        inner.state = SessionState::Running;
        inner.consumer = Some(handle);
        self.changed.notify_all();
        info!(session = %self.trace.session_name, "trace session running");

        Ok(())
    }

    /// Stop tracing and return the run's diagnostics.
    ///
    /// Idempotent: from `Idle` it returns the last diagnostics unchanged;
    /// from `Stopping` it waits for the stop in progress. During `Starting`
    /// it cancels the start and returns `None`.
    pub fn stop(&self) -> Option<Diagnostics> {
        let mut inner = self.inner.lock();

        match inner.state {
            SessionState::Idle => inner.diagnostics.clone(),
            SessionState::Stopping => {
                while inner.state != SessionState::Idle {
                    self.changed.wait(&mut inner);
                }
                inner.diagnostics.clone()
            }
            SessionState::Starting => {
                inner.cancel_requested = true;
                drop(inner);

                info!("stop requested while starting, cancelling start");
                loop {
                    self.stop_source_quietly();

                    let mut inner = self.inner.lock();
                    if inner.state != SessionState::Idle {
                        // The stop can reach the source before `open` does,
                        // so repeat it until start gives up.
                        self.changed.wait_for(&mut inner, CANCEL_RETRY_PERIOD);
                    }
                    if inner.state == SessionState::Idle {
                        return inner.diagnostics.clone();
                    }
                }
            }
            SessionState::Running => {
                inner.state = SessionState::Stopping;
                let consumer = inner.consumer.take();
                drop(inner);

                info!(session = %self.trace.session_name, "stopping trace session");
                let diagnostics = self.drain(consumer);
                diagnostics.log();

                let mut inner = self.inner.lock();
                inner.diagnostics = Some(diagnostics.clone());
                inner.state = SessionState::Idle;
                self.changed.notify_all();
                info!("trace session stopped");

                Some(diagnostics)
            }
        }
    }

    /// Diagnostics of the last completed run.
    pub fn diagnostics(&self) -> Option<Diagnostics> {
        self.inner.lock().diagnostics.clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Live per-kind counters, updated by the consumer thread.
    pub fn event_stats(&self) -> Arc<EventStats> {
        Arc::clone(&self.live)
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn prepare(&self) -> anyhow::Result<(Dispatcher, Box<dyn EventPump>)> {
        self.trace.validate()?;

        let frequency = self
            .source
            .tick_frequency()
            .context("querying timestamp frequency")?;
        let clock = ClockConverter::new(frequency)?;

        let cores = self.aggregator.expected_cpus.unwrap_or_else(|| {
            thread::available_parallelism().map_or(1, NonZeroUsize::get)
        });
        let tids = TidToPidTable::with_capacity(self.aggregator.expected_threads)
            .with_soft_cap(self.aggregator.tid_table_soft_cap);
        let aggregator = SliceAggregator::with_tables(
            Arc::clone(&self.listener),
            PerCoreTable::with_cores(cores),
            tids,
        );

        let pump = self
            .source
            .open(&self.trace)
            .with_context(|| format!("opening trace session {}", self.trace.session_name))?;

        debug!(
            frequency_hz = frequency,
            cores,
            expected_threads = self.aggregator.expected_threads,
            "trace session opened"
        );

        Ok((Dispatcher::new(clock, aggregator, Arc::clone(&self.live)), pump))
    }

    /// Return to `Idle` after a failed or cancelled start.
    fn abort_start(&self, cause: Option<anyhow::Error>) -> SessionError {
        let mut inner = self.inner.lock();
        let cancelled = inner.cancel_requested;
        inner.cancel_requested = false;
        inner.state = SessionState::Idle;
        self.changed.notify_all();
        drop(inner);

        match cause {
            Some(e) if !cancelled => {
                warn!(error = %format!("{e:#}"), "trace session setup failed");
                SessionError::SetupFailed(e)
            }
            _ => {
                info!("trace session start cancelled");
                SessionError::StartCancelled
            }
        }
    }

    fn stop_source_quietly(&self) {
        if let Err(e) = self.source.stop() {
            debug!(error = %format!("{e:#}"), "stopping trace source");
        }
    }

    fn drain(&self, consumer: Option<JoinHandle<Dispatcher>>) -> Diagnostics {
        let session = match self.source.stop() {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "stopping trace session failed");
                SessionStats::default()
            }
        };

        let (aggregator, events) = match consumer.map(JoinHandle::join) {
            Some(Ok(dispatcher)) => dispatcher.finish(),
            Some(Err(_)) => {
                error!("consumer thread panicked, run statistics lost");
                Default::default()
            }
            None => Default::default(),
        };

        Diagnostics {
            session,
            aggregator,
            events,
        }
    }
}

impl<S: EventSource> Drop for Session<S> {
    fn drop(&mut self) {
        if self.state() != SessionState::Idle {
            self.stop();
        }
    }
}

fn run_consumer(
    pump: Box<dyn EventPump>,
    mut dispatcher: Dispatcher,
    entered: mpsc::SyncSender<()>,
) -> Dispatcher {
    let _ = entered.send(());
    drop(entered);

    debug!("consumer entered delivery loop");
    if let Err(e) = pump.run(&mut dispatcher) {
        error!(error = %format!("{e:#}"), "event delivery loop failed");
    }
    debug!("consumer left delivery loop");

    dispatcher
}
