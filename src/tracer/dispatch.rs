use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::event::{EventKind, ParsedEvent, RawEvent};
use super::parse::parse_event;
use super::stats::EventStats;
use super::EventHandler;
use crate::clock::ClockConverter;
use crate::sched::{AggregatorStats, SliceAggregator};

/// Consumer-side counters of delivered records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventCounts {
    pub events_total: u64,
    /// Records whose payload could not be decoded; dropped.
    pub malformed_events: u64,
    /// Records of kinds the aggregator does not consume.
    pub ignored_events: u64,
}

/// Routes decoded records into the aggregator.
///
/// Owns no slice state itself: thread mappings go to the aggregator's tid
/// table, switches are converted to nanoseconds and handed over as-is.
pub struct Dispatcher {
    clock: ClockConverter,
    aggregator: SliceAggregator,
    live: Arc<EventStats>,
    counts: EventCounts,
}

impl Dispatcher {
    pub fn new(clock: ClockConverter, aggregator: SliceAggregator, live: Arc<EventStats>) -> Self {
        Self {
            clock,
            aggregator,
            live,
            counts: EventCounts::default(),
        }
    }

    /// Close the run, discarding half-open slices.
    pub fn finish(self) -> (AggregatorStats, EventCounts) {
        (self.aggregator.finish(), self.counts)
    }
}

impl EventHandler for Dispatcher {
    #[inline]
    fn on_event(&mut self, event: &RawEvent<'_>) {
        self.counts.events_total += 1;

        let parsed = match parse_event(event) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, cpu = event.cpu, "dropping malformed event");
                self.counts.malformed_events += 1;
                self.live.record_malformed();
                return;
            }
        };

        match parsed {
            ParsedEvent::ThreadMapping { kind, tid, pid } => {
                self.live.record(kind);
                self.aggregator.on_thread(tid, pid);
            }
            ParsedEvent::ContextSwitch {
                cpu,
                old_tid,
                new_tid,
                timestamp_ticks,
            } => {
                self.live.record(EventKind::ContextSwitch);

                let before = self.aggregator.stats().slices;
                let ts_ns = self.clock.to_nanoseconds(timestamp_ticks);
                self.aggregator.on_context_switch(cpu, old_tid, new_tid, ts_ns);
                if self.aggregator.stats().slices != before {
                    self.live.record_slice();
                }
            }
            ParsedEvent::Ignored(kind) => {
                self.live.record(kind);
                self.counts.ignored_events += 1;
            }
        }
    }
}
