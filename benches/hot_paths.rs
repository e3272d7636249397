use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use slicetrace::clock::ClockConverter;
use slicetrace::sched::{SchedulingSlice, SliceAggregator};
use slicetrace::tracer::dispatch::Dispatcher;
use slicetrace::tracer::event::OwnedEvent;
use slicetrace::tracer::parse::parse_event;
use slicetrace::tracer::stats::EventStats;
use slicetrace::tracer::EventHandler;

const CORES: u16 = 16;
const THREADS: u32 = 512;

/// A busy machine: every core round-robins through its share of threads,
/// with a rundown of all thread mappings up front.
fn build_stream(switches: usize) -> Vec<OwnedEvent> {
    let mut events = Vec::with_capacity(switches + THREADS as usize);

    for tid in 0..THREADS {
        events.push(OwnedEvent::thread_rundown_start(tid, 4_000 + tid / 8, 0));
    }

    let mut running: Vec<u32> = (0..u32::from(CORES)).collect();
    for i in 0..switches {
        let core = (i % usize::from(CORES)) as u16;
        let idx = usize::from(core);
        let old = running[idx];
        let new = (old + u32::from(CORES)) % THREADS;
        running[idx] = new;
        events.push(OwnedEvent::context_switch(core, old, new, 1_000 + i as u64 * 37));
    }

    events
}

fn dispatcher() -> Dispatcher {
    let aggregator = SliceAggregator::new(Arc::new(|s: SchedulingSlice| {
        black_box(s);
    }));
    Dispatcher::new(
        ClockConverter::new(10_000_000).expect("clock"),
        aggregator,
        Arc::new(EventStats::new()),
    )
}

fn bench_parse_event(c: &mut Criterion) {
    let cswitch = OwnedEvent::context_switch(3, 100, 200, 123_456_789);
    let thread = OwnedEvent::thread_start(200, 1337, 123_456_789);

    c.bench_function("parse_event/context_switch", |b| {
        b.iter(|| parse_event(black_box(&cswitch.as_raw())).expect("parse cswitch"))
    });

    c.bench_function("parse_event/thread_start", |b| {
        b.iter(|| parse_event(black_box(&thread.as_raw())).expect("parse thread"))
    });
}

fn bench_dispatch(c: &mut Criterion) {
    let events = build_stream(100_000);

    c.bench_function("dispatcher/100k_switches_16_cores", |b| {
        b.iter_batched(
            dispatcher,
            |mut d| {
                for event in &events {
                    d.on_event(black_box(&event.as_raw()));
                }
                black_box(d.finish())
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse_event(c);
    bench_dispatch(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
