use std::alloc::System;
use std::hint::black_box;
use std::sync::Arc;

use serial_test::serial;
use slicetrace::clock::ClockConverter;
use slicetrace::sched::{SchedulingSlice, SliceAggregator};
use slicetrace::tracer::dispatch::Dispatcher;
use slicetrace::tracer::event::OwnedEvent;
use slicetrace::tracer::parse::parse_event;
use slicetrace::tracer::stats::EventStats;
use slicetrace::tracer::EventHandler;
use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

const CORES: u16 = 8;
const THREADS: u32 = 64;

fn measure_alloc_counts<T>(f: impl FnOnce() -> T) -> (T, usize, usize) {
    // Calibrate for ambient allocator activity in the test harness process.
    let idle_region = Region::new(&GLOBAL);
    black_box(());
    let idle = idle_region.change();

    let region = Region::new(&GLOBAL);
    let output = f();
    let used = region.change();

    let allocations = used.allocations.saturating_sub(idle.allocations);
    let deallocations = used.deallocations.saturating_sub(idle.deallocations);
    (output, allocations, deallocations)
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

/// Every thread mapped and one switch recorded per core, so the tables
/// are already sized for the steady state.
fn warm_up(d: &mut Dispatcher) -> Vec<u32> {
    for tid in 0..THREADS {
        d.on_event(&OwnedEvent::thread_rundown_start(tid, 1_000 + tid / 4, 0).as_raw());
    }

    let running: Vec<u32> = (0..u32::from(CORES)).collect();
    for core in 0..CORES {
        let tid = running[usize::from(core)];
        d.on_event(&OwnedEvent::context_switch(core, THREADS - 1, tid, 1).as_raw());
    }
    running
}

/// Round-robin switches that keep every core's outgoing tid consistent.
fn steady_switches(mut running: Vec<u32>, count: usize) -> Vec<OwnedEvent> {
    let mut events = Vec::with_capacity(count);
    for i in 0..count {
        let core = (i % usize::from(CORES)) as u16;
        let idx = usize::from(core);
        let old = running[idx];
        let new = (old + u32::from(CORES)) % THREADS;
        running[idx] = new;
        events.push(OwnedEvent::context_switch(core, old, new, 10 + i as u64 * 25));
    }
    events
}

#[test]
#[serial]
fn parse_context_switch_allocates_zero() {
    let event = OwnedEvent::context_switch(3, 100, 200, 123_456_789);

    let (_parsed, allocations, deallocations) = measure_alloc_counts(|| {
        for _ in 0..512 {
            black_box(parse_event(&event.as_raw()).expect("parse cswitch"));
        }
    });

    assert_eq!(allocations, 0, "context switch parse allocated");
    assert_eq!(deallocations, 0, "context switch parse deallocated");
}

#[test]
#[serial]
fn steady_state_dispatch_allocates_zero() {
    let mut d = dispatcher();
    let running = warm_up(&mut d);
    let switches = steady_switches(running, 4_096);
    let remaps: Vec<OwnedEvent> = (0..THREADS)
        .map(|tid| OwnedEvent::thread_start(tid, 2_000 + tid, 5))
        .collect();

    let (_, allocations, deallocations) = measure_alloc_counts(|| {
        for event in &switches {
            d.on_event(&event.as_raw());
        }
        // Overwriting existing mappings stays within the table's storage.
        for event in &remaps {
            d.on_event(&event.as_raw());
        }
    });

    assert_eq!(
        allocations, 0,
        "dispatch hot path allocated {allocations} times"
    );
    assert_eq!(deallocations, 0);

    let (aggregator, counts) = d.finish();
    assert_eq!(aggregator.slices, 4_096);
    assert_eq!(aggregator.tid_mismatches, 0);
    assert_eq!(counts.malformed_events, 0);
}
