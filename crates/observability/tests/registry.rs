//! Metric registry behavior under concurrency and failure.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::Harness;
use opentelemetry::KeyValue;
use service_observability::{InstrumentKind, InstrumentOptions, MetricRegistry, ObservabilityError};

#[test]
fn test_concurrent_registration_creates_one_instrument() {
    let harness = Harness::new();
    let before = harness.registry.len();
    let barrier = Arc::new(Barrier::new(16));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let registry = Arc::clone(&harness.registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let counter = registry
                    .counter("orders_placed_total", "Orders placed", &InstrumentOptions::new())
                    .unwrap();
                counter.add(1, &[KeyValue::new("channel", "web")]);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(harness.registry.len(), before + 1);
    let points = harness.u64_sum("orders_placed_total");
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].0, 16);
}

#[test]
fn test_first_description_wins() {
    let harness = Harness::new();
    let options = InstrumentOptions::new().with_unit("s");

    let first = harness
        .registry
        .histogram("job_duration_seconds", "Job duration", &options)
        .unwrap();
    let second = harness
        .registry
        .histogram("job_duration_seconds", "Something else", &InstrumentOptions::new())
        .unwrap();
    first.record(0.2, &[]);
    second.record(0.4, &[]);

    assert_eq!(harness.histogram_count("job_duration_seconds"), 2);
    assert!(harness.registry.contains(InstrumentKind::Histogram, "job_duration_seconds"));
}

#[test]
fn test_failed_creation_does_not_poison_the_cache() {
    let harness = Harness::new();
    let before = harness.registry.len();

    let err = harness
        .registry
        .up_down_counter("queue depth", "Queued jobs", &InstrumentOptions::new())
        .unwrap_err();
    assert!(matches!(
        err,
        ObservabilityError::Instrument {
            kind: InstrumentKind::UpDownCounter,
            ..
        }
    ));
    assert_eq!(harness.registry.len(), before);

    harness
        .registry
        .up_down_counter("queue_depth", "Queued jobs", &InstrumentOptions::new())
        .unwrap()
        .add(3, &[]);
    assert_eq!(harness.i64_sum_total("queue_depth"), 3);
}

#[test]
fn test_histogram_rejects_unsorted_boundaries() {
    let harness = Harness::new();
    let options = InstrumentOptions::new().with_boundaries(vec![1.0, 0.5]);

    assert!(harness.registry.histogram("latency_seconds", "Latency", &options).is_err());
    assert!(!harness.registry.contains(InstrumentKind::Histogram, "latency_seconds"));
}

#[test]
fn test_prefixed_registry_qualifies_names() {
    let harness = Harness::new();
    let registry = MetricRegistry::with_prefix(harness.registry.meter().clone(), "billing");

    registry
        .counter("invoices_total", "Invoices issued", &InstrumentOptions::new())
        .unwrap()
        .add(2, &[]);

    assert!(registry.contains(InstrumentKind::Counter, "invoices_total"));
    assert_eq!(harness.u64_sum("billing_invoices_total")[0].0, 2);
}
