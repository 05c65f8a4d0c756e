//! Metric instrument factories for docq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider installed, every instrument is a no-op.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("docq")
}

/// Counter: tasks submitted via `put`.
/// Labels: `queue`, `result` ("inserted" | "duplicate" | "invalid").
pub fn tasks_submitted() -> Counter<u64> {
    meter()
        .u64_counter("docq.tasks.submitted")
        .with_description("Number of tasks submitted")
        .build()
}

/// Counter: tasks upserted via `put_bulk`.
/// Labels: `queue`, `result` ("inserted" | "updated").
pub fn tasks_upserted() -> Counter<u64> {
    meter()
        .u64_counter("docq.tasks.upserted")
        .with_description("Number of tasks upserted in bulk")
        .build()
}

/// Counter: documents marked done.
/// Labels: `queue`.
pub fn tasks_completed() -> Counter<u64> {
    meter()
        .u64_counter("docq.tasks.completed")
        .with_description("Number of tasks marked done")
        .build()
}

/// Counter: documents deleted.
/// Labels: `queue`.
pub fn tasks_deleted() -> Counter<u64> {
    meter()
        .u64_counter("docq.tasks.deleted")
        .with_description("Number of tasks deleted")
        .build()
}

/// Counter: queue operations, successful or not.
/// Labels: `queue`, `operation`, `status` ("ok" | "error").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("docq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `queue`, `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("docq.operation.duration_ms")
        .with_description("Queue operation duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// `queue` label shared by every instrument.
pub fn queue_label(queue: &str) -> KeyValue {
    KeyValue::new("queue", queue.to_string())
}
