//! Queue operation span helpers.
//!
//! Every engine operation runs inside a `queue.<op>` span and ends with
//! [`finish_operation`], which records its duration and status.

use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::Span;

use super::metrics;

/// Start a span for one queue operation.
///
/// The `queue.result` field is declared empty and filled by
/// [`record_result`].
pub fn start_operation_span(queue: &str, operation: &'static str) -> Span {
    tracing::info_span!(
        "queue.operation",
        "queue.name" = queue,
        "queue.operation" = operation,
        "queue.result" = tracing::field::Empty,
    )
}

/// Record a short result description on the span (e.g. "inserted").
pub fn record_result(span: &Span, result: &str) {
    span.record("queue.result", result);
}

/// Record duration and ok/error status for an operation started at `started`.
pub fn finish_operation(queue: &str, operation: &'static str, started: Instant, ok: bool) {
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    metrics::operation_duration_ms().record(
        elapsed_ms,
        &[
            metrics::queue_label(queue),
            KeyValue::new("operation", operation),
        ],
    );
    metrics::queue_operations().add(
        1,
        &[
            metrics::queue_label(queue),
            KeyValue::new("operation", operation),
            KeyValue::new("status", if ok { "ok" } else { "error" }),
        ],
    );
}
