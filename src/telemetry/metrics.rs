//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments come from the `"workq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("workq")
}

/// Counter: messages handed to the producer.
/// Labels: `queue`, `result` ("ok" | "invalid" | "error").
pub fn messages_sent() -> Counter<u64> {
    meter()
        .u64_counter("workq.messages.sent")
        .with_description("Number of messages sent")
        .build()
}

/// Counter: lifecycle transitions.
/// Labels: `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("workq.messages.state_transitions")
        .with_description("Number of message state transitions")
        .build()
}

/// Counter: transport calls.
/// Labels: `queue`, `operation`.
pub fn transport_operations() -> Counter<u64> {
    meter()
        .u64_counter("workq.transport.operations")
        .with_description("Number of transport operations")
        .build()
}

/// Counter: retries performed by a transport policy.
/// Labels: `policy`.
pub fn policy_retries() -> Counter<u64> {
    meter()
        .u64_counter("workq.policy.retries")
        .with_description("Transport operation retries")
        .build()
}

/// Counter: claims recovered from silent workers.
/// Labels: `queue`.
pub fn reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("workq.monitor.reclaimed")
        .with_description("Messages reclaimed from dead workers")
        .build()
}

/// Counter: messages moved to Expired by the monitor.
/// Labels: `queue`.
pub fn expired() -> Counter<u64> {
    meter()
        .u64_counter("workq.monitor.expired")
        .with_description("Messages expired before processing")
        .build()
}

/// Histogram: handler run time in milliseconds.
/// Labels: `queue`, `outcome`.
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workq.handler.duration_ms")
        .with_description("Handler duration in milliseconds")
        .with_unit("ms")
        .build()
}
