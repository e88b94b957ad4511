//! Span helpers for messages moving through a queue and for transport
//! retries.

use std::time::Duration;

use tracing::Span;

use crate::model::{MessageId, Status, WorkerId};

/// Span covering one handler invocation.
///
/// `message.status` starts empty and is filled by [`record_state_transition`].
pub fn start_message_span(queue: &str, id: MessageId, worker: &WorkerId, attempt: u32) -> Span {
    tracing::info_span!(
        "message.process",
        "queue" = queue,
        "message.id" = %id,
        "worker.id" = %worker,
        "message.attempt" = attempt,
        "message.status" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and emit an event inside it.
pub fn record_state_transition(span: &Span, from: Status, to: Status) {
    span.record("message.status", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = from.as_str(), to = to.as_str(), "state_transition");
    });
}

/// Span for one retry of a transport operation, tagged with the wait
/// before the next attempt.
pub fn retry_span(policy: &str, attempt: u32, wait: Duration) -> Span {
    tracing::warn_span!(
        "transport.retry",
        "policy" = policy,
        "retry.attempt" = attempt,
        "retry.wait_ms" = wait.as_millis() as u64,
    )
}
