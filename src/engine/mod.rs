//! Queue engine: producers, the worker pool, and the background monitors
//! that keep claims, delays and expirations honest.

pub mod consumer;
pub mod delayed;
pub mod expiration;
pub mod heartbeat;
pub mod monitor;
pub mod producer;
pub mod queue;
pub mod worker;

pub use consumer::Consumer;
pub use delayed::DelayedMonitor;
pub use expiration::ExpirationMonitor;
pub use heartbeat::{ClaimRegistry, HeartbeatMonitor, HeartbeatPass};
pub use monitor::Monitor;
pub use producer::{BlockingProducer, Producer};
pub use queue::{Queue, QueueBuilder};
pub use worker::{HandlerError, MessageHandler, WorkerNotification, handler_fn};

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::clock::SharedClock;
use crate::error::Result;
use crate::model::Status;
use crate::policy::{PolicyKey, PolicyRegistry};
use crate::telemetry::{message::record_state_transition, metrics};
use crate::transport::{Transport, record_operation};

/// What every engine component of one queue shares.
pub(crate) struct QueueContext {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) policies: PolicyRegistry,
    pub(crate) clock: SharedClock,
}

impl QueueContext {
    pub(crate) fn name(&self) -> &str {
        self.transport.queue_name()
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run a state-changing transport call under the command policy.
    pub(crate) async fn command<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        record_operation(self.name(), operation);
        self.policies.get(PolicyKey::COMMAND)?.execute(cancel, op).await
    }

    /// Run a read-only transport call under the query policy.
    pub(crate) async fn query<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        record_operation(self.name(), operation);
        self.policies
            .get(PolicyKey::QUERY)?
            .execute(&CancellationToken::new(), op)
            .await
    }
}

/// Record a lifecycle transition on the span and in the metrics.
pub(crate) fn note_transition(span: &Span, from: Status, to: Status) {
    record_state_transition(span, from, to);
    metrics::state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}
