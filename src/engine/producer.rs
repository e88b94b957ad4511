//! Producers validate messages and hand them to the transport.
//!
//! Sending never raises: each message gets a [`SendResult`] carrying either
//! its id or the error. Transient backend faults are absorbed by the
//! command policy; only malformed input and exhausted retries come back
//! as errors.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::QueueContext;
use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::model::{CountFilter, Message, NewMessage, SendResult, Status};
use crate::telemetry::metrics;
use crate::transport::Capabilities;
use crate::transport::blocking::BlockingTransport;

/// Check a message against what the transport can honor.
pub(crate) fn validate(capabilities: &Capabilities, message: &NewMessage) -> Result<()> {
    if message.message_type.trim().is_empty() {
        return Err(Error::Validation("message type must not be empty".into()));
    }
    if message.delay.is_some() && !capabilities.delayed {
        return Err(Error::Validation("transport does not support delayed messages".into()));
    }
    if let Some(expiration) = message.expiration {
        if !capabilities.expiration {
            return Err(Error::Validation("transport does not support expiration".into()));
        }
        if expiration.is_zero() {
            return Err(Error::Validation("expiration must be positive".into()));
        }
        if message.delay.is_some_and(|delay| delay >= expiration) {
            return Err(Error::Validation(
                "message would expire before it becomes visible".into(),
            ));
        }
    }
    if message.priority != 0 && !capabilities.priority {
        return Err(Error::Validation("transport does not support priority".into()));
    }
    match &message.route {
        Some(_) if !capabilities.route => {
            Err(Error::Validation("transport does not support routes".into()))
        }
        Some(route) if route.trim().is_empty() => {
            Err(Error::Validation("route must not be empty".into()))
        }
        _ => Ok(()),
    }
}

fn record_send(queue: &str, result: &'static str) {
    metrics::messages_sent().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("result", result),
        ],
    );
}

pub(crate) fn pending_filter() -> CountFilter {
    CountFilter::default()
        .status(Status::Pending)
        .status(Status::Delayed)
}

#[derive(Clone)]
pub struct Producer {
    ctx: Arc<QueueContext>,
}

impl Producer {
    pub(crate) fn new(ctx: Arc<QueueContext>) -> Self {
        Self { ctx }
    }

    pub async fn send(&self, message: NewMessage) -> SendResult {
        let queue = self.ctx.name();
        if let Err(e) = validate(&self.ctx.transport.capabilities(), &message) {
            warn!(queue, error = %e, "rejected message");
            record_send(queue, "invalid");
            return SendResult::failed(e);
        }

        let message = Message::from_new(message, self.ctx.now());
        let status = message.status;
        let transport = &self.ctx.transport;
        let result = self
            .ctx
            .command("enqueue", &CancellationToken::new(), || {
                transport.enqueue(message.clone())
            })
            .await;

        match result {
            Ok(id) => {
                debug!(queue, %id, %status, "message sent");
                record_send(queue, "ok");
                SendResult::sent(id)
            }
            Err(e) => {
                error!(queue, error = %e, "failed to send message");
                record_send(queue, "error");
                SendResult::failed(e)
            }
        }
    }

    /// Send each message in order. One failure does not stop the rest.
    pub async fn send_batch(
        &self,
        messages: impl IntoIterator<Item = NewMessage>,
    ) -> Vec<SendResult> {
        let mut results = Vec::new();
        for message in messages {
            results.push(self.send(message).await);
        }
        results
    }

    pub async fn pending_count(&self) -> Result<u64> {
        let transport = &self.ctx.transport;
        let filter = pending_filter();
        self.ctx.query("count", || transport.count(&filter)).await
    }
}

/// Synchronous producer. Do not use from inside an async context.
pub struct BlockingProducer {
    transport: BlockingTransport,
    clock: SharedClock,
}

impl BlockingProducer {
    pub(crate) fn new(transport: BlockingTransport, clock: SharedClock) -> Self {
        Self { transport, clock }
    }

    pub fn send(&self, message: NewMessage) -> SendResult {
        let queue = self.transport.queue_name();
        if let Err(e) = validate(&self.transport.capabilities(), &message) {
            warn!(queue, error = %e, "rejected message");
            record_send(queue, "invalid");
            return SendResult::failed(e);
        }

        let message = Message::from_new(message, self.clock.now());
        match self.transport.enqueue(message) {
            Ok(id) => {
                debug!(queue, %id, "message sent");
                record_send(queue, "ok");
                SendResult::sent(id)
            }
            Err(e) => {
                error!(queue, error = %e, "failed to send message");
                record_send(queue, "error");
                SendResult::failed(e)
            }
        }
    }

    pub fn send_batch(&self, messages: impl IntoIterator<Item = NewMessage>) -> Vec<SendResult> {
        messages.into_iter().map(|m| self.send(m)).collect()
    }

    pub fn pending_count(&self) -> Result<u64> {
        self.transport.count(&pending_filter())
    }
}
