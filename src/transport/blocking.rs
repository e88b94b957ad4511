//! Synchronous access to any transport.
//!
//! [`BlockingTransport`] owns a current-thread runtime and drives each call
//! to completion on it, under the blocking variant of the queue's retry
//! policies. Do not call it from inside an async context.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Runtime;

use super::{Capabilities, StatusUpdate, Transport, record_operation};
use crate::error::Result;
use crate::model::{ClaimFilter, CountFilter, Message, MessageId, WorkerId};
use crate::policy::{PolicyKey, PolicyRegistry};

pub struct BlockingTransport {
    inner: Arc<dyn Transport>,
    policies: PolicyRegistry,
    runtime: Runtime,
}

impl BlockingTransport {
    pub fn new(inner: Arc<dyn Transport>, policies: PolicyRegistry) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            inner,
            policies,
            runtime,
        })
    }

    pub fn inner(&self) -> &Arc<dyn Transport> {
        &self.inner
    }

    pub fn queue_name(&self) -> &str {
        self.inner.queue_name()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn call<T, F, Fut>(&self, key: PolicyKey, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        record_operation(self.inner.queue_name(), operation);
        self.policies
            .get(key)?
            .execute_blocking(|| self.runtime.block_on(op()))
    }

    pub fn create_queue(&self) -> Result<()> {
        self.call(PolicyKey::COMMAND, "create_queue", || self.inner.create_queue())
    }

    pub fn remove_queue(&self) -> Result<()> {
        self.call(PolicyKey::COMMAND, "remove_queue", || self.inner.remove_queue())
    }

    pub fn enqueue(&self, message: Message) -> Result<MessageId> {
        self.call(PolicyKey::COMMAND, "enqueue", || {
            self.inner.enqueue(message.clone())
        })
    }

    pub fn try_claim(
        &self,
        worker: &WorkerId,
        filter: &ClaimFilter,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        self.call(PolicyKey::COMMAND, "try_claim", || {
            self.inner.try_claim(worker, filter, now)
        })
    }

    pub fn update_status(
        &self,
        id: MessageId,
        update: &StatusUpdate,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        self.call(PolicyKey::COMMAND, "update_status", || {
            self.inner.update_status(id, update, expected_version, now)
        })
    }

    pub fn delete(&self, id: MessageId) -> Result<bool> {
        self.call(PolicyKey::COMMAND, "delete", || self.inner.delete(id))
    }

    pub fn get(&self, id: MessageId) -> Result<Option<Message>> {
        self.call(PolicyKey::QUERY, "get", || self.inner.get(id))
    }

    pub fn count(&self, filter: &CountFilter) -> Result<u64> {
        self.call(PolicyKey::QUERY, "count", || self.inner.count(filter))
    }

    pub fn reset_heartbeat(
        &self,
        id: MessageId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.call(PolicyKey::COMMAND, "reset_heartbeat", || {
            self.inner.reset_heartbeat(id, worker, now)
        })
    }

    pub fn reclaim_dead(
        &self,
        now: DateTime<Utc>,
        dead_time: Duration,
        lookback: Option<Duration>,
    ) -> Result<Vec<MessageId>> {
        self.call(PolicyKey::COMMAND, "reclaim_dead", || {
            self.inner.reclaim_dead(now, dead_time, lookback)
        })
    }

    pub fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<MessageId>> {
        self.call(PolicyKey::COMMAND, "expire_due", || self.inner.expire_due(now))
    }

    pub fn promote_delayed(&self, now: DateTime<Utc>) -> Result<u64> {
        self.call(PolicyKey::COMMAND, "promote_delayed", || {
            self.inner.promote_delayed(now)
        })
    }
}
