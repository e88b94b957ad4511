//! In-process transport.
//!
//! Messages live in a map behind one lock; every operation runs as a
//! single critical section, which gives the same atomic claim and
//! conditional update guarantees a database row lock does. Only workers
//! in the same process can share it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{Capabilities, StatusUpdate, Transport, reclaim_floor};
use crate::error::{Error, Result};
use crate::model::{
    ClaimFilter, CountFilter, Message, MessageId, PriorityOrder, Status, WorkerId,
};

#[derive(Debug)]
pub struct MemoryTransport {
    queue: String,
    capabilities: Capabilities,
    store: Mutex<Store>,
}

#[derive(Debug, Default)]
struct Store {
    messages: HashMap<MessageId, Stored>,
    next_seq: u64,
}

#[derive(Debug)]
struct Stored {
    message: Message,
    /// Insertion order, breaks `queued_at` ties.
    seq: u64,
}

impl MemoryTransport {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            capabilities: Capabilities::ALL,
            store: Mutex::new(Store::default()),
        }
    }

    /// Advertise a reduced feature set.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

fn priority_key(order: PriorityOrder, priority: u16) -> i32 {
    match order {
        PriorityOrder::LowestFirst => i32::from(priority),
        PriorityOrder::HighestFirst => -i32::from(priority),
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn create_queue(&self) -> Result<()> {
        Ok(())
    }

    async fn remove_queue(&self) -> Result<()> {
        self.store.lock().messages.clear();
        Ok(())
    }

    async fn enqueue(&self, message: Message) -> Result<MessageId> {
        let mut store = self.store.lock();
        let id = message.id;
        // A retried enqueue that already landed.
        if store.messages.contains_key(&id) {
            return Ok(id);
        }
        let seq = store.next_seq;
        store.next_seq += 1;
        store.messages.insert(id, Stored { message, seq });
        Ok(id)
    }

    async fn try_claim(
        &self,
        worker: &WorkerId,
        filter: &ClaimFilter,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        let mut store = self.store.lock();
        let next = store
            .messages
            .values_mut()
            .filter(|s| s.message.is_claimable(now) && filter.matches(&s.message))
            .min_by_key(|s| {
                (
                    priority_key(filter.priority_order, s.message.priority),
                    s.message.queued_at,
                    s.seq,
                )
            });

        Ok(next.map(|stored| {
            let message = &mut stored.message;
            message.status = Status::Working;
            message.lock_owner = Some(worker.clone());
            message.lock_heartbeat_at = Some(now);
            message.attempt_count += 1;
            message.version += 1;
            message.updated_at = now;
            message.clone()
        }))
    }

    async fn update_status(
        &self,
        id: MessageId,
        update: &StatusUpdate,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        update.validate()?;
        let mut store = self.store.lock();
        let stored = store
            .messages
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("message {id}")))?;
        let message = &mut stored.message;
        if message.status != update.from || message.version != expected_version {
            return Err(Error::StaleState {
                id,
                expected: update.from,
                actual: message.status,
            });
        }
        update.apply(message, now);
        Ok(message.clone())
    }

    async fn delete(&self, id: MessageId) -> Result<bool> {
        Ok(self.store.lock().messages.remove(&id).is_some())
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        Ok(self.store.lock().messages.get(&id).map(|s| s.message.clone()))
    }

    async fn count(&self, filter: &CountFilter) -> Result<u64> {
        let store = self.store.lock();
        Ok(store
            .messages
            .values()
            .filter(|s| filter.matches(&s.message))
            .count() as u64)
    }

    async fn reset_heartbeat(
        &self,
        id: MessageId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut store = self.store.lock();
        match store.messages.get_mut(&id).map(|s| &mut s.message) {
            Some(message)
                if message.status == Status::Working
                    && message.lock_owner.as_ref() == Some(worker) =>
            {
                message.lock_heartbeat_at = Some(now);
                Ok(())
            }
            _ => Err(Error::LostClaim {
                id,
                worker: worker.to_string(),
            }),
        }
    }

    async fn reclaim_dead(
        &self,
        now: DateTime<Utc>,
        dead_time: Duration,
        lookback: Option<Duration>,
    ) -> Result<Vec<MessageId>> {
        let floor = reclaim_floor(now, dead_time, lookback);
        let release = StatusUpdate::rollback();
        let mut store = self.store.lock();
        let mut reclaimed = Vec::new();
        for stored in store.messages.values_mut() {
            let message = &mut stored.message;
            let in_window = match (floor, message.lock_heartbeat_at) {
                (Some(floor), Some(at)) => at >= floor,
                _ => true,
            };
            if message.is_claim_dead(now, dead_time) && in_window {
                release.apply(message, now);
                reclaimed.push(message.id);
            }
        }
        Ok(reclaimed)
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<MessageId>> {
        let mut store = self.store.lock();
        let mut expired = Vec::new();
        for stored in store.messages.values_mut() {
            let message = &mut stored.message;
            if matches!(message.status, Status::Delayed | Status::Pending)
                && message.is_expired(now)
            {
                StatusUpdate::new(message.status, Status::Expired).apply(message, now);
                expired.push(message.id);
            }
        }
        Ok(expired)
    }

    async fn promote_delayed(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut store = self.store.lock();
        let mut promoted = 0;
        for stored in store.messages.values_mut() {
            let message = &mut stored.message;
            if message.status == Status::Delayed
                && message.visible_at.is_none_or(|at| at <= now)
                && !message.is_expired(now)
            {
                message.status = Status::Pending;
                message.visible_at = None;
                message.version += 1;
                message.updated_at = now;
                promoted += 1;
            }
        }
        Ok(promoted)
    }
}
