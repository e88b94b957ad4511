//! Storage transport contract.
//!
//! A transport stores the messages of one queue and provides the atomic
//! operations the engine builds on. Mutual exclusion between workers is
//! the transport's job: claims, status updates and reclamation are
//! conditional writes, so workers in different processes can share one
//! backend.
//!
//! The engine passes "now" into every time-dependent call so storage and
//! engine agree on delay, expiration and heartbeat boundaries.

pub mod blocking;
pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;

use crate::error::{Error, Result};
use crate::model::{ClaimFilter, CountFilter, Message, MessageId, Status, WorkerId};
use crate::telemetry::metrics;

pub use memory::MemoryTransport;
pub use postgres::PostgresTransport;

/// Optional features a transport supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Claims can be released back to Pending.
    pub rollback: bool,
    /// Claims carry a heartbeat that can be refreshed and reclaimed.
    pub heartbeat: bool,
    /// Messages may carry a delay.
    pub delayed: bool,
    /// Messages may carry an expiration.
    pub expiration: bool,
    pub priority: bool,
    pub route: bool,
    /// Status is queryable through `count`.
    pub status: bool,
}

impl Capabilities {
    pub const ALL: Capabilities = Capabilities {
        rollback: true,
        heartbeat: true,
        delayed: true,
        expiration: true,
        priority: true,
        route: true,
        status: true,
    };
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::ALL
    }
}

/// A status change requested by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub from: Status,
    pub to: Status,
    /// New visibility instant. Only meaningful for `to == Pending`.
    pub visible_at: Option<DateTime<Utc>>,
    /// Recorded in `last_error` when set.
    pub error: Option<String>,
    /// Error kind whose failure count this update increments.
    pub failure_kind: Option<String>,
}

impl StatusUpdate {
    pub fn new(from: Status, to: Status) -> Self {
        Self {
            from,
            to,
            visible_at: None,
            error: None,
            failure_kind: None,
        }
    }

    pub fn complete() -> Self {
        Self::new(Status::Working, Status::Complete)
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self::new(Status::Working, Status::Error).error(error)
    }

    /// Release the claim without recording a failure.
    pub fn rollback() -> Self {
        Self::new(Status::Working, Status::Pending)
    }

    /// Release the claim after a failure, redelivering no earlier than
    /// `visible_at`.
    pub fn requeue(error: impl Into<String>, visible_at: Option<DateTime<Utc>>) -> Self {
        Self {
            visible_at,
            ..Self::rollback().error(error)
        }
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Count this update as one failure of `kind`.
    pub fn failure(mut self, kind: impl Into<String>) -> Self {
        self.failure_kind = Some(kind.into());
        self
    }

    /// Reject edges outside the lifecycle graph and claims, which only go
    /// through [`Transport::try_claim`].
    pub fn validate(&self) -> Result<()> {
        if self.to == Status::Working || !self.from.can_transition_to(self.to) {
            return Err(Error::InvalidTransition {
                from: self.from,
                to: self.to,
            });
        }
        Ok(())
    }

    /// Apply to a stored message after the version check passed.
    pub fn apply(&self, message: &mut Message, now: DateTime<Utc>) {
        message.status = self.to;
        message.version += 1;
        message.updated_at = now;
        if self.to == Status::Pending {
            message.lock_owner = None;
            message.lock_heartbeat_at = None;
            message.visible_at = self.visible_at;
        }
        if let Some(error) = &self.error {
            message.last_error = Some(error.clone());
        }
        if let Some(kind) = &self.failure_kind {
            *message.failures.entry(kind.clone()).or_insert(0) += 1;
        }
    }
}

/// Operations a storage backend provides.
///
/// Every method has a blocking counterpart in
/// [`blocking::BlockingTransport`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queue this transport serves.
    fn queue_name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Create backing storage. Idempotent.
    async fn create_queue(&self) -> Result<()>;

    /// Drop every message of the queue.
    async fn remove_queue(&self) -> Result<()>;

    /// Store a new message. Enqueueing an id that already exists is a
    /// no-op, so a retried enqueue never duplicates.
    async fn enqueue(&self, message: Message) -> Result<MessageId>;

    /// Atomically claim the next eligible message.
    ///
    /// Eligible: status Pending or Delayed, `visible_at <= now`, not
    /// expired at `now`, matching `filter`. Ordered by priority, then
    /// `queued_at`. Sets the owner and heartbeat, increments
    /// `attempt_count`, bumps `version`. `None` means the queue is empty
    /// for this filter.
    async fn try_claim(
        &self,
        worker: &WorkerId,
        filter: &ClaimFilter,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>>;

    /// Apply `update` if the message is still in `update.from` at
    /// `expected_version`, else fail with `StaleState`.
    async fn update_status(
        &self,
        id: MessageId,
        update: &StatusUpdate,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<Message>;

    /// Returns false if the message did not exist.
    async fn delete(&self, id: MessageId) -> Result<bool>;

    async fn get(&self, id: MessageId) -> Result<Option<Message>>;

    async fn count(&self, filter: &CountFilter) -> Result<u64>;

    /// Refresh the heartbeat of a claim `worker` holds, or fail with
    /// `LostClaim`.
    async fn reset_heartbeat(
        &self,
        id: MessageId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Return to Pending every Working message silent for longer than
    /// `dead_time`, looking back at most `lookback` past the dead-time when
    /// set. Each message is reclaimed by exactly one caller.
    async fn reclaim_dead(
        &self,
        now: DateTime<Utc>,
        dead_time: Duration,
        lookback: Option<Duration>,
    ) -> Result<Vec<MessageId>>;

    /// Move Delayed and Pending messages past `expires_at` to Expired.
    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<MessageId>>;

    /// Move Delayed messages whose `visible_at` has arrived to Pending.
    async fn promote_delayed(&self, now: DateTime<Utc>) -> Result<u64>;
}

pub(crate) fn record_operation(queue: &str, operation: &'static str) {
    metrics::transport_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

/// Oldest heartbeat a reclaim scan considers, or None for unbounded.
pub(crate) fn reclaim_floor(
    now: DateTime<Utc>,
    dead_time: Duration,
    lookback: Option<Duration>,
) -> Option<DateTime<Utc>> {
    let span = chrono::Duration::from_std(dead_time.checked_add(lookback?)?).ok()?;
    now.checked_sub_signed(span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_are_not_status_updates() {
        assert!(StatusUpdate::new(Status::Pending, Status::Working).validate().is_err());
        assert!(StatusUpdate::new(Status::Complete, Status::Pending).validate().is_err());
        assert!(StatusUpdate::complete().validate().is_ok());
    }

    #[test]
    fn requeue_clears_claim_and_sets_visibility() {
        let now = Utc::now();
        let mut message = Message::from_new(crate::model::NewMessage::new("t", "x"), now);
        message.status = Status::Working;
        message.lock_owner = Some(WorkerId::from("w"));
        message.lock_heartbeat_at = Some(now);

        let later = now + chrono::Duration::seconds(5);
        StatusUpdate::requeue("boom", Some(later)).apply(&mut message, now);

        assert_eq!(message.status, Status::Pending);
        assert_eq!(message.lock_owner, None);
        assert_eq!(message.visible_at, Some(later));
        assert_eq!(message.last_error.as_deref(), Some("boom"));
        assert_eq!(message.version, 1);
        assert!(message.failures.is_empty());
    }

    #[test]
    fn failures_are_counted_per_kind() {
        let now = Utc::now();
        let mut message = Message::from_new(crate::model::NewMessage::new("t", "x"), now);

        for kind in ["io", "timeout", "io"] {
            message.status = Status::Working;
            StatusUpdate::requeue("boom", None)
                .failure(kind)
                .apply(&mut message, now);
        }
        message.status = Status::Working;
        StatusUpdate::rollback().apply(&mut message, now);

        assert_eq!(message.failures_of("io"), 2);
        assert_eq!(message.failures_of("timeout"), 1);
        assert_eq!(message.failures_of("panic"), 0);
    }
}
