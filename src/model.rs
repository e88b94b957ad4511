//! Core data model.
//!
//! A message is a unit of work on a named queue. It has identity, an opaque
//! payload with a type tag, headers, and the queue-control fields the engine
//! uses to schedule, claim and retire it.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A message tracked by a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique per queue.
    pub id: MessageId,

    /// Type tag. Consumers may filter claims by it.
    pub message_type: String,

    /// Opaque body. The engine never interprets it.
    pub body: Vec<u8>,

    pub headers: Headers,

    /// Current lifecycle state.
    pub status: Status,

    pub queued_at: DateTime<Utc>,

    /// Earliest claim instant. None = immediately visible.
    pub visible_at: Option<DateTime<Utc>>,

    /// After this instant the message can only become Expired.
    pub expires_at: Option<DateTime<Utc>>,

    pub priority: u16,

    /// Partition key; only workers filtering on the same route claim it.
    pub route: Option<String>,

    /// Worker holding the claim, if any.
    pub lock_owner: Option<WorkerId>,

    /// Last liveness refresh of the claim.
    pub lock_heartbeat_at: Option<DateTime<Utc>>,

    /// Number of claims so far. Only ever increases.
    pub attempt_count: u32,

    /// Optimistic concurrency token, bumped on every status change.
    /// Heartbeat refreshes leave it alone.
    pub version: u64,

    /// Last handler error recorded against the message.
    pub last_error: Option<String>,

    /// Handler failures so far, per error kind. Rollbacks and reclaims
    /// leave it alone.
    #[serde(default)]
    pub failures: BTreeMap<String, u32>,

    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Build the stored form of a new message.
    pub fn from_new(new: NewMessage, now: DateTime<Utc>) -> Self {
        let visible_at = new.delay.and_then(|d| offset(now, d));
        let expires_at = new.expiration.and_then(|d| offset(now, d));
        let status = if visible_at.is_some_and(|at| at > now) {
            Status::Delayed
        } else {
            Status::Pending
        };

        Self {
            id: MessageId::new(),
            message_type: new.message_type,
            body: new.body,
            headers: new.headers,
            status,
            queued_at: now,
            visible_at,
            expires_at,
            priority: new.priority,
            route: new.route,
            lock_owner: None,
            lock_heartbeat_at: None,
            attempt_count: 0,
            version: 0,
            last_error: None,
            failures: BTreeMap::new(),
            updated_at: now,
        }
    }

    /// Can a worker claim this message at `now`?
    ///
    /// Delay is inclusive at the boundary; expiration is exclusive.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, Status::Pending | Status::Delayed)
            && self.visible_at.is_none_or(|at| at <= now)
            && !self.is_expired(now)
    }

    /// Decode a JSON body.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> crate::error::Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Failures recorded so far for `kind`.
    pub fn failures_of(&self, kind: &str) -> u32 {
        self.failures.get(kind).copied().unwrap_or(0)
    }

    /// Status a freshly claimed message left.
    ///
    /// Only Delayed messages carry a `visible_at` past their `queued_at`
    /// into their first claim; promotion and every release clear or
    /// replace it.
    pub fn claimed_from(&self) -> Status {
        if self.attempt_count == 1 && self.visible_at.is_some_and(|at| at > self.queued_at) {
            Status::Delayed
        } else {
            Status::Pending
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Has the claim gone silent for longer than `dead_time`?
    pub fn is_claim_dead(&self, now: DateTime<Utc>, dead_time: Duration) -> bool {
        if self.status != Status::Working {
            return false;
        }
        match (self.lock_heartbeat_at, chrono::Duration::from_std(dead_time)) {
            (Some(at), Ok(dead)) => now - at > dead,
            (None, _) => true,
            (_, Err(_)) => false,
        }
    }
}

/// `now + d`, or None if it does not fit in a timestamp.
pub fn offset(now: DateTime<Utc>, d: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
}

/// Newtype for message IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(MessageId)
    }
}

/// Identity of a worker session. Unique per process and loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// A fresh id of the form `<pid>-<uuid prefix>-<index>`.
    pub fn generate(index: usize) -> Self {
        let nonce = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}-{index}", std::process::id(), &nonce[..8]))
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for `visible_at`.
    Delayed,
    /// Claimable.
    Pending,
    /// Claimed by a worker.
    Working,
    /// Handler succeeded. Terminal.
    Complete,
    /// Handler failed and the message will not be retried. Terminal.
    Error,
    /// Passed `expires_at` before it was processed. Terminal.
    Expired,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Delayed,
        Status::Pending,
        Status::Working,
        Status::Complete,
        Status::Error,
        Status::Expired,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Delayed, Pending)
                | (Pending, Working)
                | (Delayed, Working)    // claim unified with the delay check
                | (Working, Complete)
                | (Working, Error)
                | (Working, Pending)    // requeue, rollback, reclamation
                | (Delayed, Expired)
                | (Pending, Expired)
                | (Working, Expired)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Complete | Status::Error | Status::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Delayed => "delayed",
            Status::Pending => "pending",
            Status::Working => "working",
            Status::Complete => "complete",
            Status::Error => "error",
            Status::Expired => "expired",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "delayed" => Ok(Status::Delayed),
            "pending" => Ok(Status::Pending),
            "working" => Ok(Status::Working),
            "complete" => Ok(Status::Complete),
            "error" => Ok(Status::Error),
            "expired" => Ok(Status::Expired),
            _ => Err(crate::error::Error::Other(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Standard headers plus user-defined ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub custom: BTreeMap<String, serde_json::Value>,
}

impl Headers {
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.custom.get(key)
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Which end of the priority range is claimed first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityOrder {
    #[default]
    LowestFirst,
    HighestFirst,
}

/// Restricts which messages a worker may claim.
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    /// Only claim messages on one of these routes. Empty = unrouted only.
    pub routes: Vec<String>,
    /// Only claim these message types. Empty = any.
    pub message_types: Vec<String>,
    pub priority_order: PriorityOrder,
}

impl ClaimFilter {
    pub fn route(mut self, route: impl Into<String>) -> Self {
        self.routes.push(route.into());
        self
    }

    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_types.push(message_type.into());
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        let route_ok = match &message.route {
            Some(route) => self.routes.iter().any(|r| r == route),
            None => self.routes.is_empty(),
        };
        let type_ok = self.message_types.is_empty()
            || self.message_types.iter().any(|t| *t == message.message_type);
        route_ok && type_ok
    }
}

/// Selects messages for `count`.
#[derive(Debug, Clone, Default)]
pub struct CountFilter {
    /// Empty = every status.
    pub statuses: Vec<Status>,
    pub route: Option<String>,
    pub message_type: Option<String>,
}

impl CountFilter {
    pub fn status(mut self, status: Status) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&message.status))
            && self.route.as_ref().is_none_or(|r| message.route.as_ref() == Some(r))
            && self
                .message_type
                .as_ref()
                .is_none_or(|t| *t == message.message_type)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new messages. The producer's public input type.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub(crate) message_type: String,
    pub(crate) body: Vec<u8>,
    pub(crate) headers: Headers,
    pub(crate) delay: Option<Duration>,
    pub(crate) expiration: Option<Duration>,
    pub(crate) priority: u16,
    pub(crate) route: Option<String>,
}

impl NewMessage {
    pub fn new(message_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            message_type: message_type.into(),
            body: body.into(),
            headers: Headers::default(),
            delay: None,
            expiration: None,
            priority: 0,
            route: None,
        }
    }

    /// Serialize `value` as the JSON body.
    pub fn json<T: Serialize>(
        message_type: impl Into<String>,
        value: &T,
    ) -> crate::error::Result<Self> {
        Ok(Self::new(message_type, serde_json::to_vec(value)?))
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    pub fn route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.headers.correlation_id = Some(id.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.headers.custom.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Send result
// ---------------------------------------------------------------------------

/// Outcome of sending one message. Carries the error instead of raising it.
#[derive(Debug)]
pub struct SendResult {
    pub id: Option<MessageId>,
    pub error: Option<crate::error::Error>,
}

impl SendResult {
    pub fn sent(id: MessageId) -> Self {
        Self {
            id: Some(id),
            error: None,
        }
    }

    pub fn failed(error: crate::error::Error) -> Self {
        Self {
            id: None,
            error: Some(error),
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in Status::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in Status::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn claim_only_from_pre_working_states() {
        assert!(Status::Pending.can_transition_to(Status::Working));
        assert!(Status::Delayed.can_transition_to(Status::Working));
        assert!(!Status::Working.can_transition_to(Status::Working));
    }

    #[test]
    fn delayed_message_becomes_claimable_at_visible_at() {
        let now = Utc::now();
        let msg = Message::from_new(NewMessage::new("t", "x").delay(Duration::from_secs(10)), now);
        assert_eq!(msg.status, Status::Delayed);
        assert!(!msg.is_claimable(now));
        assert!(!msg.is_claimable(now + chrono::Duration::seconds(9)));
        assert!(msg.is_claimable(now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn expired_message_is_not_claimable() {
        let now = Utc::now();
        let msg = Message::from_new(
            NewMessage::new("t", "x").expiration(Duration::from_secs(1)),
            now,
        );
        assert!(msg.is_claimable(now));
        assert!(!msg.is_claimable(now + chrono::Duration::seconds(2)));
    }

    #[test]
    fn route_filter_separates_partitions() {
        let now = Utc::now();
        let routed = Message::from_new(NewMessage::new("t", "x").route("blue"), now);
        let plain = Message::from_new(NewMessage::new("t", "x"), now);

        let blue = ClaimFilter::default().route("blue");
        assert!(blue.matches(&routed));
        assert!(!blue.matches(&plain));
        assert!(ClaimFilter::default().matches(&plain));
        assert!(!ClaimFilter::default().matches(&routed));
    }
}
