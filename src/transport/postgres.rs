//! Postgres transport.
//!
//! All queues share the `workq_messages` table, partitioned by
//! `queue_name`. Claims and reclaims select with `FOR UPDATE SKIP LOCKED`
//! so concurrent workers never block on or double-claim a row; every
//! status change is conditional on `(id, status, version)`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use super::{Capabilities, StatusUpdate, Transport, reclaim_floor};
use crate::error::{Error, Result};
use crate::model::{
    ClaimFilter, CountFilter, Headers, Message, MessageId, PriorityOrder, Status, WorkerId,
};

const COLUMNS: &str = "id, message_type, body, headers, status, queued_at, visible_at, expires_at, \
     priority, route, lock_owner, lock_heartbeat_at, attempt_count, version, last_error, failures, \
     updated_at";

/// SQLSTATE codes worth retrying: serialization failure, deadlock, lock
/// not available, query canceled, too many connections.
const TRANSIENT_SQLSTATES: [&str; 5] = ["40001", "40P01", "55P03", "57014", "53300"];

pub struct PostgresTransport {
    pool: PgPool,
    queue: String,
}

impl PostgresTransport {
    pub async fn connect(url: &str, queue: impl Into<String>) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(classify)?;
        Ok(Self::from_pool(pool, queue))
    }

    pub fn from_pool(pool: PgPool, queue: impl Into<String>) -> Self {
        Self {
            pool,
            queue: queue.into(),
        }
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn current_status(&self, id: MessageId) -> Result<Option<Status>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM workq_messages WHERE queue_name = $1 AND id = $2")
                .bind(&self.queue)
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(classify)?;
        row.map(|(status,)| status.parse()).transpose()
    }
}

/// Map backend faults that a retry can fix to `Error::Transient`.
pub fn classify(e: sqlx::Error) -> Error {
    let transient = match &e {
        sqlx::Error::Database(db) => db.code().is_some_and(|code| {
            let code: &str = &code;
            TRANSIENT_SQLSTATES.contains(&code) || code.starts_with("08")
        }),
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        _ => false,
    };
    if transient {
        Error::Transient(e.to_string())
    } else {
        Error::Database(e)
    }
}

fn before(now: DateTime<Utc>, d: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .ok_or_else(|| Error::Config(format!("duration out of range: {d:?}")))
}

#[async_trait]
impl Transport for PostgresTransport {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    async fn create_queue(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn remove_queue(&self) -> Result<()> {
        sqlx::query("DELETE FROM workq_messages WHERE queue_name = $1")
            .bind(&self.queue)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn enqueue(&self, message: Message) -> Result<MessageId> {
        let headers = serde_json::to_value(&message.headers)?;
        sqlx::query(
            "INSERT INTO workq_messages (id, queue_name, message_type, body, headers, status, queued_at, visible_at, expires_at, priority, route, attempt_count, version, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 0, 0, $7)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(message.id.0)
        .bind(&self.queue)
        .bind(&message.message_type)
        .bind(&message.body)
        .bind(headers)
        .bind(message.status.as_str())
        .bind(message.queued_at)
        .bind(message.visible_at)
        .bind(message.expires_at)
        .bind(i32::from(message.priority))
        .bind(&message.route)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(message.id)
    }

    async fn try_claim(
        &self,
        worker: &WorkerId,
        filter: &ClaimFilter,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        let direction = match filter.priority_order {
            PriorityOrder::LowestFirst => "ASC",
            PriorityOrder::HighestFirst => "DESC",
        };
        let sql = format!(
            "UPDATE workq_messages
             SET status = 'working', lock_owner = $1, lock_heartbeat_at = $2,
                 attempt_count = attempt_count + 1, version = version + 1, updated_at = $2
             WHERE id = (
                 SELECT id FROM workq_messages
                 WHERE queue_name = $3
                   AND status IN ('pending', 'delayed')
                   AND (visible_at IS NULL OR visible_at <= $2)
                   AND (expires_at IS NULL OR expires_at > $2)
                   AND (CASE WHEN cardinality($4::text[]) = 0 THEN route IS NULL ELSE route = ANY($4) END)
                   AND (cardinality($5::text[]) = 0 OR message_type = ANY($5))
                 ORDER BY priority {direction}, queued_at ASC, seq ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {COLUMNS}"
        );
        let row: Option<MessageRow> = sqlx::query_as(&sql)
            .bind(&worker.0)
            .bind(now)
            .bind(&self.queue)
            .bind(&filter.routes)
            .bind(&filter.message_types)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;
        row.map(MessageRow::try_into_message).transpose()
    }

    async fn update_status(
        &self,
        id: MessageId,
        update: &StatusUpdate,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        update.validate()?;
        let sql = format!(
            "UPDATE workq_messages
             SET status = $1, version = version + 1, updated_at = $2,
                 lock_owner = CASE WHEN $1 = 'pending' THEN NULL ELSE lock_owner END,
                 lock_heartbeat_at = CASE WHEN $1 = 'pending' THEN NULL ELSE lock_heartbeat_at END,
                 visible_at = CASE WHEN $1 = 'pending' THEN $3 ELSE visible_at END,
                 last_error = COALESCE($4, last_error),
                 failures = CASE WHEN $9::text IS NULL THEN failures
                     ELSE jsonb_set(failures, ARRAY[$9::text],
                                    to_jsonb(COALESCE((failures ->> $9::text)::int, 0) + 1))
                 END
             WHERE queue_name = $5 AND id = $6 AND status = $7 AND version = $8
             RETURNING {COLUMNS}"
        );
        let row: Option<MessageRow> = sqlx::query_as(&sql)
            .bind(update.to.as_str())
            .bind(now)
            .bind(update.visible_at)
            .bind(&update.error)
            .bind(&self.queue)
            .bind(id.0)
            .bind(update.from.as_str())
            .bind(expected_version as i64)
            .bind(&update.failure_kind)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;

        match row {
            Some(row) => row.try_into_message(),
            None => match self.current_status(id).await? {
                Some(actual) => Err(Error::StaleState {
                    id,
                    expected: update.from,
                    actual,
                }),
                None => Err(Error::NotFound(format!("message {id}"))),
            },
        }
    }

    async fn delete(&self, id: MessageId) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM workq_messages WHERE queue_name = $1 AND id = $2")
            .bind(&self.queue)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(classify)?
            .rows_affected();
        Ok(rows > 0)
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        let sql =
            format!("SELECT {COLUMNS} FROM workq_messages WHERE queue_name = $1 AND id = $2");
        let row: Option<MessageRow> = sqlx::query_as(&sql)
            .bind(&self.queue)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;
        row.map(MessageRow::try_into_message).transpose()
    }

    async fn count(&self, filter: &CountFilter) -> Result<u64> {
        let statuses: Vec<&str> = filter.statuses.iter().map(|s| s.as_str()).collect();
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM workq_messages
             WHERE queue_name = $1
               AND (cardinality($2::text[]) = 0 OR status = ANY($2))
               AND ($3::text IS NULL OR route = $3)
               AND ($4::text IS NULL OR message_type = $4)",
        )
        .bind(&self.queue)
        .bind(&statuses)
        .bind(&filter.route)
        .bind(&filter.message_type)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;
        Ok(count.max(0) as u64)
    }

    async fn reset_heartbeat(
        &self,
        id: MessageId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let rows = sqlx::query(
            "UPDATE workq_messages SET lock_heartbeat_at = $1
             WHERE queue_name = $2 AND id = $3 AND status = 'working' AND lock_owner = $4",
        )
        .bind(now)
        .bind(&self.queue)
        .bind(id.0)
        .bind(&worker.0)
        .execute(&self.pool)
        .await
        .map_err(classify)?
        .rows_affected();

        if rows == 0 {
            return Err(Error::LostClaim {
                id,
                worker: worker.to_string(),
            });
        }
        Ok(())
    }

    async fn reclaim_dead(
        &self,
        now: DateTime<Utc>,
        dead_time: Duration,
        lookback: Option<Duration>,
    ) -> Result<Vec<MessageId>> {
        let cutoff = before(now, dead_time)?;
        let floor = reclaim_floor(now, dead_time, lookback);
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "UPDATE workq_messages
             SET status = 'pending', lock_owner = NULL, lock_heartbeat_at = NULL, visible_at = NULL,
                 version = version + 1, updated_at = $1
             WHERE id IN (
                 SELECT id FROM workq_messages
                 WHERE queue_name = $2
                   AND status = 'working'
                   AND (lock_heartbeat_at IS NULL OR lock_heartbeat_at < $3)
                   AND ($4::timestamptz IS NULL OR lock_heartbeat_at IS NULL OR lock_heartbeat_at >= $4)
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id",
        )
        .bind(now)
        .bind(&self.queue)
        .bind(cutoff)
        .bind(floor)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        Ok(rows.into_iter().map(|(id,)| MessageId(id)).collect())
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<MessageId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "UPDATE workq_messages
             SET status = 'expired', version = version + 1, updated_at = $1
             WHERE id IN (
                 SELECT id FROM workq_messages
                 WHERE queue_name = $2
                   AND status IN ('delayed', 'pending')
                   AND expires_at <= $1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id",
        )
        .bind(now)
        .bind(&self.queue)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        Ok(rows.into_iter().map(|(id,)| MessageId(id)).collect())
    }

    async fn promote_delayed(&self, now: DateTime<Utc>) -> Result<u64> {
        let rows = sqlx::query(
            "UPDATE workq_messages
             SET status = 'pending', visible_at = NULL, version = version + 1, updated_at = $1
             WHERE queue_name = $2
               AND status = 'delayed'
               AND (visible_at IS NULL OR visible_at <= $1)
               AND (expires_at IS NULL OR expires_at > $1)",
        )
        .bind(now)
        .bind(&self.queue)
        .execute(&self.pool)
        .await
        .map_err(classify)?
        .rows_affected();
        Ok(rows)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    message_type: String,
    body: Vec<u8>,
    headers: serde_json::Value,
    status: String,
    queued_at: DateTime<Utc>,
    visible_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    priority: i32,
    route: Option<String>,
    lock_owner: Option<String>,
    lock_heartbeat_at: Option<DateTime<Utc>>,
    attempt_count: i32,
    version: i64,
    last_error: Option<String>,
    failures: serde_json::Value,
    updated_at: DateTime<Utc>,
}

impl MessageRow {
    fn try_into_message(self) -> Result<Message> {
        let headers: Headers = serde_json::from_value(self.headers)?;
        let failures = serde_json::from_value(self.failures)?;
        let priority = u16::try_from(self.priority)
            .map_err(|_| Error::Other(format!("priority out of range: {}", self.priority)))?;
        Ok(Message {
            id: MessageId(self.id),
            message_type: self.message_type,
            body: self.body,
            headers,
            status: self.status.parse()?,
            queued_at: self.queued_at,
            visible_at: self.visible_at,
            expires_at: self.expires_at,
            priority,
            route: self.route,
            lock_owner: self.lock_owner.map(WorkerId),
            lock_heartbeat_at: self.lock_heartbeat_at,
            attempt_count: self.attempt_count.max(0) as u32,
            version: self.version.max(0) as u64,
            last_error: self.last_error,
            failures,
            updated_at: self.updated_at,
        })
    }
}
