//! Error types for workq.

use thiserror::Error;

use crate::model::{MessageId, Status};

#[derive(Debug, Error)]
pub enum Error {
    #[error("message not found: {0}")]
    NotFound(String),

    /// The transition is not an edge of the lifecycle graph.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    /// Another actor moved the message first. Callers treat this as a
    /// no-op, not a failure.
    #[error("stale state for message {id}: expected {expected}, found {actual}")]
    StaleState {
        id: MessageId,
        expected: Status,
        actual: Status,
    },

    #[error("worker {worker} no longer holds the claim on message {id}")]
    LostClaim { id: MessageId, worker: String },

    /// Retryable backend fault: deadlock, timeout, dropped connection.
    #[error("transient transport fault: {0}")]
    Transient(String),

    #[error("policy {policy} gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        policy: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid message: {0}")]
    Validation(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Default fault classification used by the retry policies.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Database(e) => matches!(e, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut),
            _ => false,
        }
    }

    /// Lost races are expected under concurrency and never retried.
    pub fn is_stale(&self) -> bool {
        matches!(self, Error::StaleState { .. } | Error::LostClaim { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
