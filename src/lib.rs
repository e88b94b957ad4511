//! # workq
//!
//! Transactional work queue over pluggable storage transports.
//!
//! Producers enqueue typed messages with optional delay, expiration,
//! priority and route. A consumer runs a pool of workers that claim
//! messages atomically, hand them to a handler, and record the outcome,
//! while background monitors refresh and reclaim claims, expire stale
//! messages and promote delayed ones. Every transport call runs under a
//! retry policy that absorbs transient backend faults.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod policy;
pub mod telemetry;
pub mod transport;

pub use engine::{Consumer, HandlerError, MessageHandler, Producer, Queue, WorkerNotification};
pub use error::{Error, Result};
pub use model::{Message, MessageId, NewMessage, SendResult, Status};
