//! Worker loops: claim, hand to the handler, record the outcome.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt as _;
use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::heartbeat::ClaimRegistry;
use super::{QueueContext, note_transition};
use crate::config::{ErrorPolicy, QueueConfiguration, Retention, RetryDelayBehavior};
use crate::error::Result;
use crate::model::{ClaimFilter, Message, Status, WorkerId, offset};
use crate::telemetry::{message::start_message_span, metrics};
use crate::transport::{Capabilities, StatusUpdate};

// ---------------------------------------------------------------------------
// Handler API
// ---------------------------------------------------------------------------

/// Business logic run for each claimed message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        message: Message,
        notification: WorkerNotification,
    ) -> std::result::Result<(), HandlerError>;
}

/// Adapter returned by [`handler_fn`].
pub struct HandlerFn<F>(F);

/// Use an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Message, WorkerNotification) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Message, WorkerNotification) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        message: Message,
        notification: WorkerNotification,
    ) -> std::result::Result<(), HandlerError> {
        (self.0)(message, notification).await
    }
}

/// A handler failure.
///
/// `kind` selects the retry delay sequence; unknown kinds fall back to the
/// `"default"` sequence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    kind: String,
    message: String,
    cancelled: bool,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cancelled: false,
        }
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(RetryDelayBehavior::DEFAULT_KIND, message)
    }

    /// The handler stopped because its cancellation token fired. The claim
    /// is rolled back without counting as a failure.
    pub fn cancelled() -> Self {
        Self {
            kind: "cancelled".into(),
            message: "handler observed cancellation".into(),
            cancelled: true,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl From<crate::error::Error> for HandlerError {
    fn from(e: crate::error::Error) -> Self {
        Self::msg(e.to_string())
    }
}

impl From<HandlerError> for crate::error::Error {
    fn from(e: HandlerError) -> Self {
        crate::error::Error::Handler(e.to_string())
    }
}

/// What a handler gets alongside the message.
#[derive(Debug, Clone)]
pub struct WorkerNotification {
    worker_id: WorkerId,
    token: CancellationToken,
    rollback_supported: bool,
}

impl WorkerNotification {
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Fires when the consumer stops or the claim is lost.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Can a cancelled handler hand its message back to the queue?
    pub fn rollback_supported(&self) -> bool {
        self.rollback_supported
    }
}

// ---------------------------------------------------------------------------
// Pool state
// ---------------------------------------------------------------------------

/// Idle bookkeeping shared by the loops of one consumer.
pub(crate) struct PoolState {
    worker_count: usize,
    single_worker_when_idle: bool,
    idle: AtomicUsize,
    work_found: Notify,
}

impl PoolState {
    pub(crate) fn new(worker_count: usize, single_worker_when_idle: bool) -> Self {
        Self {
            worker_count,
            single_worker_when_idle,
            idle: AtomicUsize::new(0),
            work_found: Notify::new(),
        }
    }

    fn mark_idle(&self) {
        self.idle.fetch_add(1, Ordering::SeqCst);
    }

    fn mark_busy(&self) {
        self.idle.fetch_sub(1, Ordering::SeqCst);
    }

    fn all_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst) >= self.worker_count
    }

    fn wake(&self) {
        self.work_found.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

pub(crate) struct WorkerLoop {
    pub(crate) index: usize,
    pub(crate) id: WorkerId,
    pub(crate) ctx: Arc<QueueContext>,
    pub(crate) config: Arc<QueueConfiguration>,
    pub(crate) filter: Arc<ClaimFilter>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) pool: Arc<PoolState>,
    pub(crate) claims: Arc<ClaimRegistry>,
    pub(crate) capabilities: Capabilities,
    pub(crate) shutdown: CancellationToken,
}

impl WorkerLoop {
    pub(crate) async fn run(self) {
        info!(queue = self.ctx.name(), worker = %self.id, "worker started");
        let mut idle = false;
        let mut empty_streak = 0;
        let mut fatal_streak = 0;

        while !self.shutdown.is_cancelled() {
            if idle && self.should_park() {
                if !self.park().await {
                    break;
                }
                continue;
            }

            match self.claim().await {
                Ok(Some(message)) => {
                    if idle {
                        self.pool.mark_busy();
                        idle = false;
                    }
                    empty_streak = 0;
                    fatal_streak = 0;
                    self.pool.wake();
                    self.process(message).await;
                }
                Ok(None) => {
                    if !idle {
                        self.pool.mark_idle();
                        idle = true;
                    }
                    let wait = self.config.queue_delay_behavior.delay_for(empty_streak);
                    empty_streak += 1;
                    if !self.pause(wait).await {
                        break;
                    }
                }
                Err(e) if e.is_stale() => {
                    debug!(worker = %self.id, error = %e, "lost claim race");
                }
                Err(e) => {
                    let wait = self
                        .config
                        .fatal_exception_delay_behavior
                        .delay_for(fatal_streak);
                    fatal_streak += 1;
                    error!(
                        queue = self.ctx.name(),
                        worker = %self.id,
                        error = %e,
                        wait_ms = wait.as_millis() as u64,
                        "claim failed, backing off"
                    );
                    if !self.pause(wait).await {
                        break;
                    }
                }
            }
        }

        if idle {
            self.pool.mark_busy();
        }
        info!(queue = self.ctx.name(), worker = %self.id, "worker stopped");
    }

    /// Only the first loop keeps polling once every loop found the queue
    /// empty.
    fn should_park(&self) -> bool {
        self.index != 0 && self.pool.single_worker_when_idle && self.pool.all_idle()
    }

    /// Wait until another loop finds work. False on shutdown.
    async fn park(&self) -> bool {
        let notified = self.pool.work_found.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.pool.all_idle() {
            return true;
        }
        debug!(worker = %self.id, "parked while queue is empty");
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = notified => true,
        }
    }

    /// Sleep unless shutdown comes first. False on shutdown.
    async fn pause(&self, wait: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    async fn claim(&self) -> Result<Option<Message>> {
        let transport = &self.ctx.transport;
        self.ctx
            .command("try_claim", &self.shutdown, || {
                transport.try_claim(&self.id, &self.filter, self.ctx.now())
            })
            .await
    }

    async fn process(&self, message: Message) {
        let token = self.shutdown.child_token();
        self.claims
            .register(message.id, self.id.clone(), token.clone());

        let span = start_message_span(self.ctx.name(), message.id, &self.id, message.attempt_count);
        note_transition(&span, message.claimed_from(), Status::Working);

        let notification = WorkerNotification {
            worker_id: self.id.clone(),
            token: token.clone(),
            rollback_supported: self.capabilities.rollback,
        };
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.handler.handle(message.clone(), notification))
            .catch_unwind()
            .instrument(span.clone())
            .await
            .unwrap_or_else(|_| Err(HandlerError::new("panic", "handler panicked")));
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.claims.remove(&message.id, &self.id);

        let label = self
            .finish(&message, outcome, &span)
            .instrument(span.clone())
            .await;
        metrics::handler_duration_ms().record(
            elapsed_ms,
            &[
                KeyValue::new("queue", self.ctx.name().to_string()),
                KeyValue::new("outcome", label),
            ],
        );
    }

    async fn finish(
        &self,
        message: &Message,
        outcome: std::result::Result<(), HandlerError>,
        span: &Span,
    ) -> &'static str {
        match outcome {
            Ok(()) => {
                self.transition(message, StatusUpdate::complete(), span).await;
                "complete"
            }
            Err(e) if e.is_cancelled() => {
                if self.capabilities.rollback {
                    info!(id = %message.id, "handler cancelled, rolling back claim");
                    self.transition(message, StatusUpdate::rollback(), span).await;
                    "rollback"
                } else {
                    warn!(
                        id = %message.id,
                        "handler cancelled without rollback support, leaving claim for reclamation"
                    );
                    "abandoned"
                }
            }
            Err(e) => {
                let update = self.failure_update(message, &e);
                warn!(
                    id = %message.id,
                    attempt = message.attempt_count,
                    kind = e.kind(),
                    error = %e,
                    requeue = update.to == Status::Pending,
                    "handler failed"
                );
                let label = if update.to == Status::Pending { "requeue" } else { "error" };
                self.transition(message, update, span).await;
                label
            }
        }
    }

    /// Requeue with the next retry delay of the error's kind, or give up.
    fn failure_update(&self, message: &Message, error: &HandlerError) -> StatusUpdate {
        let text = error.to_string();
        let failures = message.failures_of(error.kind()).saturating_add(1);
        if self.config.error_policy == ErrorPolicy::Requeue && self.capabilities.rollback {
            let delay = self
                .config
                .retry_delay_behavior
                .delay_for(error.kind(), failures);
            if let Some(delay) = delay {
                let visible_at = offset(self.ctx.now(), delay).filter(|_| !delay.is_zero());
                return StatusUpdate::requeue(text, visible_at).failure(error.kind());
            }
        }
        StatusUpdate::fail(text).failure(error.kind())
    }

    async fn transition(&self, message: &Message, update: StatusUpdate, span: &Span) {
        // Outcomes are recorded even while stopping.
        let cancel = CancellationToken::new();
        let transport = &self.ctx.transport;
        let result = self
            .ctx
            .command("update_status", &cancel, || {
                transport.update_status(message.id, &update, message.version, self.ctx.now())
            })
            .await;

        match result {
            Ok(updated) => {
                note_transition(span, update.from, update.to);
                if updated.status.is_terminal() && self.config.retention == Retention::Purge {
                    let purged = self
                        .ctx
                        .command("delete", &cancel, || transport.delete(message.id))
                        .await;
                    if let Err(e) = purged {
                        warn!(id = %message.id, error = %e, "failed to purge finished message");
                    }
                }
            }
            Err(e) if e.is_stale() => {
                info!(id = %message.id, error = %e, "claim lost before outcome was recorded");
            }
            Err(e) => {
                error!(id = %message.id, error = %e, "failed to record outcome");
            }
        }
    }
}
