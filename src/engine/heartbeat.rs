//! Claim liveness.
//!
//! Each pass does two things. It refreshes `lock_heartbeat_at` for every
//! claim this process holds, spreading the refreshes over a small elastic
//! task pool. Then it reclaims every claim, from any process, that has been
//! silent for longer than the dead-time. A refresh that reports the claim
//! lost cancels the handler holding it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::QueueContext;
use super::monitor::Monitor;
use crate::config::{HeartBeatConfiguration, ThreadPoolConfiguration};
use crate::error::{Error, Result};
use crate::model::{MessageId, WorkerId};
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Local claims
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LocalClaim {
    pub worker: WorkerId,
    /// Cancels the handler working on the claim.
    pub token: CancellationToken,
}

/// Claims held by the workers of this process.
#[derive(Debug, Default)]
pub struct ClaimRegistry {
    claims: DashMap<MessageId, LocalClaim>,
}

impl ClaimRegistry {
    pub fn register(&self, id: MessageId, worker: WorkerId, token: CancellationToken) {
        self.claims.insert(id, LocalClaim { worker, token });
    }

    /// Drop the claim if `worker` still holds it.
    pub fn remove(&self, id: &MessageId, worker: &WorkerId) -> Option<LocalClaim> {
        self.claims
            .remove_if(id, |_, claim| claim.worker == *worker)
            .map(|(_, claim)| claim)
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    fn snapshot(&self) -> Vec<(MessageId, LocalClaim)> {
        self.claims
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Cancel and forget the claim, whoever holds it.
    fn revoke(&self, id: &MessageId) -> bool {
        match self.claims.remove(id) {
            Some((_, claim)) => {
                claim.token.cancel();
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Refresh pool
// ---------------------------------------------------------------------------

type Job = BoxFuture<'static, ()>;

/// Task pool that grows to `threads_max` under load and shrinks back to
/// `threads_min` after `thread_idle_timeout` without work.
pub(crate) struct RefreshPool {
    sender: mpsc::UnboundedSender<Job>,
    shared: Arc<PoolShared>,
}

struct PoolShared {
    receiver: Mutex<mpsc::UnboundedReceiver<Job>>,
    config: ThreadPoolConfiguration,
    live: AtomicUsize,
    busy: AtomicUsize,
    queued: AtomicUsize,
}

impl RefreshPool {
    pub(crate) fn new(config: ThreadPoolConfiguration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            shared: Arc::new(PoolShared {
                receiver: Mutex::new(receiver),
                config,
                live: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) fn live(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub(crate) fn submit(&self, job: Job) {
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(job).is_err() {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        self.grow();
    }

    fn grow(&self) {
        if self.shared.reserve() {
            tokio::spawn(runner(self.shared.clone()));
        }
    }
}

impl PoolShared {
    /// Take a runner slot if queued work outnumbers idle runners.
    fn reserve(&self) -> bool {
        let live = self.live.load(Ordering::SeqCst);
        let idle = live.saturating_sub(self.busy.load(Ordering::SeqCst));
        let max = self.config.threads_max.max(1);
        self.queued.load(Ordering::SeqCst) > idle
            && live < max
            && self
                .live
                .compare_exchange(live, live + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    /// Called by a runner that waited out the idle timeout. False when the
    /// runner should exit.
    ///
    /// A job submitted between the timeout and the retirement saw this
    /// runner as idle and started none, so the runner takes its slot back.
    fn keep_after_idle(&self) -> bool {
        !self.retire() || self.reserve()
    }

    /// Give up one runner unless that would drop below `threads_min`.
    fn retire(&self) -> bool {
        let min = self.config.threads_min;
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > min).then(|| n - 1))
            .is_ok()
    }
}

async fn runner(shared: Arc<PoolShared>) {
    loop {
        let next = {
            let mut receiver = shared.receiver.lock().await;
            tokio::select! {
                job = receiver.recv() => Some(job),
                _ = tokio::time::sleep(shared.config.thread_idle_timeout) => None,
            }
        };
        match next {
            Some(Some(job)) => {
                shared.queued.fetch_sub(1, Ordering::SeqCst);
                shared.busy.fetch_add(1, Ordering::SeqCst);
                job.await;
                shared.busy.fetch_sub(1, Ordering::SeqCst);
            }
            // Channel closed: the pool was dropped.
            Some(None) => {
                shared.live.fetch_sub(1, Ordering::SeqCst);
                return;
            }
            None => {
                if !shared.keep_after_idle() {
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Outcome of one heartbeat pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeartbeatPass {
    pub refreshed: usize,
    pub lost: Vec<MessageId>,
    pub reclaimed: Vec<MessageId>,
}

pub struct HeartbeatMonitor {
    ctx: Arc<QueueContext>,
    config: HeartBeatConfiguration,
    claims: Arc<ClaimRegistry>,
    pool: RefreshPool,
}

impl HeartbeatMonitor {
    pub(crate) fn new(
        ctx: Arc<QueueContext>,
        config: HeartBeatConfiguration,
        claims: Arc<ClaimRegistry>,
    ) -> Self {
        let pool = RefreshPool::new(config.thread_pool.clone());
        Self {
            ctx,
            config,
            claims,
            pool,
        }
    }

    pub fn claims(&self) -> &Arc<ClaimRegistry> {
        &self.claims
    }

    /// Runners currently alive in the refresh pool.
    pub fn pool_size(&self) -> usize {
        self.pool.live()
    }

    /// Refresh every local claim. Returns how many were refreshed and which
    /// were found lost.
    pub async fn refresh_once(&self) -> (usize, Vec<MessageId>) {
        let claims = self.claims.snapshot();
        if claims.is_empty() {
            return (0, Vec::new());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        for (id, claim) in claims {
            let ctx = self.ctx.clone();
            let tx = tx.clone();
            self.pool.submit(Box::pin(async move {
                let transport = &ctx.transport;
                let result = ctx
                    .command("reset_heartbeat", &CancellationToken::new(), || {
                        transport.reset_heartbeat(id, &claim.worker, ctx.now())
                    })
                    .await;
                let _ = tx.send((id, claim, result));
            }));
        }
        drop(tx);

        let mut refreshed = 0;
        let mut lost = Vec::new();
        while let Some((id, claim, result)) = rx.recv().await {
            match result {
                Ok(()) => refreshed += 1,
                Err(Error::LostClaim { .. }) => {
                    if self.claims.remove(&id, &claim.worker).is_some() {
                        claim.token.cancel();
                    }
                    warn!(
                        queue = self.ctx.name(),
                        %id,
                        worker = %claim.worker,
                        "claim lost, cancelling handler"
                    );
                    lost.push(id);
                }
                Err(e) => {
                    warn!(queue = self.ctx.name(), %id, error = %e, "heartbeat refresh failed");
                }
            }
        }
        debug!(queue = self.ctx.name(), refreshed, lost = lost.len(), "heartbeats refreshed");
        (refreshed, lost)
    }

    /// Return silent claims to Pending.
    pub async fn reclaim_once(&self) -> Result<Vec<MessageId>> {
        let transport = &self.ctx.transport;
        let reclaimed = self
            .ctx
            .command("reclaim_dead", &CancellationToken::new(), || {
                transport.reclaim_dead(self.ctx.now(), self.config.time, self.config.monitor_time)
            })
            .await?;

        if !reclaimed.is_empty() {
            for id in &reclaimed {
                if self.claims.revoke(id) {
                    warn!(
                        queue = self.ctx.name(),
                        %id,
                        "local claim was reclaimed, cancelling handler"
                    );
                }
            }
            metrics::reclaimed().add(
                reclaimed.len() as u64,
                &[KeyValue::new("queue", self.ctx.name().to_string())],
            );
            info!(
                queue = self.ctx.name(),
                count = reclaimed.len(),
                "reclaimed messages from silent workers"
            );
        }
        Ok(reclaimed)
    }

    pub async fn pass(&self) -> Result<HeartbeatPass> {
        let (refreshed, lost) = self.refresh_once().await;
        let reclaimed = self.reclaim_once().await?;
        Ok(HeartbeatPass {
            refreshed,
            lost,
            reclaimed,
        })
    }
}

#[async_trait]
impl Monitor for HeartbeatMonitor {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn period(&self) -> Duration {
        self.config.refresh_interval()
    }

    async fn run_once(&self) -> Result<u64> {
        let pass = self.pass().await?;
        Ok((pass.refreshed + pass.reclaimed.len()) as u64)
    }
}
