//! Consumer: owns the worker loops and background monitors of one queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::QueueContext;
use super::delayed::DelayedMonitor;
use super::expiration::ExpirationMonitor;
use super::heartbeat::{ClaimRegistry, HeartbeatMonitor};
use super::monitor::{Monitor, run_monitor};
use super::producer::pending_filter;
use super::worker::{MessageHandler, PoolState, WorkerLoop};
use crate::config::QueueConfiguration;
use crate::error::{Error, Result};
use crate::model::{ClaimFilter, WorkerId};

/// Runs a handler over the messages of a queue.
///
/// Configuration may be edited until [`start`](Self::start); the running
/// pool uses a frozen snapshot and edits are rejected until it stops.
pub struct Consumer {
    ctx: Arc<QueueContext>,
    config: QueueConfiguration,
    filter: ClaimFilter,
    running: Option<Running>,
}

struct Running {
    config: Arc<QueueConfiguration>,
    claims: Arc<ClaimRegistry>,
    workers_shutdown: CancellationToken,
    monitors_shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    monitors: Vec<JoinHandle<()>>,
}

impl Consumer {
    pub(crate) fn new(ctx: Arc<QueueContext>, config: QueueConfiguration) -> Self {
        Self {
            ctx,
            config,
            filter: ClaimFilter::default(),
            running: None,
        }
    }

    /// Restrict claims by route or message type. The priority order always
    /// comes from the configuration.
    pub fn with_filter(mut self, filter: ClaimFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn configuration(&self) -> &QueueConfiguration {
        match &self.running {
            Some(running) => &running.config,
            None => &self.config,
        }
    }

    pub fn configuration_mut(&mut self) -> Result<&mut QueueConfiguration> {
        if self.running.is_some() {
            return Err(Error::Config(
                "configuration is frozen while the consumer is running".into(),
            ));
        }
        Ok(&mut self.config)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Claims currently held by this consumer's workers.
    pub fn claims_in_flight(&self) -> usize {
        self.running.as_ref().map_or(0, |r| r.claims.len())
    }

    /// Messages not yet claimed: Pending plus Delayed.
    pub async fn pending_count(&self) -> Result<u64> {
        let transport = &self.ctx.transport;
        let filter = pending_filter();
        self.ctx.query("count", || transport.count(&filter)).await
    }

    /// Spawn the worker loops and monitors. Must be called from within a
    /// tokio runtime.
    pub fn start(&mut self, handler: impl MessageHandler) -> Result<()> {
        self.start_shared(Arc::new(handler))
    }

    pub fn start_shared(&mut self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::Config("consumer already started".into()));
        }
        self.config.validate()?;

        let config = Arc::new(self.config.clone());
        let capabilities = self.ctx.transport.capabilities();
        let filter = Arc::new(ClaimFilter {
            priority_order: config.priority_order,
            ..self.filter.clone()
        });
        let claims = Arc::new(ClaimRegistry::default());
        let workers_shutdown = CancellationToken::new();
        let monitors_shutdown = CancellationToken::new();

        let worker_count = config.worker.worker_count;
        let pool = Arc::new(PoolState::new(
            worker_count,
            config.worker.single_worker_when_no_work_found,
        ));
        let workers = (0..worker_count)
            .map(|index| {
                let worker = WorkerLoop {
                    index,
                    id: WorkerId::generate(index),
                    ctx: self.ctx.clone(),
                    config: config.clone(),
                    filter: filter.clone(),
                    handler: handler.clone(),
                    pool: pool.clone(),
                    claims: claims.clone(),
                    capabilities,
                    shutdown: workers_shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        let mut monitors: Vec<Arc<dyn Monitor>> = Vec::new();
        if config.heartbeat.enabled && capabilities.heartbeat {
            monitors.push(Arc::new(HeartbeatMonitor::new(
                self.ctx.clone(),
                config.heartbeat.clone(),
                claims.clone(),
            )));
        }
        if config.message_expiration.enabled && capabilities.expiration {
            monitors.push(Arc::new(ExpirationMonitor::new(
                self.ctx.clone(),
                config.message_expiration.clone(),
                config.retention,
            )));
        }
        if config.delayed_processing.enabled && capabilities.delayed {
            monitors.push(Arc::new(DelayedMonitor::new(
                self.ctx.clone(),
                config.delayed_processing.clone(),
            )));
        }
        let monitors = monitors
            .into_iter()
            .map(|monitor| tokio::spawn(run_monitor(monitor, monitors_shutdown.clone())))
            .collect();

        info!(queue = self.ctx.name(), workers = worker_count, "consumer started");
        self.running = Some(Running {
            config,
            claims,
            workers_shutdown,
            monitors_shutdown,
            workers,
            monitors,
        });
        Ok(())
    }

    /// Stop claiming, ask in-flight handlers to cancel and wait for them.
    ///
    /// Workers get `time_to_wait_for_workers_to_stop`. If they overrun and
    /// `abort_worker_threads_when_stopping` is set, they get
    /// `time_to_wait_for_workers_to_cancel` more and are then abandoned;
    /// their messages stay Working until heartbeat reclamation returns them.
    /// Otherwise overrunning workers are detached.
    pub async fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        let worker_config = running.config.worker.clone();
        info!(queue = self.ctx.name(), "stopping consumer");

        running.workers_shutdown.cancel();
        let stopped = wait_all(
            &mut running.workers,
            worker_config.time_to_wait_for_workers_to_stop,
        )
        .await;

        if !stopped {
            if worker_config.abort_worker_threads_when_stopping {
                let cancelled = wait_all(
                    &mut running.workers,
                    worker_config.time_to_wait_for_workers_to_cancel,
                )
                .await;
                if !cancelled {
                    let abandoned = running.workers.iter().filter(|h| !h.is_finished()).count();
                    for handle in &running.workers {
                        handle.abort();
                    }
                    warn!(
                        queue = self.ctx.name(),
                        abandoned,
                        "abandoned workers after cancel timeout, heartbeat reclamation will recover their messages"
                    );
                }
            } else {
                warn!(
                    queue = self.ctx.name(),
                    "workers still running after stop timeout, detaching"
                );
            }
        }

        running.monitors_shutdown.cancel();
        let _ = wait_all(
            &mut running.monitors,
            worker_config.time_to_wait_for_workers_to_cancel,
        )
        .await;
        info!(queue = self.ctx.name(), "consumer stopped");
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.workers_shutdown.cancel();
            running.monitors_shutdown.cancel();
        }
    }
}

/// Await every unfinished handle, up to `limit`. True if all finished.
async fn wait_all(handles: &mut [JoinHandle<()>], limit: Duration) -> bool {
    let pending = handles.iter_mut().filter(|h| !h.is_finished());
    tokio::time::timeout(limit, futures::future::join_all(pending))
        .await
        .is_ok()
}
