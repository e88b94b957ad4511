//! Background monitor loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// A periodic scan over the queue.
#[async_trait]
pub trait Monitor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Time between passes.
    fn period(&self) -> Duration;

    /// One pass. Returns how many messages it acted on.
    async fn run_once(&self) -> Result<u64>;
}

/// Run `monitor` every period until `shutdown` fires. Failed passes are
/// logged and retried on the next tick.
pub(crate) async fn run_monitor(monitor: Arc<dyn Monitor>, shutdown: CancellationToken) {
    let name = monitor.name();
    let period = monitor.period().max(Duration::from_millis(1));
    info!(monitor = name, period_ms = period.as_millis() as u64, "monitor started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
        match monitor.run_once().await {
            Ok(0) => {}
            Ok(count) => debug!(monitor = name, count, "monitor pass"),
            Err(e) => warn!(monitor = name, error = %e, "monitor pass failed"),
        }
    }

    info!(monitor = name, "monitor stopped");
}
