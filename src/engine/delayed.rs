//! Promotes Delayed messages to Pending once their visibility time arrives.
//!
//! Claims already accept a Delayed message whose time has come, so this
//! pass only keeps the stored status, and therefore the counts, accurate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::QueueContext;
use super::monitor::Monitor;
use crate::config::DelayedProcessingConfiguration;
use crate::error::Result;

pub struct DelayedMonitor {
    ctx: Arc<QueueContext>,
    config: DelayedProcessingConfiguration,
}

impl DelayedMonitor {
    pub(crate) fn new(ctx: Arc<QueueContext>, config: DelayedProcessingConfiguration) -> Self {
        Self { ctx, config }
    }
}

#[async_trait]
impl Monitor for DelayedMonitor {
    fn name(&self) -> &'static str {
        "delayed"
    }

    fn period(&self) -> Duration {
        self.config.monitor_time
    }

    async fn run_once(&self) -> Result<u64> {
        let transport = &self.ctx.transport;
        let promoted = self
            .ctx
            .command("promote_delayed", &CancellationToken::new(), || {
                transport.promote_delayed(self.ctx.now())
            })
            .await?;
        if promoted > 0 {
            debug!(queue = self.ctx.name(), promoted, "delayed messages now visible");
        }
        Ok(promoted)
    }
}
