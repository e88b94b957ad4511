//! Moves unclaimed messages past their expiration to Expired.
//!
//! Claims already skip expired messages; this pass makes the state
//! visible and, under [`Retention::Purge`], deletes them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::QueueContext;
use super::monitor::Monitor;
use crate::config::{MessageExpirationConfiguration, Retention};
use crate::error::Result;
use crate::model::MessageId;
use crate::telemetry::metrics;

pub struct ExpirationMonitor {
    ctx: Arc<QueueContext>,
    config: MessageExpirationConfiguration,
    retention: Retention,
}

impl ExpirationMonitor {
    pub(crate) fn new(
        ctx: Arc<QueueContext>,
        config: MessageExpirationConfiguration,
        retention: Retention,
    ) -> Self {
        Self {
            ctx,
            config,
            retention,
        }
    }

    /// Expire what is due now. Returns the expired ids.
    pub async fn expire_once(&self) -> Result<Vec<MessageId>> {
        let cancel = CancellationToken::new();
        let transport = &self.ctx.transport;
        let expired = self
            .ctx
            .command("expire_due", &cancel, || transport.expire_due(self.ctx.now()))
            .await?;
        if expired.is_empty() {
            return Ok(expired);
        }

        metrics::expired().add(
            expired.len() as u64,
            &[KeyValue::new("queue", self.ctx.name().to_string())],
        );
        info!(queue = self.ctx.name(), count = expired.len(), "messages expired");

        if self.retention == Retention::Purge {
            for id in &expired {
                let id = *id;
                if let Err(e) = self
                    .ctx
                    .command("delete", &cancel, || transport.delete(id))
                    .await
                {
                    warn!(
                        queue = self.ctx.name(),
                        %id,
                        error = %e,
                        "failed to purge expired message"
                    );
                }
            }
        }
        Ok(expired)
    }
}

#[async_trait]
impl Monitor for ExpirationMonitor {
    fn name(&self) -> &'static str {
        "expiration"
    }

    fn period(&self) -> Duration {
        self.config.monitor_time
    }

    async fn run_once(&self) -> Result<u64> {
        Ok(self.expire_once().await?.len() as u64)
    }
}
