//! Queue facade: one transport, one clock, one policy registry.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::QueueContext;
use super::consumer::Consumer;
use super::delayed::DelayedMonitor;
use super::expiration::ExpirationMonitor;
use super::heartbeat::{ClaimRegistry, HeartbeatMonitor};
use super::producer::{BlockingProducer, Producer, pending_filter};
use crate::clock::{SharedClock, SystemClock};
use crate::config::QueueConfiguration;
use crate::error::Result;
use crate::model::{CountFilter, Message, MessageId};
use crate::policy::PolicyRegistry;
use crate::transport::{Capabilities, Transport};
use crate::transport::blocking::BlockingTransport;

/// A named queue bound to a transport.
///
/// Cheap to clone. Producers, consumers and monitors created from it share
/// its transport, clock and policies.
#[derive(Clone)]
pub struct Queue {
    ctx: Arc<QueueContext>,
    config: QueueConfiguration,
}

impl Queue {
    /// A queue with default configuration and the system clock.
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self> {
        Self::builder(transport).build()
    }

    pub fn builder(transport: Arc<dyn Transport>) -> QueueBuilder {
        QueueBuilder {
            transport,
            config: QueueConfiguration::default(),
            clock: None,
            policies: None,
        }
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.ctx.transport.capabilities()
    }

    pub fn configuration(&self) -> &QueueConfiguration {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.ctx.clock
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.ctx.policies
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.ctx.transport
    }

    /// Create the backing storage.
    pub async fn create(&self) -> Result<()> {
        let transport = &self.ctx.transport;
        self.ctx
            .command("create_queue", &CancellationToken::new(), || transport.create_queue())
            .await?;
        info!(queue = self.name(), "queue created");
        Ok(())
    }

    /// Remove the queue and every message in it.
    pub async fn remove(&self) -> Result<()> {
        let transport = &self.ctx.transport;
        self.ctx
            .command("remove_queue", &CancellationToken::new(), || transport.remove_queue())
            .await?;
        info!(queue = self.name(), "queue removed");
        Ok(())
    }

    pub fn producer(&self) -> Producer {
        Producer::new(self.ctx.clone())
    }

    /// A producer for synchronous callers. Owns its own runtime.
    pub fn blocking_producer(&self) -> Result<BlockingProducer> {
        let transport =
            BlockingTransport::new(self.ctx.transport.clone(), self.ctx.policies.clone())?;
        Ok(BlockingProducer::new(transport, self.ctx.clock.clone()))
    }

    /// A consumer holding its own copy of the configuration, editable until
    /// it starts.
    pub fn consumer(&self) -> Consumer {
        Consumer::new(self.ctx.clone(), self.config.clone())
    }

    pub fn heartbeat_monitor(&self) -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            self.ctx.clone(),
            self.config.heartbeat.clone(),
            Arc::new(ClaimRegistry::default()),
        )
    }

    pub fn expiration_monitor(&self) -> ExpirationMonitor {
        ExpirationMonitor::new(
            self.ctx.clone(),
            self.config.message_expiration.clone(),
            self.config.retention,
        )
    }

    pub fn delayed_monitor(&self) -> DelayedMonitor {
        DelayedMonitor::new(self.ctx.clone(), self.config.delayed_processing.clone())
    }

    pub async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        let transport = &self.ctx.transport;
        self.ctx.query("get", || transport.get(id)).await
    }

    pub async fn count(&self, filter: &CountFilter) -> Result<u64> {
        let transport = &self.ctx.transport;
        self.ctx.query("count", || transport.count(filter)).await
    }

    /// Messages not yet claimed: Pending plus Delayed.
    pub async fn pending_count(&self) -> Result<u64> {
        self.count(&pending_filter()).await
    }
}

pub struct QueueBuilder {
    transport: Arc<dyn Transport>,
    config: QueueConfiguration,
    clock: Option<SharedClock>,
    policies: Option<PolicyRegistry>,
}

impl QueueBuilder {
    pub fn configuration(mut self, config: QueueConfiguration) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a prebuilt registry instead of one derived from the
    /// configuration's `policies` section.
    pub fn policies(mut self, policies: PolicyRegistry) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn build(self) -> Result<Queue> {
        self.config.validate()?;
        let policies = self
            .policies
            .unwrap_or_else(|| PolicyRegistry::from_configuration(&self.config.policies));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        Ok(Queue {
            ctx: Arc::new(QueueContext {
                transport: self.transport,
                policies,
                clock,
            }),
            config: self.config,
        })
    }
}
