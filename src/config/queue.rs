//! Per-queue configuration: workers, heartbeat, monitors, backoff
//! sequences and transport retry policies.
//!
//! Every section has defaults, so an empty TOML document is a valid
//! configuration. Durations are written in milliseconds (`*_ms` keys).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::PriorityOrder;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfiguration {
    pub worker: WorkerConfiguration,
    pub heartbeat: HeartBeatConfiguration,
    pub message_expiration: MessageExpirationConfiguration,
    pub delayed_processing: DelayedProcessingConfiguration,
    /// Backoff while the queue is empty, indexed by the empty-poll streak.
    pub queue_delay_behavior: DelayBehavior,
    /// Backoff after a fatal error in the worker loop.
    pub fatal_exception_delay_behavior: DelayBehavior,
    /// Redelivery delays after handler failures, keyed by error kind.
    pub retry_delay_behavior: RetryDelayBehavior,
    pub error_policy: ErrorPolicy,
    pub retention: Retention,
    pub priority_order: PriorityOrder,
    pub policies: PolicyConfiguration,
}

impl QueueConfiguration {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| Error::Config(format!("bad queue config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read queue config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.worker_count == 0 {
            return Err(Error::Config("worker_count must be at least 1".into()));
        }
        if self.heartbeat.interval == 0 {
            return Err(Error::Config("heartbeat interval must be at least 1".into()));
        }
        if self.heartbeat.time.is_zero() {
            return Err(Error::Config("heartbeat time must be positive".into()));
        }
        let pool = &self.heartbeat.thread_pool;
        if pool.threads_max == 0 || pool.threads_min > pool.threads_max {
            return Err(Error::Config(format!(
                "heartbeat thread pool needs 1 <= threads_max and threads_min <= threads_max (got {}..{})",
                pool.threads_min, pool.threads_max
            )));
        }
        if self.policies.min_wait > self.policies.max_wait {
            return Err(Error::Config("policy min_wait exceeds max_wait".into()));
        }
        if !(0.0..=1.0).contains(&self.policies.chaos_injection_rate) {
            return Err(Error::Config(
                "chaos_injection_rate must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfiguration {
    pub worker_count: usize,
    /// Collapse to one poller while every worker finds the queue empty.
    pub single_worker_when_no_work_found: bool,
    /// Abandon handlers that outlive the stop grace periods.
    pub abort_worker_threads_when_stopping: bool,
    #[serde(rename = "time_to_wait_for_workers_to_stop_ms", with = "serde_ms")]
    pub time_to_wait_for_workers_to_stop: Duration,
    #[serde(rename = "time_to_wait_for_workers_to_cancel_ms", with = "serde_ms")]
    pub time_to_wait_for_workers_to_cancel: Duration,
}

impl Default for WorkerConfiguration {
    fn default() -> Self {
        Self {
            worker_count: 1,
            single_worker_when_no_work_found: true,
            abort_worker_threads_when_stopping: false,
            time_to_wait_for_workers_to_stop: Duration::from_secs(10),
            time_to_wait_for_workers_to_cancel: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartBeatConfiguration {
    pub enabled: bool,
    /// Claims are refreshed `interval` times per dead-time window.
    pub interval: u32,
    /// Dead-time: a claim silent for longer than this is reclaimed.
    #[serde(rename = "time_ms", with = "serde_ms")]
    pub time: Duration,
    /// How far past the dead-time the reclaim scan looks. None = unbounded.
    #[serde(rename = "monitor_time_ms", with = "serde_ms::option")]
    pub monitor_time: Option<Duration>,
    pub thread_pool: ThreadPoolConfiguration,
}

impl HeartBeatConfiguration {
    /// Period between refreshes and reclaim scans.
    pub fn refresh_interval(&self) -> Duration {
        self.time / self.interval.max(1)
    }
}

impl Default for HeartBeatConfiguration {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 4,
            time: Duration::from_secs(600),
            monitor_time: None,
            thread_pool: ThreadPoolConfiguration::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfiguration {
    pub threads_min: usize,
    pub threads_max: usize,
    #[serde(rename = "thread_idle_timeout_ms", with = "serde_ms")]
    pub thread_idle_timeout: Duration,
}

impl Default for ThreadPoolConfiguration {
    fn default() -> Self {
        Self {
            threads_min: 1,
            threads_max: 1,
            thread_idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageExpirationConfiguration {
    pub enabled: bool,
    #[serde(rename = "monitor_time_ms", with = "serde_ms")]
    pub monitor_time: Duration,
}

impl Default for MessageExpirationConfiguration {
    fn default() -> Self {
        Self {
            enabled: true,
            monitor_time: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayedProcessingConfiguration {
    pub enabled: bool,
    #[serde(rename = "monitor_time_ms", with = "serde_ms")]
    pub monitor_time: Duration,
}

impl Default for DelayedProcessingConfiguration {
    fn default() -> Self {
        Self {
            enabled: true,
            monitor_time: Duration::from_secs(1),
        }
    }
}

/// Transport retry settings shared by every registered policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfiguration {
    /// Retries after the first attempt.
    pub retry_count: u32,
    #[serde(rename = "min_wait_ms", with = "serde_ms")]
    pub min_wait: Duration,
    #[serde(rename = "max_wait_ms", with = "serde_ms")]
    pub max_wait: Duration,
    /// Must stay false outside of tests.
    pub enable_chaos: bool,
    pub chaos_injection_rate: f64,
}

impl Default for PolicyConfiguration {
    fn default() -> Self {
        Self {
            retry_count: 3,
            min_wait: Duration::from_millis(5),
            max_wait: Duration::from_millis(50),
            enable_chaos: false,
            chaos_injection_rate: 0.0,
        }
    }
}

/// What happens to a message whose handler failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Return to Pending while the retry delay behavior has steps left.
    #[default]
    Requeue,
    /// Always move to the terminal Error state.
    Terminal,
}

/// What happens to a message once it reaches a terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Delete it.
    #[default]
    Purge,
    /// Keep it for audit.
    Archive,
}

// ---------------------------------------------------------------------------
// Delay behaviors
// ---------------------------------------------------------------------------

/// Ordered wait durations. Clamped at the last step once exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DelayBehavior {
    #[serde(with = "serde_ms::list")]
    steps: Vec<Duration>,
}

impl DelayBehavior {
    pub fn new(steps: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }

    pub fn from_millis(steps: &[u64]) -> Self {
        Self::new(steps.iter().copied().map(Duration::from_millis))
    }

    /// Wait for the given zero-based streak.
    pub fn delay_for(&self, streak: usize) -> Duration {
        match self.steps.last() {
            Some(last) => self.steps.get(streak).copied().unwrap_or(*last),
            None => Duration::ZERO,
        }
    }

    /// Step `index` without clamping.
    pub fn step(&self, index: usize) -> Option<Duration> {
        self.steps.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }

    pub fn push(&mut self, step: Duration) {
        self.steps.push(step);
    }
}

impl Default for DelayBehavior {
    fn default() -> Self {
        Self::from_millis(&[100, 250, 500, 1_000, 2_000])
    }
}

/// Redelivery delays per handler error kind, with a `"default"` fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetryDelayBehavior {
    by_kind: BTreeMap<String, DelayBehavior>,
}

impl RetryDelayBehavior {
    pub const DEFAULT_KIND: &'static str = "default";

    /// No retries for any kind.
    pub fn none() -> Self {
        Self {
            by_kind: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, kind: impl Into<String>, behavior: DelayBehavior) {
        self.by_kind.insert(kind.into(), behavior);
    }

    pub fn with(mut self, kind: impl Into<String>, behavior: DelayBehavior) -> Self {
        self.insert(kind, behavior);
        self
    }

    /// Delay before the next delivery after `failures` failures of `kind`,
    /// or None once the sequence is exhausted.
    pub fn delay_for(&self, kind: &str, failures: u32) -> Option<Duration> {
        let behavior = self
            .by_kind
            .get(kind)
            .or_else(|| self.by_kind.get(Self::DEFAULT_KIND))?;
        let index = usize::try_from(failures.checked_sub(1)?).ok()?;
        behavior.step(index)
    }
}

impl Default for RetryDelayBehavior {
    fn default() -> Self {
        Self::none().with(Self::DEFAULT_KIND, DelayBehavior::from_millis(&[1_000, 2_000, 3_000]))
    }
}

// ---------------------------------------------------------------------------
// Millisecond serde helpers
// ---------------------------------------------------------------------------

mod serde_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&(d.as_millis() as u64)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
        }
    }

    pub mod list {
        use serde::ser::SerializeSeq;

        use super::*;

        pub fn serialize<S: Serializer>(steps: &[Duration], s: S) -> Result<S::Ok, S::Error> {
            let mut seq = s.serialize_seq(Some(steps.len()))?;
            for step in steps {
                seq.serialize_element(&(step.as_millis() as u64))?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
            Ok(Vec::<u64>::deserialize(d)?
                .into_iter()
                .map(Duration::from_millis)
                .collect())
        }
    }
}
