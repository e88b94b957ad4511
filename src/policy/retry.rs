//! Bounded retry with jittered waits.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::chaos::ChaosPolicy;
use crate::error::{Error, Result};
use crate::telemetry::{message::retry_span, metrics};

/// Decides whether an error is worth another attempt.
pub type Classifier = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Retry settings: how many times, how long to wait, what to retry.
#[derive(Clone)]
pub struct RetryPolicy {
    pub(crate) retry_count: u32,
    pub(crate) min_wait: Duration,
    pub(crate) max_wait: Duration,
    pub(crate) classifier: Classifier,
}

impl RetryPolicy {
    pub fn new(retry_count: u32, min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            retry_count,
            min_wait: min_wait.min(max_wait),
            max_wait,
            classifier: Arc::new(Error::is_transient),
        }
    }

    pub fn classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Random wait within `[min_wait, max_wait]`.
    pub fn next_wait(&self) -> Duration {
        if self.min_wait >= self.max_wait {
            return self.max_wait;
        }
        rand::thread_rng().gen_range(self.min_wait..=self.max_wait)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retry_count", &self.retry_count)
            .field("min_wait", &self.min_wait)
            .field("max_wait", &self.max_wait)
            .finish_non_exhaustive()
    }
}

/// A named retry policy, optionally with fault injection composed in
/// front of every attempt.
#[derive(Debug, Clone)]
pub struct TransportPolicy {
    name: String,
    retry: RetryPolicy,
    chaos: Option<ChaosPolicy>,
}

enum Step<T> {
    Done(Result<T>),
    Retry { error: Error, attempt: u32 },
}

impl TransportPolicy {
    pub fn new(name: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            retry,
            chaos: None,
        }
    }

    pub fn with_chaos(mut self, chaos: ChaosPolicy) -> Self {
        self.chaos = Some(chaos);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn chaos(&self) -> Option<&ChaosPolicy> {
        self.chaos.as_ref()
    }

    /// Run `op` under the policy, awaiting between attempts.
    ///
    /// Cancelling `cancel` during a wait returns the last error as-is.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let result = match self.injected_fault(attempt) {
                Some(fault) => Err(fault),
                None => op().await,
            };
            match self.step(result, attempt) {
                Step::Done(result) => return result,
                Step::Retry { error, attempt: next } => {
                    let wait = self.before_retry(&error, next);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(error),
                        _ = tokio::time::sleep(wait) => {}
                    }
                    attempt = next;
                }
            }
        }
    }

    /// Blocking twin of [`execute`](Self::execute): same classification,
    /// bounds and waits, sleeping the calling thread.
    pub fn execute_blocking<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            let result = match self.injected_fault(attempt) {
                Some(fault) => Err(fault),
                None => op(),
            };
            match self.step(result, attempt) {
                Step::Done(result) => return result,
                Step::Retry { error, attempt: next } => {
                    let wait = self.before_retry(&error, next);
                    std::thread::sleep(wait);
                    attempt = next;
                }
            }
        }
    }

    fn injected_fault(&self, attempt: u32) -> Option<Error> {
        self.chaos
            .as_ref()
            .filter(|chaos| chaos.should_inject(attempt, self.retry.retry_count))
            .map(|chaos| chaos.fault(&self.name))
    }

    fn step<T>(&self, result: Result<T>, attempt: u32) -> Step<T> {
        match result {
            Ok(value) => Step::Done(Ok(value)),
            Err(error) if !(self.retry.classifier)(&error) => Step::Done(Err(error)),
            Err(error) if attempt < self.retry.retry_count => Step::Retry {
                error,
                attempt: attempt + 1,
            },
            Err(error) => Step::Done(Err(Error::RetriesExhausted {
                policy: self.name.clone(),
                attempts: attempt + 1,
                source: Box::new(error),
            })),
        }
    }

    fn before_retry(&self, error: &Error, attempt: u32) -> Duration {
        let wait = self.retry.next_wait();
        retry_span(&self.name, attempt, wait).in_scope(|| {
            warn!(
                policy = %self.name,
                attempt,
                wait_ms = wait.as_millis() as u64,
                %error,
                "transient transport fault, retrying"
            );
        });
        metrics::policy_retries().add(1, &[KeyValue::new("policy", self.name.clone())]);
        wait
    }
}
