//! Transport policies.
//!
//! Every transport call runs under a named [`TransportPolicy`] looked up in
//! a [`PolicyRegistry`]. A policy classifies the error, retries transient
//! faults a bounded number of times with a jittered wait, and logs each
//! retry. A [`ChaosPolicy`] can sit in front of a policy to raise synthetic
//! transient faults in tests.
//!
//! The registry is built once per queue and never mutated afterwards;
//! clones share the same map.

pub mod chaos;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::PolicyConfiguration;
use crate::error::{Error, Result};

pub use chaos::ChaosPolicy;
pub use retry::{Classifier, RetryPolicy, TransportPolicy};

/// Name of a registered policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PolicyKey(&'static str);

impl PolicyKey {
    /// State-changing transport calls: enqueue, claim, update, delete,
    /// heartbeat and the monitor scans.
    pub const COMMAND: PolicyKey = PolicyKey("command-retry");
    /// Read-only transport calls: get and count.
    pub const QUERY: PolicyKey = PolicyKey("query-retry");

    pub const fn custom(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: Arc<HashMap<PolicyKey, TransportPolicy>>,
}

impl PolicyRegistry {
    /// Command and query policies built from one configuration section.
    pub fn from_configuration(config: &PolicyConfiguration) -> Self {
        Self::builder().defaults(config).build()
    }

    pub fn builder() -> PolicyRegistryBuilder {
        PolicyRegistryBuilder::default()
    }

    pub fn get(&self, key: PolicyKey) -> Result<&TransportPolicy> {
        self.policies
            .get(&key)
            .ok_or_else(|| Error::Config(format!("no policy registered for {key}")))
    }

    pub fn keys(&self) -> impl Iterator<Item = PolicyKey> + '_ {
        self.policies.keys().copied()
    }
}

#[derive(Default)]
pub struct PolicyRegistryBuilder {
    policies: HashMap<PolicyKey, TransportPolicy>,
    classifier: Option<Classifier>,
}

impl PolicyRegistryBuilder {
    /// Classifier applied to the policies registered by [`defaults`](Self::defaults).
    pub fn classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Register [`PolicyKey::COMMAND`] and [`PolicyKey::QUERY`] from `config`.
    pub fn defaults(mut self, config: &PolicyConfiguration) -> Self {
        for key in [PolicyKey::COMMAND, PolicyKey::QUERY] {
            let mut retry = RetryPolicy::new(config.retry_count, config.min_wait, config.max_wait);
            if let Some(classifier) = &self.classifier {
                retry = retry.classifier(classifier.clone());
            }
            let mut policy = TransportPolicy::new(key.as_str(), retry);
            if config.enable_chaos {
                policy = policy.with_chaos(ChaosPolicy::new(true, config.chaos_injection_rate));
            }
            self.policies.insert(key, policy);
        }
        self
    }

    pub fn register(mut self, key: PolicyKey, policy: TransportPolicy) -> Self {
        self.policies.insert(key, policy);
        self
    }

    pub fn build(self) -> PolicyRegistry {
        PolicyRegistry {
            policies: Arc::new(self.policies),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_register_command_and_query() {
        let registry = PolicyRegistry::from_configuration(&PolicyConfiguration::default());
        assert_eq!(registry.get(PolicyKey::COMMAND).unwrap().name(), "command-retry");
        assert_eq!(registry.get(PolicyKey::QUERY).unwrap().name(), "query-retry");
        assert!(registry.get(PolicyKey::custom("missing")).is_err());
    }

    #[test]
    fn chaos_only_attached_when_enabled() {
        let mut config = PolicyConfiguration::default();
        let registry = PolicyRegistry::from_configuration(&config);
        assert!(registry.get(PolicyKey::COMMAND).unwrap().chaos().is_none());

        config.enable_chaos = true;
        config.chaos_injection_rate = 0.25;
        let registry = PolicyRegistry::from_configuration(&config);
        let chaos = registry.get(PolicyKey::COMMAND).unwrap().chaos().unwrap();
        assert!(chaos.is_enabled());
        assert_eq!(chaos.injection_rate(), 0.25);
    }
}
