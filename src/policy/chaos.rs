//! Synthetic fault injection for exercising retry paths.
//!
//! A chaos policy sits in front of an operation and raises a transient
//! error before the real call runs. It only fires on attempts that still
//! have a retry left, so injected faults alone never exhaust a policy.
//! With `enabled = false` it never fires.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::Error;

#[derive(Debug, Clone)]
pub struct ChaosPolicy {
    enabled: bool,
    injection_rate: f64,
    rng: Arc<Mutex<StdRng>>,
}

impl ChaosPolicy {
    pub fn new(enabled: bool, injection_rate: f64) -> Self {
        Self::with_rng(enabled, injection_rate, StdRng::from_entropy())
    }

    /// Reproducible injection sequence.
    pub fn seeded(enabled: bool, injection_rate: f64, seed: u64) -> Self {
        Self::with_rng(enabled, injection_rate, StdRng::seed_from_u64(seed))
    }

    fn with_rng(enabled: bool, injection_rate: f64, rng: StdRng) -> Self {
        Self {
            enabled,
            injection_rate: injection_rate.clamp(0.0, 1.0),
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn injection_rate(&self) -> f64 {
        self.injection_rate
    }

    /// Should zero-based `attempt` fail before running?
    pub fn should_inject(&self, attempt: u32, retry_count: u32) -> bool {
        if !self.enabled || attempt >= retry_count {
            return false;
        }
        match self.injection_rate {
            r if r <= 0.0 => false,
            r if r >= 1.0 => true,
            r => self.rng.lock().gen_bool(r),
        }
    }

    pub fn fault(&self, policy: &str) -> Error {
        Error::Transient(format!("chaos: injected fault in {policy}"))
    }
}
