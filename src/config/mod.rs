//! Typed configuration.
//!
//! Process settings load once from environment variables and fail fast if
//! required vars are missing. Per-queue settings live in [`queue`] and load
//! from TOML. Sensitive values are wrapped in secrecy::SecretString to
//! prevent log leaks.

pub mod queue;
pub mod secrets;

use std::path::PathBuf;

use crate::error::{Error, Result};
use secrecy::SecretString;

pub use queue::{
    DelayBehavior, DelayedProcessingConfiguration, ErrorPolicy, HeartBeatConfiguration,
    MessageExpirationConfiguration, PolicyConfiguration, QueueConfiguration, Retention,
    RetryDelayBehavior, ThreadPoolConfiguration, WorkerConfiguration,
};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Queue the CLI operates on.
    pub queue_name: String,
    /// Optional TOML file with a [`QueueConfiguration`].
    pub queue_config_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            queue_name: std::env::var("WORKQ_QUEUE").unwrap_or_else(|_| "workq".to_string()),
            queue_config_path: std::env::var("WORKQ_CONFIG").ok().map(PathBuf::from),
        })
    }

    /// The queue configuration file if one is set, defaults otherwise.
    pub fn queue_configuration(&self) -> Result<QueueConfiguration> {
        match &self.queue_config_path {
            Some(path) => QueueConfiguration::load(path),
            None => Ok(QueueConfiguration::default()),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
