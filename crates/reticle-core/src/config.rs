//! Engine configuration
//!
//! Settings come from [`Default`], a YAML document, or `RETICLE_*` environment
//! variables layered over either. Invalid values are rejected by
//! [`EngineConfig::validate`] before a network or session is built from them.

use crate::error::{ReticleError, ReticleResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Runtime settings for network partitioning and session evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of parallel evaluation slots rules are spread over
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    /// When false every rule lands on one agenda evaluated on the calling thread
    #[serde(default = "default_true")]
    pub multithread_evaluation: bool,
    /// Size of the process-wide pool running async send computations
    #[serde(default = "default_async_workers")]
    pub async_workers: usize,
    /// How long an idle partition loop blocks before re-checking quiescence and halt
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// How many recent message keys each async-receive node remembers to
    /// drop redeliveries
    #[serde(default = "default_message_dedup_window")]
    pub message_dedup_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            multithread_evaluation: true,
            async_workers: default_async_workers(),
            idle_poll_ms: default_idle_poll_ms(),
            message_dedup_window: default_message_dedup_window(),
        }
    }
}

impl EngineConfig {
    /// A configuration that never spawns partition threads
    pub fn single_threaded() -> Self {
        Self { partitions: 1, multithread_evaluation: false, ..Self::default() }
    }

    /// Fixed partition count, other settings default
    pub fn with_partitions(partitions: usize) -> Self {
        Self { partitions, ..Self::default() }
    }

    /// Parse a YAML document; absent keys take their defaults
    pub fn from_yaml_str(yaml: &str) -> ReticleResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> ReticleResult<Self> {
        let config = Self::default().apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RETICLE_*` environment overrides on top of this configuration
    pub fn apply_env(mut self) -> ReticleResult<Self> {
        if let Some(partitions) = env_override::<usize>("RETICLE_PARTITIONS")? {
            self.partitions = partitions;
        }
        if let Some(multithread) = env_override::<bool>("RETICLE_MULTITHREAD")? {
            self.multithread_evaluation = multithread;
        }
        if let Some(workers) = env_override::<usize>("RETICLE_ASYNC_WORKERS")? {
            self.async_workers = workers;
        }
        if let Some(poll) = env_override::<u64>("RETICLE_IDLE_POLL_MS")? {
            self.idle_poll_ms = poll;
        }
        if let Some(window) = env_override::<usize>("RETICLE_MESSAGE_DEDUP_WINDOW")? {
            self.message_dedup_window = window;
        }
        debug!(?self, "Applied environment overrides");
        Ok(self)
    }

    pub fn validate(&self) -> ReticleResult<()> {
        if self.partitions == 0 {
            return Err(ReticleError::configuration(
                "partitions",
                ">= 1",
                "0",
                "At least one partition is required",
            ));
        }
        if self.async_workers == 0 {
            return Err(ReticleError::configuration(
                "async_workers",
                ">= 1",
                "0",
                "At least one async worker is required",
            ));
        }
        if self.message_dedup_window == 0 {
            return Err(ReticleError::configuration(
                "message_dedup_window",
                ">= 1",
                "0",
                "Async receivers need room for at least one message key",
            ));
        }
        if self.idle_poll_ms == 0 {
            warn!("idle_poll_ms is 0, idle partition loops will spin");
        }
        Ok(())
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }
}

fn env_override<T: std::str::FromStr>(name: &str) -> ReticleResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            ReticleError::configuration(
                name,
                std::any::type_name::<T>(),
                &raw,
                format!("Cannot parse environment variable {name}"),
            )
        }),
        Err(_) => Ok(None),
    }
}

fn default_partitions() -> usize {
    num_cpus::get().max(1)
}

fn default_async_workers() -> usize {
    num_cpus::get().max(1)
}

fn default_true() -> bool {
    true
}

fn default_idle_poll_ms() -> u64 {
    5
}

fn default_message_dedup_window() -> usize {
    4096
}
