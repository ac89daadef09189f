//! ---
//! rq_section: "01-core-functionality"
//! rq_subsection: "module"
//! rq_type: "source"
//! rq_scope: "code"
//! rq_description: "Shared primitives and utilities for the broker runtime."
//! rq_version: "v0.0.0-prealpha"
//! rq_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_namespace() -> String {
    "rq".to_owned()
}

fn default_initial_worklimit() -> usize {
    1
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_pop_error_backoff() -> Duration {
    Duration::from_millis(1000)
}

fn default_logging_directory() -> Option<PathBuf> {
    None
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Primary configuration object for an R-MQ host process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "RQ_CONFIG";

    /// Load configuration from disk, respecting the `RQ_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.broker.validate()
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// How request/response calls receive their answers.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RpcStrategy {
    /// One long-lived listener per broker demultiplexes every response.
    #[default]
    SharedBackchannel,
    /// Every call waits on its own response key.
    PerCall,
}

/// What a responder does when answering a request fails.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorPolicy {
    /// Report the failure locally; the caller runs into its timeout.
    #[default]
    Silent,
    /// Additionally push an error record so the caller fails fast.
    Reply,
}

/// Tunables for listeners and request/response calls.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Prefix applied to every key the broker creates on its own behalf.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Concurrency ceiling for new listeners. `0` means unbounded.
    #[serde(default = "default_initial_worklimit")]
    pub initial_worklimit: usize,
    #[serde(default = "default_rpc_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub rpc_timeout: Duration,
    #[serde(default)]
    pub rpc_strategy: RpcStrategy,
    #[serde(default)]
    pub rpc_error_policy: RpcErrorPolicy,
    /// Blocking pop wait used by pop-loops. Zero waits indefinitely.
    #[serde(default)]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub pop_timeout: Duration,
    #[serde(default = "default_pop_error_backoff")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub pop_error_backoff: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            initial_worklimit: default_initial_worklimit(),
            rpc_timeout: default_rpc_timeout(),
            rpc_strategy: RpcStrategy::default(),
            rpc_error_policy: RpcErrorPolicy::default(),
            pop_timeout: Duration::ZERO,
            pop_error_backoff: default_pop_error_backoff(),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(anyhow!("broker namespace cannot be empty"));
        }
        if self.namespace.chars().any(char::is_whitespace) {
            return Err(anyhow!(
                "broker namespace '{}' must not contain whitespace",
                self.namespace
            ));
        }
        if self.rpc_timeout.is_zero() {
            return Err(anyhow!("rpc_timeout must be at least one second"));
        }
        Ok(())
    }

    /// Builder helper used by tests and embedding applications.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_initial_worklimit(mut self, limit: usize) -> Self {
        self.initial_worklimit = limit;
        self
    }

    pub fn with_rpc_strategy(mut self, strategy: RpcStrategy) -> Self {
        self.rpc_strategy = strategy;
        self
    }

    pub fn with_rpc_error_policy(mut self, policy: RpcErrorPolicy) -> Self {
        self.rpc_error_policy = policy;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the daily rolling JSON log. Disabled when unset.
    #[serde(default = "default_logging_directory")]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}
