mod logging;
mod store;

pub use logging::{LogFormat, LoggingConfig};
pub use store::{StoreBackend, StoreConfig};

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Root configuration for a sagaflow engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Execution behaviour.
    #[serde(default)]
    pub engine: ExecutionConfig,

    /// Where run state is persisted.
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| FlowError::Config(format!("Failed to read config file: {}", e)))?;

        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content)?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| FlowError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.engine.durability == Durability::Durable
            && self.store.backend == StoreBackend::Memory
        {
            tracing::warn!("durable mode with the memory store keeps runs only until restart");
        }
        if self.store.backend == StoreBackend::File && self.store.path.is_none() {
            return Err(FlowError::Config(
                "store.path is required for the file backend".into(),
            ));
        }
        if self.store.backend == StoreBackend::Postgres && self.store.url.is_none() {
            return Err(FlowError::Config(
                "store.url is required for the postgres backend".into(),
            ));
        }
        if self.engine.workflow_timeout_secs == Some(0) || self.engine.step_timeout_secs == Some(0)
        {
            return Err(FlowError::Config("timeouts must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Whether runs are persisted while they execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// Runs live in memory and are lost on crash.
    #[default]
    Ephemeral,
    /// Runs are checkpointed to the configured store on every transition.
    Durable,
}

/// What to do with non-terminal runs found in the store at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPolicy {
    /// Leave them for an operator.
    #[default]
    Manual,
    /// Roll every interrupted run back.
    Compensate,
    /// Continue interrupted runs where they stopped.
    Resume,
}

/// Execution behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub durability: Durability,

    /// Keep successful runs in the store after they finish.
    #[serde(default = "default_retain_completed")]
    pub retain_completed_runs: bool,

    /// Deadline for a whole run, observed between steps.
    #[serde(default)]
    pub workflow_timeout_secs: Option<u64>,

    /// Default timeout for steps that do not set their own.
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,

    #[serde(default)]
    pub recovery: RecoveryPolicy,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            durability: Durability::default(),
            retain_completed_runs: default_retain_completed(),
            workflow_timeout_secs: None,
            step_timeout_secs: None,
            recovery: RecoveryPolicy::default(),
        }
    }
}

impl ExecutionConfig {
    pub fn workflow_timeout(&self) -> Option<Duration> {
        self.workflow_timeout_secs.map(Duration::from_secs)
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }
}

fn default_retain_completed() -> bool {
    true
}

/// Substitute `${VAR}` references with environment values.
///
/// Unset variables are left untouched so TOML parsing reports them.
fn substitute_env_vars(content: &str) -> Result<String> {
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
        .map_err(|e| FlowError::Config(e.to_string()))?;
    let mut result = content.to_string();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    Ok(result)
}
