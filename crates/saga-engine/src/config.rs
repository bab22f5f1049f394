//! Configuration for the saga engine.

use crate::error::{Result, SagaEngineError};
use crate::recovery::RecoveryStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for an embedding application's saga engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaEngineConfig {
    /// Saga log backend configuration.
    pub log: LogConfig,

    /// Saga handle mailbox configuration.
    pub mailbox: MailboxConfig,

    /// Crash recovery configuration.
    pub recovery: RecoveryConfig,
}

impl SagaEngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(SagaEngineError::configuration)?;
        Self::from_str(&contents)
    }

    /// Parses configuration from a JSON string.
    pub fn from_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(SagaEngineError::configuration)
    }

    /// Saves configuration to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).map_err(SagaEngineError::configuration)?;
        std::fs::write(path, contents).map_err(SagaEngineError::configuration)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        self.log.validate()?;
        self.mailbox.validate()?;
        Ok(())
    }
}

impl Default for SagaEngineConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            mailbox: MailboxConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

/// Saga log backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Which backend to construct.
    pub backend: LogBackend,

    /// Database connection URL, required when `backend` is `Postgres`.
    pub database_url: Option<String>,

    /// Maximum number of pooled connections, for backends that pool.
    pub max_connections: u32,
}

impl LogConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if matches!(self.backend, LogBackend::Postgres) && self.database_url.is_none() {
            return Err(SagaEngineError::configuration("database_url required for the postgres log backend"));
        }

        if self.max_connections == 0 {
            return Err(SagaEngineError::configuration("max_connections must be greater than 0"));
        }

        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            backend: LogBackend::Memory,
            database_url: None,
            max_connections: 10,
        }
    }
}

/// Which [`crate::log::SagaLog`] implementation to construct.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogBackend {
    /// `log::memory::InMemorySagaLog`.
    Memory,
    /// `log::document::DocumentSagaLog`, behind the `postgres` feature.
    Postgres,
}

/// [`crate::saga::Saga`] mailbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Bound on a single mutation round trip, in milliseconds.
    pub timeout_ms: u64,
}

impl MailboxConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(SagaEngineError::configuration("timeout_ms must be greater than 0"));
        }
        Ok(())
    }

    /// This configuration's timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: crate::saga::DEFAULT_MAILBOX_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Crash recovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Default strategy applied to sagas found in an unsafe state.
    pub strategy: RecoveryStrategyConfig,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            strategy: RecoveryStrategyConfig::Rollback,
        }
    }
}

/// Serializable mirror of [`RecoveryStrategy`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecoveryStrategyConfig {
    /// See [`RecoveryStrategy::Forward`].
    Forward,
    /// See [`RecoveryStrategy::Rollback`].
    Rollback,
}

impl From<RecoveryStrategyConfig> for RecoveryStrategy {
    fn from(value: RecoveryStrategyConfig) -> Self {
        match value {
            RecoveryStrategyConfig::Forward => RecoveryStrategy::Forward,
            RecoveryStrategyConfig::Rollback => RecoveryStrategy::Rollback,
        }
    }
}
