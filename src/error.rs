//! Error types for priority-scheduler operations.
//!
//! Defines error types for the major subsystems:
//! - Coordination store access (Redis or in-memory)
//! - Configuration loading and validation
//! - Scheduler lifecycle
//! - Agent execution
//! - Agent kind registry

use std::time::Duration;

use thiserror::Error;

/// Errors raised while talking to the coordination store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the store.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis command or script failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Operation timed out.
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// Returns whether retrying the operation may succeed.
    ///
    /// Script and type errors are deterministic and are never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::ConnectionFailed(_) | StoreError::Timeout(_) => true,
            StoreError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
                    || e.is_cluster_error()
            }
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Errors surfaced by the scheduler lifecycle.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The coordination store failed after retries.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration detected at startup.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Scheduler is already running.
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// Scheduler is not running.
    #[error("Scheduler is not running")]
    NotRunning,

    /// In-flight agents did not finish before the shutdown deadline.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Failure reported by (or captured around) an agent run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    /// The agent reported a failed run.
    #[error("Agent failed: {0}")]
    Failed(String),

    /// The agent panicked; the panic was caught at the dispatch boundary.
    #[error("Agent panicked: {0}")]
    Panicked(String),
}

/// Errors from the agent kind registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown agent kind '{0}'")]
    UnknownKind(String),

    #[error("Agent '{0}' is defined more than once")]
    DuplicateKey(String),

    #[error("Invalid agent definition for '{key}': {message}")]
    InvalidDefinition { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
