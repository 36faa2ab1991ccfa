//! Configuration management for the orchestration core.
//!
//! Configuration can be set via environment variables:
//! - `CREWKIT_DEFAULT_MODEL` - Optional. LLM model identifier passed to the client.
//! - `CREWKIT_MAX_ITERATIONS` - Optional. Maximum reasoning loop iterations. Defaults to `10`.
//! - `CREWKIT_LOCK_TTL_MS` - Optional. Default file lock TTL. Defaults to `300000` (5 minutes).
//! - `CREWKIT_LOCK_SWEEP_MS` - Optional. Background lock sweep interval. Defaults to `60000`.
//! - `CREWKIT_WAIT_POLL_MS` - Optional. Coordinator wait_for_task poll interval. Defaults to `1000`.
//! - `CREWKIT_WAIT_TIMEOUT_MS` - Optional. Default wait_for_task timeout. Defaults to `60000`.
//! - `CREWKIT_WORKSPACE_PATH` - Optional. Workspace directory for tool execution.
//!   Defaults to the current directory.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Default LLM model identifier
    pub default_model: String,

    /// Workspace directory for tool execution
    pub workspace_path: PathBuf,

    /// Maximum iterations for the reasoning loop
    pub max_iterations: usize,

    /// Default TTL for file locks, in milliseconds
    pub lock_ttl_ms: u64,

    /// Interval between background lock expiry sweeps, in milliseconds
    pub lock_sweep_ms: u64,

    /// Poll interval for the coordinator's wait_for_task, in milliseconds
    pub wait_poll_ms: u64,

    /// Default timeout for wait_for_task, in milliseconds
    pub wait_timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let default_model = std::env::var("CREWKIT_DEFAULT_MODEL")
            .unwrap_or_else(|_| "anthropic/claude-sonnet-4.5".to_string());

        let workspace_path = std::env::var("CREWKIT_WORKSPACE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        Ok(Self {
            default_model,
            workspace_path,
            max_iterations: parse_env("CREWKIT_MAX_ITERATIONS", 10)?,
            lock_ttl_ms: parse_env("CREWKIT_LOCK_TTL_MS", 300_000)?,
            lock_sweep_ms: parse_env("CREWKIT_LOCK_SWEEP_MS", 60_000)?,
            wait_poll_ms: parse_env("CREWKIT_WAIT_POLL_MS", 1_000)?,
            wait_timeout_ms: parse_env("CREWKIT_WAIT_TIMEOUT_MS", 60_000)?,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(default_model: impl Into<String>, workspace_path: PathBuf) -> Self {
        Self {
            default_model: default_model.into(),
            workspace_path,
            max_iterations: 10,
            lock_ttl_ms: 300_000,
            lock_sweep_ms: 60_000,
            wait_poll_ms: 1_000,
            wait_timeout_ms: 60_000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new("anthropic/claude-sonnet-4.5", PathBuf::from("."))
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(var.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}
