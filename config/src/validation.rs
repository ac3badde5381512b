//! # Configuration Validation
//!
//! Validation of the merged configuration and the one-call layered loader
//! used by the server binary.

use crate::config::Config;
use crate::file_loader::{ConfigFileError, load_from_file};
use crate::loader::{EnvError, load_from_env};
use crate::precedence::merge_configs;
use std::path::Path;
use validator::Validate;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    File(#[from] ConfigFileError),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors)
}

/// Validate configuration structure.
///
/// # M-CANONICAL-DOCS
///
/// ## Validation Rules
/// ### Breaker
/// - all thresholds and `half_open_max_calls`: at least 1
///
/// ### Reconnect
/// - `max_attempts`: 1-20
/// - `replay_buffer_capacity`: 1-10000
/// - backoff, timeout and interval fields: at least 1
///
/// ### Registry
/// - provider ids: 1-64 characters, unique across the registry
/// - `audio_encodings`: at least one entry
///
/// ### Observability
/// - `logging_level`: must be "trace", "debug", "info", "warn", or "error"
pub fn validate(config: &Config) -> Result<(), validator::ValidationErrors> {
    config.validate()
}

/// Defaults, then the optional file, then the environment, then validation.
///
/// ```rust,no_run
/// use config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Some(Path::new("relay.toml"))).expect("valid config");
/// println!("{} providers", config.registry.providers.len());
/// ```
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let file_config = match path {
        Some(path) => load_from_file(path)?,
        None => Config::default()
    };
    let env_config = load_from_env()?;

    let config = merge_configs(
        Config::default(),
        file_config,
        "file",
        env_config,
        "env",
        None,
        "cli"
    );
    validate(&config)?;
    Ok(config)
}
