//! # Configuration System
//!
//! Centralized configuration for the voice relay.
//!
//! This crate provides:
//! - Configuration structures for every relay component
//! - Environment variable loading (12-factor app principles)
//! - Configuration file loading (TOML/YAML)
//! - Configuration precedence (CLI > env > file > defaults)
//! - Configuration validation

pub mod config;
pub mod file_loader;
pub mod loader;
pub mod precedence;
pub mod validation;

pub use config::{
    BreakerConfig, Config, ObservabilityConfig, PostgresConfig, ProviderEntryConfig,
    ReconnectConfig, RedisConfig, RegistryConfig, ServerConfig, SessionConfig, StorageConfig
};
pub use file_loader::{ConfigFileError, FileFormat, load_from_file, load_from_toml, load_from_yaml};
pub use loader::{EnvError, load_from_env};
pub use precedence::merge_configs;
pub use validation::{ConfigError, load_config, validate};
