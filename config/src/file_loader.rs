//! Relay configuration files.
//!
//! The format follows the extension: `.toml`, `.yaml` or `.yml`. A file
//! only needs the sections it overrides; everything else keeps its default.

use crate::config::Config;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Toml,
    Yaml
}

impl FileFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "toml" => Some(Self::Toml),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Toml => "TOML",
            Self::Yaml => "YAML"
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("Relay config file {path} not found")]
    NotFound { path: PathBuf },

    #[error("Failed to read relay config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error
    },

    /// Also covers unknown provider kinds, cost tiers and audio encodings.
    #[error("Invalid {format} in {path}: {reason}")]
    Parse {
        path: PathBuf,
        format: FileFormat,
        reason: String
    },

    #[error("Relay config file {path} must end in .toml, .yaml or .yml")]
    UnknownFormat { path: PathBuf }
}

/// Load a relay config file, picking the parser from its extension.
pub fn load_from_file(path: &Path) -> Result<Config, ConfigFileError> {
    let format = FileFormat::from_path(path).ok_or_else(|| ConfigFileError::UnknownFormat {
        path: path.to_path_buf()
    })?;
    parse(path, format)
}

pub fn load_from_toml(path: &Path) -> Result<Config, ConfigFileError> {
    parse(path, FileFormat::Toml)
}

pub fn load_from_yaml(path: &Path) -> Result<Config, ConfigFileError> {
    parse(path, FileFormat::Yaml)
}

fn parse(path: &Path, format: FileFormat) -> Result<Config, ConfigFileError> {
    let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => ConfigFileError::NotFound {
            path: path.to_path_buf()
        },
        _ => ConfigFileError::Read {
            path: path.to_path_buf(),
            source: e
        }
    })?;

    let parsed = match format {
        FileFormat::Toml => toml::from_str(&contents).map_err(|e| e.to_string()),
        FileFormat::Yaml => serde_yaml::from_str(&contents).map_err(|e| e.to_string())
    };
    parsed.map_err(|reason| ConfigFileError::Parse {
        path: path.to_path_buf(),
        format,
        reason
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{AudioEncoding, CostTier, ProviderKind};
    use std::fs;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_from_toml() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("toml");

        let toml_content = r#"
[storage.postgres]
host = "pghost"
port = 5433

[storage.redis]
host = "redishost"
key_prefix = "relay-test"

[breaker]
failure_threshold = 3

[reconnect]
max_attempts = 4

[[registry.providers]]
id = "openai-realtime"
endpoint = "wss://api.openai.com/v1/realtime"
model = "gpt-4o-realtime-preview"
kind = "realtime"
multimodal = true
function_calling = true
audio_encodings = ["pcm16", "mulaw"]
cost_tier = "premium"
priority = 10

[[registry.providers]]
id = "budget-pipeline"
endpoint = "wss://pipeline.internal/ws"
model = "small"
kind = "segmented"
audio_encodings = ["mulaw"]
cost_tier = "economy"
rate_limit_aware = true

[observability]
logging_level = "debug"
"#;
        fs::write(&path, toml_content).unwrap();

        let config = load_from_toml(&path).unwrap();
        assert_eq!(config.storage.postgres.host, "pghost");
        assert_eq!(config.storage.postgres.port, 5433);
        assert_eq!(config.storage.redis.key_prefix, "relay-test");
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.success_threshold, 2);
        assert_eq!(config.reconnect.max_attempts, 4);
        assert_eq!(config.observability.logging_level, "debug");

        let providers = &config.registry.providers;
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].kind, ProviderKind::Realtime);
        assert_eq!(providers[0].audio_encodings, vec![AudioEncoding::Pcm16, AudioEncoding::Mulaw]);
        assert_eq!(providers[1].cost_tier, CostTier::Economy);
        assert!(providers[1].rate_limit_aware);
        assert!(providers[1].enabled);
    }

    #[test]
    fn test_load_from_yaml() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("yaml");

        let yaml_content = r#"
storage:
  postgres:
    host: pghost
  redis:
    enabled: false
session:
  max_failovers: 1
registry:
  providers:
    - id: a
      endpoint: wss://a.test
      model: m
      kind: segmented
      audio_encodings: [pcm16]
      cost_tier: standard
"#;
        fs::write(&path, yaml_content).unwrap();

        let config = load_from_yaml(&path).unwrap();
        assert_eq!(config.storage.postgres.host, "pghost");
        assert!(!config.storage.redis.enabled);
        assert_eq!(config.session.max_failovers, 1);
        assert_eq!(config.registry.providers[0].cost_tier, CostTier::Standard);
    }

    #[test]
    fn test_unknown_enum_spelling_rejected() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("toml");
        let toml_content = r#"
[[registry.providers]]
id = "a"
endpoint = "wss://a.test"
model = "m"
kind = "hybrid"
audio_encodings = ["pcm16"]
cost_tier = "standard"
"#;
        fs::write(&path, toml_content).unwrap();

        let err = load_from_toml(&path).unwrap_err();
        assert!(matches!(
            err,
            ConfigFileError::Parse {
                format: FileFormat::Toml,
                ..
            }
        ));
        assert!(err.to_string().contains("hybrid"), "{err}");
    }

    #[test]
    fn test_load_from_file_unsupported() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("json");
        fs::write(&path, "{}").unwrap();

        let result = load_from_file(&path);
        assert!(matches!(result, Err(ConfigFileError::UnknownFormat { .. })));
    }

    #[test]
    fn test_load_from_file_without_extension() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("");
        fs::write(&path, "").unwrap();

        let result = load_from_file(&path);
        assert!(matches!(result, Err(ConfigFileError::UnknownFormat { .. })));
    }

    #[test]
    fn test_load_from_yaml_invalid() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("yaml");
        fs::write(&path, "invalid: [unmatched\n").unwrap();

        let result = load_from_yaml(&path);
        assert!(matches!(
            result,
            Err(ConfigFileError::Parse {
                format: FileFormat::Yaml,
                ..
            })
        ));
    }

    #[test]
    fn test_load_from_toml_not_found() {
        let path = Path::new("/nonexistent/path/relay.toml");
        let err = load_from_toml(path).unwrap_err();
        assert!(matches!(err, ConfigFileError::NotFound { .. }));
        assert!(err.to_string().contains("/nonexistent/path/relay.toml"));
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(FileFormat::from_path(Path::new("relay.TOML")), Some(FileFormat::Toml));
        assert_eq!(FileFormat::from_path(Path::new("relay.yml")), Some(FileFormat::Yaml));
        assert_eq!(FileFormat::from_path(Path::new("relay")), None);
    }
}
