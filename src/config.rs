use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

/// Transfer engine settings
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TransferConfig {
    /// Deadline for one transfer transaction; none means wait for locks indefinitely
    #[serde(default)]
    pub tx_timeout_ms: Option<u64>,
}

impl TransferConfig {
    pub fn tx_timeout(&self) -> Option<Duration> {
        self.tx_timeout_ms.map(Duration::from_millis)
    }
}

impl AppConfig {
    /// Load `config/<env>.yaml`, then apply environment overrides
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let config = Self::from_file(&config_path)?;
        Ok(config.with_database_url(std::env::var("DATABASE_URL").ok()))
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Replace the database URL when an override is given
    pub fn with_database_url(mut self, url: Option<String>) -> Self {
        if let Some(url) = url {
            self.database.url = url;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
log_level: "info"
log_dir: "./logs"
log_file: "simple_bank.log"
use_json: true
rotation: "daily"
database:
  url: "postgres://localhost/simple_bank"
  max_connections: 20
  acquire_timeout_ms: 2000
transfer:
  tx_timeout_ms: 1500
"#;

    #[test]
    fn test_app_config_deserialize() {
        let config = AppConfig::from_yaml(YAML).unwrap();

        assert_eq!(config.log_level, "info");
        assert!(config.use_json);
        assert_eq!(config.database.url, "postgres://localhost/simple_bank");
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(
            config.transfer.tx_timeout(),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_defaults_when_sections_omitted() {
        let yaml = r#"
log_level: "debug"
log_dir: "./logs"
log_file: "bank.log"
use_json: false
rotation: "never"
database:
  url: "postgres://localhost/bank"
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.database.acquire_timeout_ms, 5000);
        assert_eq!(config.transfer.tx_timeout(), None);
    }

    #[test]
    fn test_database_url_override() {
        let config = AppConfig::from_yaml(YAML).unwrap();

        let same = config.clone().with_database_url(None);
        assert_eq!(same.database.url, "postgres://localhost/simple_bank");

        let overridden = config.with_database_url(Some("postgres://db:5432/other".into()));
        assert_eq!(overridden.database.url, "postgres://db:5432/other");
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let err = AppConfig::from_yaml("log_level: [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = AppConfig::from_file("config/does-not-exist.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
