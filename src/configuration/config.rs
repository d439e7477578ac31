use std::fs;
use std::path::Path;

use log::info;
use serde::Deserialize;

use crate::configuration::types::{CaptureConfig, ReplicationConfig};
use crate::error_handling::types::ConfigError;

fn default_db_path() -> String {
    "./amber.sqlite3".to_string()
}

fn default_blob_root() -> String {
    "./archives".to_string()
}

/// Top-level daemon configuration, loaded from a TOML file.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct Config {
    /// SQLite database holding links, jobs and replication state.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Root directory of the blob store where finished WARCs land.
    #[serde(default = "default_blob_root")]
    pub blob_root: String,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            blob_root: default_blob_root(),
            capture: CaptureConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&raw).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let ports = &self.capture.port_range;
        if ports.start >= ports.end {
            return Err(ConfigError::BadPortsRange(format!(
                "{}..{}",
                ports.start, ports.end
            )));
        }
        if self.capture.max_archive_file_size == 0 {
            return Err(ConfigError::NotInRange(
                "capture.max_archive_file_size must be positive".to_string(),
            ));
        }
        if self.capture.proxy_captures && self.capture.upstream_proxy_address.is_none() {
            return Err(ConfigError::MissingField(
                "capture.upstream_proxy_address".to_string(),
            ));
        }
        if let Some(parent) = Path::new(&self.db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(ConfigError::DirectoryDoesNotExist(
                    parent.display().to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capture.port_range.start, 27500);
        assert_eq!(config.capture.timeouts.after_load, 25);
        assert_eq!(config.replication.daily_identifier_prefix, "daily_perma_cc");
    }

    #[test]
    fn parses_minimal_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
db_path = "./test.sqlite3"

[capture]
max_archive_file_size = 1048576

[replication]
endpoint = "http://localhost:9999"
metadata_endpoint = "http://localhost:9999/metadata"
access_key = "ak"
secret_key = "sk"
daily_limit = 7
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.capture.max_archive_file_size, 1048576);
        assert_eq!(config.replication.daily_limit, 7);
        // unset sections fall back to defaults
        assert_eq!(config.capture.timeouts.robots_txt, 30);
    }

    #[test]
    fn rejects_inverted_port_range() {
        let mut config = Config::default();
        config.capture.port_range.start = 28000;
        config.capture.port_range.end = 27500;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadPortsRange(_))
        ));
    }

    #[test]
    fn proxying_requires_upstream_address() {
        let mut config = Config::default();
        config.capture.proxy_captures = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField(_))
        ));
    }
}
