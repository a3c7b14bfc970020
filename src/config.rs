//! Configuration types for recproxy

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::{ProxyError, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the proxy listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Directory that relative recording paths resolve against
    #[serde(default = "default_storage_location")]
    pub storage_location: PathBuf,
    /// Git asset store settings
    #[serde(default)]
    pub git: GitConfig,
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_storage_location() -> PathBuf {
    PathBuf::from(".")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            storage_location: default_storage_location(),
            git: GitConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

/// Settings for the git-backed asset store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Attempts made for a git command failing with a retriable error
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base delay between attempts, multiplied by the attempt number
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Prefix joined with `AssetsRepo` to form the clone URL
    #[serde(default = "default_remote_base")]
    pub remote_base: String,
    /// Commit author name used by push
    #[serde(default)]
    pub user_name: Option<String>,
    /// Commit author email used by push
    #[serde(default)]
    pub user_email: Option<String>,
    /// Skip the minimum git version check at startup
    #[serde(default)]
    pub skip_version_check: bool,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_remote_base() -> String {
    "https://github.com/".to_string()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            remote_base: default_remote_base(),
            user_name: None,
            user_email: None,
            skip_version_check: false,
        }
    }
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum request body size in bytes
    pub max_request_size: usize,
    /// Maximum headers per request
    pub max_headers: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_request_size: 256 * 1024 * 1024, // 256 MB
            max_headers: 256,
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if self.storage_location.exists() && !self.storage_location.is_dir() {
            return Err(ProxyError::Config(format!(
                "Storage location is not a directory: {}",
                self.storage_location.display()
            )));
        }

        if self.git.retry_attempts == 0 {
            return Err(ProxyError::Config(
                "git.retry_attempts must be at least 1".to_string(),
            ));
        }

        if self.git.remote_base.is_empty() {
            return Err(ProxyError::Config(
                "git.remote_base cannot be empty".to_string(),
            ));
        }

        if self.limits.max_connections == 0 {
            return Err(ProxyError::Config(
                "limits.max_connections must be > 0".to_string(),
            ));
        }

        if self.limits.max_request_size == 0 || self.limits.max_headers == 0 {
            return Err(ProxyError::Config(
                "limits.max_request_size and limits.max_headers must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_parse() {
        let config_toml = r#"
            listen_addr = "0.0.0.0:5001"
            storage_location = "/tmp"

            [git]
            retry_attempts = 5
            retry_delay_ms = 10
        "#;

        let config: Config = toml::from_str(config_toml).unwrap();
        assert_eq!(config.listen_addr.port(), 5001);
        assert_eq!(config.git.retry_attempts, 5);
        assert_eq!(config.git.remote_base, "https://github.com/");
        assert_eq!(config.limits.max_headers, 256);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.listen_addr, default_listen_addr());
        assert_eq!(config.git.retry_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"storage_location = \"/tmp\"\n").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.storage_location, PathBuf::from("/tmp"));
    }

    #[test]
    fn test_invalid_config_zero_retries() {
        let config: Config = toml::from_str("[git]\nretry_attempts = 0\n").unwrap();
        assert!(config.validate().is_err());
    }
}
