//! Server configuration module
//!
//! Handles loading and parsing of server configuration from files and environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// TCP port to listen on (0 picks a free port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory static files are served from (none disables file serving)
    #[serde(default)]
    pub static_file_path: Option<PathBuf>,

    /// Idle time before an HTTP connection is dropped or a WebSocket is pinged
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Upper bound on one I/O thread wait
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Largest accepted request (headers plus body) in bytes
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,

    /// Interval the binary drives `update()` at
    #[serde(default = "default_update_rate")]
    pub update_rate_ms: u64,
}

fn default_port() -> u16 {
    8080
}

fn default_idle_timeout() -> u64 {
    5000
}

fn default_poll_interval() -> u64 {
    100
}

fn default_max_request_size() -> usize {
    1024 * 1024
}

fn default_update_rate() -> u64 {
    50
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/server.toml"),
            port: default_port(),
            static_file_path: None,
            idle_timeout_ms: default_idle_timeout(),
            poll_interval_ms: default_poll_interval(),
            max_request_size: default_max_request_size(),
            update_rate_ms: default_update_rate(),
        }
    }
}

impl ServerConfig {
    /// Default configuration listening on `port`
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        // Determine config path from environment or use default
        let config_path = env::var("GAMEWIRE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/server.toml"));

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

            Self::from_toml(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;

        // Override with environment variables
        config.apply_env_overrides();

        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML document; missing fields take their defaults
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.config_path = PathBuf::from("config/server.toml");
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("GAMEWIRE_PORT") {
            if let Ok(port) = val.parse() {
                self.port = port;
            }
        }
        if let Ok(val) = env::var("GAMEWIRE_STATIC_PATH") {
            self.static_file_path = (!val.is_empty()).then(|| PathBuf::from(val));
        }
        if let Ok(val) = env::var("GAMEWIRE_IDLE_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.idle_timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var("GAMEWIRE_POLL_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                self.poll_interval_ms = ms;
            }
        }
        if let Ok(val) = env::var("GAMEWIRE_MAX_REQUEST_SIZE") {
            if let Ok(size) = val.parse() {
                self.max_request_size = size;
            }
        }
        if let Ok(val) = env::var("GAMEWIRE_UPDATE_RATE_MS") {
            if let Ok(ms) = val.parse() {
                self.update_rate_ms = ms;
            }
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            anyhow::bail!("Poll interval must be greater than zero");
        }

        if self.idle_timeout_ms < self.poll_interval_ms {
            anyhow::bail!("Idle timeout must be at least the poll interval");
        }

        if self.max_request_size < 1024 {
            anyhow::bail!("Max request size must be at least 1 KiB");
        }

        if self.update_rate_ms == 0 || self.update_rate_ms > 1000 {
            anyhow::bail!("Update rate must be between 1ms and 1000ms");
        }

        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn update_rate(&self) -> Duration {
        Duration::from_millis(self.update_rate_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.static_file_path, None);
        assert_eq!(config.idle_timeout(), Duration::from_secs(5));
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.max_request_size, 1024 * 1024);
        assert_eq!(config.update_rate_ms, 50);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = ServerConfig::from_toml(
            r#"
            port = 9000
            static_file_path = "www"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.static_file_path, Some(PathBuf::from("www")));
        assert_eq!(config.idle_timeout_ms, 5000);
    }

    #[test]
    fn test_from_toml_invalid() {
        assert!(ServerConfig::from_toml("port = \"not a number\"").is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = ServerConfig::default();

        // Valid config should pass
        assert!(config.validate().is_ok());

        config.poll_interval_ms = 0;
        assert!(config.validate().is_err());
        config.poll_interval_ms = 100;

        config.idle_timeout_ms = 50;
        assert!(config.validate().is_err());
        config.idle_timeout_ms = 5000;

        config.max_request_size = 10;
        assert!(config.validate().is_err());
        config.max_request_size = 4096;

        config.update_rate_ms = 5000;
        assert!(config.validate().is_err());
    }
}
