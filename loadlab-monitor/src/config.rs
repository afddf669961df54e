use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{MonitorError, Result};

/// Main configuration for the live monitor
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MonitorConfig {
    /// Backend endpoints
    pub backend: BackendConfig,
    /// Push channel recovery policy
    pub channel: ChannelConfig,
    /// Reconciliation fallback
    pub polling: PollingConfig,
    /// Live feed retention
    pub feed: FeedConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Metrics exporter
    pub metrics: MetricsConfig,
    /// Settings for the bundled mock backend
    pub mock: MockBackendConfig,
}

/// Backend endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the REST API, e.g. `http://localhost:8000`
    pub base_url: String,
    /// Path of the push endpoint relative to the base URL
    pub ws_path: String,
    /// Per-request timeout for snapshot and trace fetches
    pub request_timeout_seconds: u64,
    /// How many recent requests a snapshot asks for
    pub recent_requests_limit: usize,
}

/// Push channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Flat delay between automatic reopen attempts
    pub reconnect_interval_ms: u64,
    /// Automatic reopen budget before manual recovery is required
    pub max_reconnect_attempts: u32,
}

/// Polling fallback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Run the reconciler at all
    pub enabled: bool,
    /// Tick period
    pub interval_ms: u64,
}

/// Ring buffer capacities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub metrics_capacity: usize,
    pub request_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

/// Prometheus exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: SocketAddr,
}

/// Mock backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockBackendConfig {
    pub listen_addr: SocketAddr,
    /// Period between pushed frames
    pub frame_interval_ms: u64,
    /// Probability that a simulated request fails
    pub failure_rate: f64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            ws_path: "/ws".to_string(),
            request_timeout_seconds: 10,
            recent_requests_limit: 50,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 3000,
            max_reconnect_attempts: 5,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            metrics_capacity: 100,
            request_capacity: 50,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "loadlab_monitor=info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9464)),
        }
    }
}

impl Default for MockBackendConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            frame_interval_ms: 1000,
            failure_rate: 0.1,
        }
    }
}

impl BackendConfig {
    /// Base URL without a trailing slash
    pub fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// Push endpoint derived from the REST base URL (`http` -> `ws`, `https` -> `wss`)
    pub fn ws_url(&self) -> String {
        let base = self.base();
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}{}", ws_base, self.ws_path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl ChannelConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl MockBackendConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

impl MonitorConfig {
    /// Load configuration from file, with `LOADLAB__SECTION__KEY` overrides
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("LOADLAB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: MonitorConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| MonitorError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, toml_string)
            .map_err(|e| MonitorError::Config(format!("Failed to write {}: {}", path, e)))?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let base = self.backend.base();
        if base.is_empty() {
            return Err(MonitorError::Config("Backend base URL cannot be empty".to_string()));
        }
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(MonitorError::Config(format!(
                "Backend base URL must be http(s): {}",
                base
            )));
        }
        if !self.backend.ws_path.starts_with('/') {
            return Err(MonitorError::Config("WebSocket path must start with '/'".to_string()));
        }

        if self.channel.reconnect_interval_ms == 0 {
            return Err(MonitorError::Config("Reconnect interval cannot be 0".to_string()));
        }

        if self.polling.enabled && self.polling.interval_ms == 0 {
            return Err(MonitorError::Config("Polling interval cannot be 0".to_string()));
        }

        if self.feed.metrics_capacity == 0 || self.feed.request_capacity == 0 {
            return Err(MonitorError::Config("Feed capacities must be positive".to_string()));
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(MonitorError::Config(format!("Unknown log format: {}", other)));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_recovery_policy() {
        let config = MonitorConfig::default();
        assert_eq!(config.channel.reconnect_interval(), Duration::from_millis(3000));
        assert_eq!(config.channel.max_reconnect_attempts, 5);
        assert_eq!(config.polling.interval(), Duration::from_secs(30));
        assert_eq!(config.feed.metrics_capacity, 100);
        assert_eq!(config.feed.request_capacity, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ws_url_derivation() {
        let mut backend = BackendConfig::default();
        assert_eq!(backend.ws_url(), "ws://localhost:8000/ws");

        backend.base_url = "https://panel.example.com/".to_string();
        assert_eq!(backend.ws_url(), "wss://panel.example.com/ws");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = MonitorConfig::default();
        config.backend.base_url = "ftp://backend".to_string();
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.channel.reconnect_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.feed.request_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_polling_interval_ignored_when_disabled() {
        let mut config = MonitorConfig::default();
        config.polling.enabled = false;
        config.polling.interval_ms = 0;
        assert!(config.validate().is_ok());
    }
}
