//! Configuration module
//!
//! Reads a sectioned TOML file (default `~/.config/ocpp-gateway/config.toml`,
//! overridable via `OCPP_GATEWAY_CONFIG`). Every field has a default so a
//! missing file or a partial one still yields a runnable gateway.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub mqtt: MqttConfig,
    pub poll: PollConfig,
    pub calls: CallsConfig,
    pub liveness: LivenessSection,
    pub heartbeat: HeartbeatConfig,
    pub security: SecurityConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
    /// Devices provisioned at startup.
    pub devices: Vec<DeviceSeed>,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

/// Default config file location: `~/.config/ocpp-gateway/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ocpp-gateway")
        .join("config.toml")
}

/// WebSocket transport listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub ws_host: String,
    pub ws_port: u16,
}

impl ServerConfig {
    pub fn ws_address(&self) -> String {
        format!("{}:{}", self.ws_host, self.ws_port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_host: "0.0.0.0".to_string(),
            ws_port: 9000,
        }
    }
}

/// Broker connection for the MQTT transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// How recently a device must have published to count as reachable.
    pub liveness_window_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "ocpp-gateway".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            liveness_window_secs: 180,
        }
    }
}

/// HTTP long-poll transport listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// How recently a device must have polled to count as reachable.
    pub window_secs: u64,
}

impl PollConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 9002,
            window_secs: 180,
        }
    }
}

/// Gateway-initiated call behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallsConfig {
    pub timeout_secs: u64,
}

impl CallsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self { timeout_secs: 5 }
    }
}

/// Liveness marker behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LivenessSection {
    pub ttl_secs: u64,
}

impl LivenessSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for LivenessSection {
    fn default() -> Self {
        Self { ttl_secs: 180 }
    }
}

/// Heartbeat cadence handed to devices in BootNotification.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

/// Secret-at-rest encryption.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Master key for encrypting device shared secrets. Change this in
    /// any real deployment.
    pub master_key: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            master_key: "insecure-dev-master-key-change-me".to_string(),
        }
    }
}

/// Prometheus exporter listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl MetricsConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 9100,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// One device provisioned at startup from `[[devices]]`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSeed {
    pub serial_number: String,
    pub type_code: String,
    /// Plaintext shared secret; encrypted under the master key before it
    /// is stored.
    pub shared_secret: String,
    /// Explicit charge point mapping; defaults to the serial number.
    #[serde(default)]
    pub charge_point_id: Option<String>,
}
