//! SDK configuration
//!
//! Platform addresses, HTTP transport settings and MQTT timing, loadable from a
//! TOML file. Every field has a default matching the hosted platform, so an
//! empty file (or [`SdkConfig::default`]) is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP address of the hosted platform
pub const DEFAULT_HTTP_ADDR: &str = "https://platform.clearblade.com";
/// Default messaging broker address
pub const DEFAULT_MQTT_ADDR: &str = "platform.clearblade.com:1883";
/// Default broker address for MQTT-based authentication
pub const DEFAULT_MQTT_AUTH_ADDR: &str = "platform.clearblade.com:8905";
/// Default port for mutual-TLS endpoints
pub const DEFAULT_MTLS_PORT: &str = "444";

/// Top-level SDK configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SdkConfig {
    #[serde(default)]
    pub platform: PlatformSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub mqtt: MqttSection,
}

/// Platform addresses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformSection {
    /// Base URL for HTTP calls, without trailing slash
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// Broker `host:port` for messaging
    #[serde(default = "default_mqtt_addr")]
    pub mqtt_addr: String,
    /// Broker `host:port` for MQTT-based authentication
    #[serde(default = "default_mqtt_auth_addr")]
    pub mqtt_auth_addr: String,
    /// Port used for mutual-TLS HTTP and MQTT endpoints
    #[serde(default = "default_mtls_port")]
    pub mtls_port: String,
}

impl Default for PlatformSection {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            mqtt_addr: default_mqtt_addr(),
            mqtt_auth_addr: default_mqtt_auth_addr(),
            mtls_port: default_mtls_port(),
        }
    }
}

/// HTTP transport settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpSection {
    /// Outer timeout for a single request (default: 300 = 5 minutes)
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    /// Skip TLS certificate verification on the default transport
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
            accept_invalid_certs: false,
        }
    }
}

impl HttpSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// MQTT timing settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Default wait for CONNACK when the caller gives no timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Wait for PUBACK/PUBCOMP on QoS 1/2 publishes
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
    /// Wait for the reply message of MQTT-based authentication
    #[serde(default = "default_auth_reply_timeout")]
    pub auth_reply_timeout_secs: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            ack_timeout_secs: default_ack_timeout(),
            auth_reply_timeout_secs: default_auth_reply_timeout(),
        }
    }
}

impl MqttSection {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn auth_reply_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_reply_timeout_secs)
    }
}

fn default_http_addr() -> String {
    DEFAULT_HTTP_ADDR.to_string()
}

fn default_mqtt_addr() -> String {
    DEFAULT_MQTT_ADDR.to_string()
}

fn default_mqtt_auth_addr() -> String {
    DEFAULT_MQTT_AUTH_ADDR.to_string()
}

fn default_mtls_port() -> String {
    DEFAULT_MTLS_PORT.to_string()
}

fn default_http_timeout() -> u64 {
    300 // 5 minutes
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_ack_timeout() -> u64 {
    10
}

fn default_auth_reply_timeout() -> u64 {
    60
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid address for {field}: {value}")]
    InvalidAddress { field: &'static str, value: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SdkConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SdkConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check addresses and timeouts for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let http = url::Url::parse(&self.platform.http_addr).map_err(|_| {
            ConfigError::InvalidAddress {
                field: "platform.http_addr",
                value: self.platform.http_addr.clone(),
            }
        })?;
        if http.host_str().is_none() {
            return Err(ConfigError::InvalidAddress {
                field: "platform.http_addr",
                value: self.platform.http_addr.clone(),
            });
        }

        validate_broker_addr("platform.mqtt_addr", &self.platform.mqtt_addr)?;
        validate_broker_addr("platform.mqtt_auth_addr", &self.platform.mqtt_auth_addr)?;

        if self.platform.mtls_port.parse::<u16>().is_err() {
            return Err(ConfigError::InvalidConfig(format!(
                "platform.mtls_port must be a port number, got '{}'",
                self.platform.mtls_port
            )));
        }

        let timeouts = [
            ("http.timeout_secs", self.http.timeout_secs),
            ("mqtt.connect_timeout_secs", self.mqtt.connect_timeout_secs),
            ("mqtt.ack_timeout_secs", self.mqtt.ack_timeout_secs),
            (
                "mqtt.auth_reply_timeout_secs",
                self.mqtt.auth_reply_timeout_secs,
            ),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{field} must be greater than zero"
                )));
            }
        }

        Ok(())
    }
}

/// Broker addresses are plain `host:port` pairs
fn validate_broker_addr(field: &'static str, addr: &str) -> Result<(), ConfigError> {
    let valid = match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    };

    if !valid {
        return Err(ConfigError::InvalidAddress {
            field,
            value: addr.to_string(),
        });
    }

    Ok(())
}
