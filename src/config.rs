//! Configuration system for the chatlink connection manager
//!
//! Configuration is loaded from TOML. Every section and field has a default,
//! so an empty file yields a usable loopback configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Top-level client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    #[serde(default)]
    pub watchdog: WatchdogSection,
    #[serde(default)]
    pub throttle: ThrottleSection,
}

/// Connection section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSection {
    /// Endpoint URL: `tcp://host:port`, `ws://host/path` or `wss://host/path`
    #[serde(default = "default_url")]
    pub url: String,
    /// Upgrade `ws://` endpoints to TLS
    #[serde(default)]
    pub secure: bool,
    /// Ceiling on a single connect attempt
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Pause after a close so the OS can settle the socket teardown
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            url: default_url(),
            secure: false,
            connect_timeout_secs: default_connect_timeout_secs(),
            close_grace_ms: default_close_grace_ms(),
        }
    }
}

impl ConnectionSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// Reconnection schedule settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSettings {
    /// Maximum number of connect attempts per cycle (None = unlimited)
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Custom backoff pattern in milliseconds
    #[serde(default = "default_backoff_pattern")]
    pub backoff_pattern_ms: Vec<u64>,
    /// Delay to use once the pattern is exhausted
    #[serde(default = "default_sustained_delay_ms")]
    pub sustained_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern_ms: default_backoff_pattern(),
            sustained_delay_ms: default_sustained_delay_ms(),
        }
    }
}

/// Watchdog section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchdogSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    /// Line sent through the client as a keepalive
    #[serde(default = "default_keepalive_line")]
    pub keepalive_line: String,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            keepalive_line: default_keepalive_line(),
        }
    }
}

impl WatchdogSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

/// Outbound throttling section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThrottleSection {
    /// Dispatcher tick
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "TrafficClassSettings::standard")]
    pub standard: TrafficClassSettings,
    #[serde(default = "TrafficClassSettings::privileged")]
    pub privileged: TrafficClassSettings,
}

impl Default for ThrottleSection {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            standard: TrafficClassSettings::standard(),
            privileged: TrafficClassSettings::privileged(),
        }
    }
}

impl ThrottleSection {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// What to do when a traffic class queue is full
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the incoming item
    #[default]
    RejectNewest,
    /// Drop the oldest pending item to make room
    EvictOldest,
}

/// Limits for one traffic class
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrafficClassSettings {
    pub allowed_in_period: usize,
    pub period_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl TrafficClassSettings {
    /// Ordinary chat traffic: 20 lines per 30 seconds
    pub fn standard() -> Self {
        Self {
            allowed_in_period: 20,
            period_secs: 30,
            queue_capacity: default_queue_capacity(),
            overflow: OverflowPolicy::RejectNewest,
        }
    }

    /// Privileged (operator/moderator) traffic: 100 lines per 30 seconds
    pub fn privileged() -> Self {
        Self {
            allowed_in_period: 100,
            ..Self::standard()
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

fn default_url() -> String {
    "tcp://127.0.0.1:6667".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_close_grace_ms() -> u64 {
    1500
}

fn default_backoff_pattern() -> Vec<u64> {
    vec![25, 50, 100, 250]
}

fn default_sustained_delay_ms() -> u64 {
    250
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_keepalive_interval_secs() -> u64 {
    60
}

fn default_keepalive_line() -> String {
    "PING :keepalive".to_string()
}

fn default_tick_ms() -> u64 {
    50
}

fn default_queue_capacity() -> usize {
    10_000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Endpoint kind derived from the configured URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Raw line-oriented TCP: `host:port`
    Tcp { addr: String },
    /// WebSocket URL, already upgraded to `wss` when `secure` is set
    WebSocket { url: String },
}

impl ClientConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field ranges and endpoint consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;

        if self.connection.connect_timeout_secs == 0 {
            return Err(invalid("connection.connect_timeout_secs must be > 0"));
        }
        if self.reconnect.max_attempts == Some(0) {
            return Err(invalid(
                "reconnect.max_attempts must be greater than 0 or omitted for unlimited",
            ));
        }
        if self.reconnect.backoff_pattern_ms.is_empty() && self.reconnect.sustained_delay_ms == 0 {
            return Err(invalid(
                "reconnect needs either backoff_pattern_ms or sustained_delay_ms > 0",
            ));
        }
        if self.watchdog.poll_interval_ms == 0 {
            return Err(invalid("watchdog.poll_interval_ms must be > 0"));
        }
        if self.watchdog.keepalive_interval_secs == 0 {
            return Err(invalid("watchdog.keepalive_interval_secs must be > 0"));
        }
        if self.throttle.tick_ms == 0 {
            return Err(invalid("throttle.tick_ms must be > 0"));
        }
        validate_class("throttle.standard", &self.throttle.standard)?;
        validate_class("throttle.privileged", &self.throttle.privileged)?;

        Ok(())
    }

    /// Resolve the configured URL into a concrete endpoint
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        let raw = self.connection.url.trim();
        if raw.is_empty() {
            return Err(invalid("connection.url must not be empty"));
        }
        let url = Url::parse(raw).map_err(|e| invalid(&format!("connection.url '{raw}': {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| invalid(&format!("connection.url '{raw}' has no host")))?;

        match url.scheme() {
            "tcp" => {
                if self.connection.secure {
                    return Err(invalid(
                        "connection.secure is only supported for ws:// and wss:// endpoints",
                    ));
                }
                let port = url
                    .port()
                    .ok_or_else(|| invalid(&format!("connection.url '{raw}' needs a port")))?;
                Ok(Endpoint::Tcp {
                    addr: format!("{host}:{port}"),
                })
            }
            "ws" if self.connection.secure => {
                let mut upgraded = url.clone();
                upgraded
                    .set_scheme("wss")
                    .map_err(|_| invalid(&format!("cannot upgrade '{raw}' to wss")))?;
                Ok(Endpoint::WebSocket {
                    url: upgraded.to_string(),
                })
            }
            "ws" | "wss" => Ok(Endpoint::WebSocket {
                url: url.to_string(),
            }),
            other => Err(invalid(&format!(
                "connection.url scheme '{other}' is not one of tcp, ws, wss"
            ))),
        }
    }
}

fn validate_class(name: &str, settings: &TrafficClassSettings) -> Result<(), ConfigError> {
    if settings.allowed_in_period == 0 {
        return Err(invalid(&format!("{name}.allowed_in_period must be > 0")));
    }
    if settings.period_secs == 0 {
        return Err(invalid(&format!("{name}.period_secs must be > 0")));
    }
    Ok(())
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::InvalidConfig(message.to_string())
}
