//! Configuration for notification-client

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::NotifyError;
use crate::stomp::SessionConfig;

/// Configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Broker WebSocket endpoint (STOMP over WebSocket)
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Base URL of the notification REST API
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Destination prefix for per-identity topics
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Interval we offer to send heartbeats at (0 = never)
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_outgoing_ms: u64,

    /// Interval we want to receive heartbeats at (0 = never)
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_incoming_ms: u64,

    /// Missed incoming intervals tolerated before the connection is declared dead
    #[serde(default = "default_heartbeat_tolerance")]
    pub heartbeat_tolerance: u32,

    /// Fixed delay between reconnection attempts
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Maximum wait for the broker handshake
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Timeout for REST calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Capacity of the in-process signal bus
    #[serde(default = "default_signal_capacity")]
    pub signal_capacity: usize,
}

fn default_ws_url() -> String {
    "ws://localhost:8080/ws/notifications/websocket".to_string()
}

fn default_api_url() -> String {
    "http://localhost:8080/v1/notifications".to_string()
}

fn default_topic_prefix() -> String {
    crate::topic::DEFAULT_TOPIC_PREFIX.to_string()
}

fn default_heartbeat_ms() -> u64 {
    4000
}

fn default_heartbeat_tolerance() -> u32 {
    2
}

fn default_reconnect_delay() -> u64 {
    5000
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_signal_capacity() -> usize {
    256
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            api_url: default_api_url(),
            topic_prefix: default_topic_prefix(),
            heartbeat_outgoing_ms: 4000,
            heartbeat_incoming_ms: 4000,
            heartbeat_tolerance: 2,
            reconnect_delay_ms: 5000,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            signal_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, NotifyError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| NotifyError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), NotifyError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| NotifyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<(), NotifyError> {
        if self.ws_url.trim().is_empty() {
            return Err(NotifyError::Config("ws_url must not be empty".into()));
        }
        if self.api_url.trim().is_empty() {
            return Err(NotifyError::Config("api_url must not be empty".into()));
        }
        if self.heartbeat_tolerance == 0 {
            return Err(NotifyError::Config("heartbeat_tolerance must be positive".into()));
        }
        if self.reconnect_delay_ms == 0 {
            return Err(NotifyError::Config("reconnect_delay_ms must be positive".into()));
        }
        if self.signal_capacity == 0 {
            return Err(NotifyError::Config("signal_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn heartbeat_outgoing(&self) -> Duration {
        Duration::from_millis(self.heartbeat_outgoing_ms)
    }

    pub fn heartbeat_incoming(&self) -> Duration {
        Duration::from_millis(self.heartbeat_incoming_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl From<&ClientConfig> for SessionConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            endpoint: config.ws_url.clone(),
            heartbeat_outgoing: config.heartbeat_outgoing(),
            heartbeat_incoming: config.heartbeat_incoming(),
            heartbeat_tolerance: config.heartbeat_tolerance,
            reconnect_delay: config.reconnect_delay(),
            connect_timeout: config.connect_timeout(),
        }
    }
}
