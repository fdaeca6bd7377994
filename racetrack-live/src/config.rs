//! Session configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry (default: 500ms)
    pub initial_ms: u64,
    /// Upper bound on the delay (default: 10s)
    pub max_ms: u64,
    /// Growth factor per failed attempt (default: 2.0)
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

/// Configuration for one race session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Websocket base URL; the room id is appended as a path segment
    pub server_url: String,
    /// Room (race) to join
    pub room_id: String,
    /// Reconnect proactively after this long without any inbound frame
    /// (default: 30s, `None` disables)
    pub liveness_timeout_ms: Option<u64>,
    /// Give up on a single connect attempt after this long (default: 10s)
    pub connect_timeout_ms: u64,
    /// Bound on the best-effort `leaveRoom` send and close (default: 500ms)
    pub leave_timeout_ms: u64,
    /// Events buffered while waiting for the room snapshot (default: 1024)
    pub snapshot_buffer_capacity: usize,
    /// Capacity of the session event channel (default: 256)
    pub event_channel_capacity: usize,
    pub reconnect: BackoffConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            room_id: "default".to_string(),
            liveness_timeout_ms: Some(30_000),
            connect_timeout_ms: 10_000,
            leave_timeout_ms: 500,
            snapshot_buffer_capacity: 1024,
            event_channel_capacity: 256,
            reconnect: BackoffConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            room_id: room_id.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (short timers).
    pub fn for_testing(server_url: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            room_id: room_id.into(),
            liveness_timeout_ms: Some(2_000),
            connect_timeout_ms: 1_000,
            leave_timeout_ms: 100,
            snapshot_buffer_capacity: 64,
            event_channel_capacity: 64,
            reconnect: BackoffConfig {
                initial_ms: 10,
                max_ms: 50,
                multiplier: 2.0,
            },
        }
    }

    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room_id.trim().is_empty() {
            return Err(ConfigError::Invalid("room_id must not be empty".into()));
        }
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "server_url must be a ws:// or wss:// URL, got '{}'",
                self.server_url
            )));
        }
        if self.snapshot_buffer_capacity == 0 || self.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel capacities must be at least 1".into()));
        }
        if self.liveness_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("liveness_timeout_ms must be positive".into()));
        }
        if self.reconnect.multiplier < 1.0 || self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(ConfigError::Invalid("reconnect backoff must not shrink".into()));
        }
        Ok(())
    }

    pub fn with_liveness_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.liveness_timeout_ms = timeout.map(|d| d.as_millis() as u64);
        self
    }

    pub fn with_reconnect(mut self, reconnect: BackoffConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_snapshot_buffer_capacity(mut self, capacity: usize) -> Self {
        self.snapshot_buffer_capacity = capacity.max(1);
        self
    }

    pub fn liveness_timeout(&self) -> Option<Duration> {
        self.liveness_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }
}

/// Exponential backoff state for reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt; grows until `max_ms`.
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.config.multiplier.powi(self.attempt.min(32) as i32);
        let millis = (self.config.initial_ms as f64 * factor).min(self.config.max_ms as f64);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(millis as u64)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
