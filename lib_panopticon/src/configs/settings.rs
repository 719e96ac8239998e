//! # Runtime Settings
//!
//! Plain serde structs with defaults. Every field may be omitted from a JSON
//! document; durations are whole milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::retry::RetryPolicy;
use crate::error::PanopticonError;
use crate::protocol::codec::StateSizes;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PanopticonSettings {
    pub lighthouse: LighthouseSettings,
    pub redis_main: RedisSettings,
    pub redis_health: RedisSettings,
    pub batch_interval_ms: u64,
    /// Lines kept in the `logs` channel window.
    pub log_window: usize,
}

impl Default for PanopticonSettings {
    fn default() -> Self {
        Self {
            lighthouse: LighthouseSettings::default(),
            redis_main: RedisSettings::default(),
            redis_health: RedisSettings::default(),
            batch_interval_ms: 1000,
            log_window: 200,
        }
    }
}

impl PanopticonSettings {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms.max(1))
    }
}

/// Connection settings of the Lighthouse WebSocket link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LighthouseSettings {
    pub uri: String,
    pub max_can_frames: usize,
    pub read_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub state_sizes: StateSizes,
}

impl Default for LighthouseSettings {
    fn default() -> Self {
        Self {
            uri: "ws://localhost:8089".to_string(),
            max_can_frames: 1000,
            read_timeout_ms: 500,
            connect_timeout_ms: 2000,
            reconnect_interval_ms: 1000,
            reconnect_max_delay_ms: 1000,
            state_sizes: StateSizes::default(),
        }
    }
}

impl LighthouseSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.reconnect_interval_ms.max(1)),
            Duration::from_millis(self.reconnect_max_delay_ms),
        )
    }
}

/// Connection settings of one Redis instance.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl: bool,
    /// Poll period and minimum spacing of reconnect attempts.
    pub reconnect_interval_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// `None` retries forever.
    pub max_connect_attempts: Option<u32>,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8084,
            db: 1,
            username: None,
            password: None,
            ssl: false,
            reconnect_interval_ms: 1000,
            reconnect_max_delay_ms: 1000,
            connect_timeout_ms: 2000,
            max_connect_attempts: None,
        }
    }
}

// Keeps the password out of logs.
impl std::fmt::Debug for RedisSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSettings")
            .field("uri", &self.display_uri())
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("reconnect_interval_ms", &self.reconnect_interval_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("max_connect_attempts", &self.max_connect_attempts)
            .finish()
    }
}

impl RedisSettings {
    fn scheme(&self) -> &'static str {
        if self.ssl {
            "rediss"
        } else {
            "redis"
        }
    }

    /// Connection URL including credentials.
    pub fn connection_url(&self) -> Result<Url, PanopticonError> {
        let mut url = Url::parse(&format!("{}://{}:{}/{}", self.scheme(), self.host, self.port, self.db))
            .map_err(|e| PanopticonError::InvalidConfig(format!("redis host '{}': {}", self.host, e)))?;
        if let Some(user) = self.username.as_deref().filter(|u| !u.is_empty()) {
            url.set_username(user)
                .map_err(|_| PanopticonError::InvalidConfig("redis username".to_string()))?;
        }
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            url.set_password(Some(password))
                .map_err(|_| PanopticonError::InvalidConfig("redis password".to_string()))?;
        }
        Ok(url)
    }

    /// URI reported in status values. Never contains the password.
    pub fn display_uri(&self) -> String {
        format!("{}://{}:{}/{}", self.scheme(), self.host, self.port, self.db)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.poll_interval(), Duration::from_millis(self.reconnect_max_delay_ms))
    }
}
