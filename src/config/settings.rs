use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Every section falls back to its defaults, so a partial file or a single
/// environment override is enough to start the server.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub bus: BusSettings,
    pub clients: ClientSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

/// Configuration settings for the server.
///
/// Defines the host and port the WebSocket server will bind to.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Connection to the shared message bus.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BusSettings {
    pub url: String,
    /// Channel for ticker `T` is `channel_prefix + T`.
    pub channel_prefix: String,
    /// Also pattern-subscribe `channel_prefix + "*"`.
    pub wildcard: bool,
    /// Pause before the listener reconnects after its stream ended.
    pub restart_delay_ms: u64,
    /// Longest a single subscribe/unsubscribe may take before the session
    /// is treated as dead.
    pub command_timeout_ms: u64,
    pub reconnect: ReconnectSettings,
}

/// Reconnection strategy for the bus connection.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Maximum attempts per outage (0 = unbounded)
    pub max_attempts: u32,
}

/// Per-connection limits.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClientSettings {
    pub outbound_capacity: usize,
    pub heartbeat_interval_secs: u64,
}

/// Where the last known prices live.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreSettings {
    pub key_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            channel_prefix: "stock:price:".to_string(),
            wildcard: true,
            restart_delay_ms: 1000,
            command_timeout_ms: 5000,
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            max_attempts: 0,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            heartbeat_interval_secs: 10,
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            key_prefix: "stock:price:".to_string(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ServerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl BusSettings {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.max(1))
    }

    pub fn wildcard_pattern(&self) -> String {
        format!("{}*", self.channel_prefix)
    }
}

impl ReconnectSettings {
    /// Delay before retry number `attempt` (1-based), capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_millis(millis.min(self.max_delay_ms as f64) as u64)
    }

    pub fn gives_up_after(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

impl ClientSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}
