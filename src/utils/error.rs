//! The `error` module defines the error types used within `pricecast`.
//!
//! Transport failures on either side of the fanout are recovered locally
//! (reconnect for the bus, teardown for clients), so most of these variants
//! end up in a log line rather than in front of a user. The ones a client can
//! see are the upstream subscribe failures reported as `error` frames.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PriceCastError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// The bus connection refused or failed a command while connected.
    #[error("message bus unavailable: {0}")]
    BusUnavailable(String),

    /// Reconnection gave up after the configured number of attempts.
    #[error("gave up reconnecting to the message bus after {0} attempts")]
    ReconnectExhausted(u32),

    /// A bus payload could not be turned into a price event.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("already running")]
    AlreadyRunning,
}

impl PriceCastError {
    /// Returns true for failures caused by the bus transport itself.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            PriceCastError::Redis(_)
                | PriceCastError::BusUnavailable(_)
                | PriceCastError::ReconnectExhausted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PriceCastError>;
