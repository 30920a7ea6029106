//! The `bus` module owns the single long-lived connection to the shared
//! message bus.
//!
//! A [`Transport`] knows how to open one physical session (Redis pub/sub in
//! production, [`MemoryTransport`] in-process). [`BusConnection`] sits on top
//! of it and keeps the set of channels and patterns that must be active,
//! replaying that set every time a new session is opened.
//!
//! Messages published while no session is open are lost: delivery is
//! at-most-once across an outage.

pub mod connection;
pub mod memory;
pub mod redis_bus;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::utils::Result;

pub use connection::{BusConnection, BusState, SubscribeOutcome};
pub use memory::{BusCommand, MemoryTransport};
pub use redis_bus::RedisTransport;

/// One inbound message as delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
    /// Set when the message matched a pattern subscription rather than an
    /// explicit channel subscription.
    pub pattern: Option<String>,
}

impl BusMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            pattern: None,
        }
    }

    pub fn from_pattern(&self) -> bool {
        self.pattern.is_some()
    }
}

/// Inbound messages of one session. Ends when the session fails.
pub type BusStream = BoxStream<'static, BusMessage>;

/// Command half of an open session.
#[async_trait]
pub trait TransportSink: Send {
    async fn subscribe(&mut self, channel: &str) -> Result<()>;
    async fn psubscribe(&mut self, pattern: &str) -> Result<()>;
    async fn unsubscribe(&mut self, channel: &str) -> Result<()>;
}

/// A freshly opened session: commands go into `sink`, messages come out of
/// `stream`.
pub struct BusSession {
    pub sink: Box<dyn TransportSink>,
    pub stream: BusStream,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self) -> Result<BusSession>;
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
}
