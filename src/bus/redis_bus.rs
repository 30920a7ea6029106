//! Redis pub/sub transport.
//!
//! Each session is a dedicated pub/sub connection split into its command
//! sink and its message stream. Publishing uses a separate multiplexed
//! connection, since a connection in subscriber mode cannot publish.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::PubSubSink;
use tracing::warn;

use super::{BusMessage, BusSession, Transport, TransportSink};
use crate::utils::Result;

#[derive(Clone)]
pub struct RedisTransport {
    client: redis::Client,
}

impl RedisTransport {
    /// Create a transport for `redis_url` (e.g. "redis://127.0.0.1:6379/0").
    /// No connection is made until the first `open`.
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }
}

struct RedisSink {
    sink: PubSubSink,
}

#[async_trait]
impl TransportSink for RedisSink {
    async fn subscribe(&mut self, channel: &str) -> Result<()> {
        self.sink.subscribe(channel).await?;
        Ok(())
    }

    async fn psubscribe(&mut self, pattern: &str) -> Result<()> {
        self.sink.psubscribe(pattern).await?;
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<()> {
        self.sink.unsubscribe(channel).await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn open(&self) -> Result<BusSession> {
        let pubsub = self.client.get_async_pubsub().await?;
        let (sink, stream) = pubsub.split();

        let stream = stream
            .filter_map(|msg| futures::future::ready(to_bus_message(&msg)))
            .boxed();

        Ok(BusSession {
            sink: Box::new(RedisSink { sink }),
            stream,
        })
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }
}

fn to_bus_message(msg: &redis::Msg) -> Option<BusMessage> {
    let channel = msg.get_channel_name().to_string();

    let payload: String = match msg.get_payload() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(channel, "Dropping non-text bus payload: {e}");
            return None;
        }
    };

    let pattern = if msg.from_pattern() {
        msg.get_pattern::<String>().ok()
    } else {
        None
    };

    Some(BusMessage {
        channel,
        payload,
        pattern,
    })
}
