use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{debug, warn};

use super::{PriceSnapshot, PriceStore};
use crate::utils::Result;

/// Reads the hash the publisher keeps per ticker at `key_prefix + TICKER`,
/// with fields `value` (decimal string) and `lastUpdated` (epoch seconds).
#[derive(Clone)]
pub struct RedisPriceStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisPriceStore {
    pub fn new(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
        })
    }

    pub fn key(&self, ticker: &str) -> String {
        format!("{}{}", self.key_prefix, ticker)
    }
}

#[async_trait]
impl PriceStore for RedisPriceStore {
    async fn latest(&self, ticker: &str) -> Result<Option<PriceSnapshot>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.key(ticker);

        let fields: HashMap<String, String> = conn.hgetall(&key).await?;
        let snapshot = snapshot_from_fields(&fields);
        if snapshot.is_none() && !fields.is_empty() {
            warn!(key, "Price hash has no usable value field");
        }

        debug!(key, found = snapshot.is_some(), "Snapshot lookup");
        Ok(snapshot)
    }
}

pub(crate) fn snapshot_from_fields(fields: &HashMap<String, String>) -> Option<PriceSnapshot> {
    let price = fields.get("value")?.trim().parse::<f64>().ok()?;
    let last_updated = fields
        .get("lastUpdated")
        .and_then(|v| v.trim().parse::<f64>().ok());

    Some(PriceSnapshot {
        price,
        last_updated,
    })
}
