use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{PriceSnapshot, PriceStore};
use crate::utils::Result;

/// Snapshot store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryPriceStore {
    prices: RwLock<HashMap<String, PriceSnapshot>>,
}

impl MemoryPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ticker: &str, price: f64) {
        let last_updated = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        self.prices.write().insert(
            ticker.to_string(),
            PriceSnapshot {
                price,
                last_updated: Some(last_updated),
            },
        );
    }

    pub fn remove(&self, ticker: &str) -> bool {
        self.prices.write().remove(ticker).is_some()
    }
}

#[async_trait]
impl PriceStore for MemoryPriceStore {
    async fn latest(&self, ticker: &str) -> Result<Option<PriceSnapshot>> {
        Ok(self.prices.read().get(ticker).copied())
    }
}
