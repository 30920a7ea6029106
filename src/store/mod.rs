//! The `store` module looks up the last known price of a ticker.
//!
//! The fanout only reads from the store, to push a snapshot to a client that
//! has just subscribed. Writing prices is the publisher's job.

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;

use crate::utils::Result;

pub use memory::MemoryPriceStore;
pub use redis_store::RedisPriceStore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceSnapshot {
    pub price: f64,
    /// Epoch seconds of the last write, when the publisher recorded one.
    pub last_updated: Option<f64>,
}

#[async_trait]
pub trait PriceStore: Send + Sync {
    /// `Ok(None)` when nothing is known about `ticker`.
    async fn latest(&self, ticker: &str) -> Result<Option<PriceSnapshot>>;
}
