//! The `broker` module sits between the bus connection and the clients.
//!
//! [`SubscriptionRegistry`] decides which tickers the bus must carry,
//! [`UpstreamListener`] pumps bus messages into handlers, and [`PriceFeed`]
//! ties them to the client registry as one service with a start/stop
//! lifecycle.

pub mod engine;
pub mod listener;
pub mod message;
pub mod registry;
pub mod topic;

pub use engine::{FeedStats, FeedStatsSnapshot, PriceFeed};
pub use listener::{MessageHandler, UpstreamListener};
pub use message::PriceEvent;
pub use registry::SubscriptionRegistry;
pub use topic::TopicNames;
