//! # PriceCast
//!
//! `pricecast` is a real-time stock price fanout server built with Rust.
//! It listens to price updates on a shared Redis pub/sub bus and pushes them
//! over WebSockets to every browser that asked for the ticker, subscribing
//! upstream only to the tickers somebody currently watches.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `bus`: The reconnecting connection to the message bus (Redis or in-memory).
//! - `broker`: The subscription registry, the upstream listener and the `PriceFeed` service.
//! - `client`: Connected clients and the registry that delivers messages to them.
//! - `store`: Lookup of the last known price, pushed to new subscribers.
//! - `transport`: The client protocol, per-connection sessions and the WebSocket server.
//! - `config`: Handles loading and managing server configuration.
//! - `utils`: Error types and logging setup.

pub mod broker;
pub mod bus;
pub mod client;
pub mod config;
pub mod store;
pub mod transport;
pub mod utils;

pub use broker::PriceFeed;
pub use config::{Settings, load_config};
pub use utils::{PriceCastError, Result};

#[cfg(test)]
mod tests;
