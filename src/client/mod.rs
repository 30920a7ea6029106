//! The `client` module defines the representation of a client in the fanout
//! and the registry that delivers messages to it.
//!
//! A [`Client`] is the ID plus the sending half of the connection's bounded
//! outbound queue. [`ClientRegistry`] owns all live clients and is the only
//! path by which price updates, snapshots and control messages reach them.

pub mod pubsub_client;
pub mod registry;

pub use pubsub_client::{Client, ClientId};
pub use registry::{ClientRegistry, Delivery, DispatchReport};
