//! The `transport` module is responsible for handling network communication
//! with clients, primarily via WebSockets.
//!
//! It defines the JSON protocol spoken with browsers, the per-connection
//! [`Session`] lifecycle, and the WebSocket accept loop that runs one session
//! per connection.

pub mod message;
pub mod session;
pub mod websocket;

pub use message::{ClientMessage, ControlMessage, PriceUpdate, Request, ServerMessage};
pub use session::{Session, SessionState};
pub use websocket::{serve, start_websocket_server};

#[cfg(test)]
mod tests;
