use tokio::sync::mpsc::Sender;

use crate::transport::message::ServerMessage;

/// Connection IDs are opaque strings, unique for the life of the process.
pub type ClientId = String;

/// Represents a connected WebSocket client as seen by the dispatcher.
///
/// The registry only holds the sending half of the client's bounded outbound
/// queue. The connection task owns the receiving half, so dropping the
/// connection closes the queue no matter what the registry still holds.
#[derive(Debug, Clone)]
pub struct Client {
    /// Unique identifier, `client-<uuid>`.
    pub id: ClientId,

    /// Bounded queue of messages waiting to be written to the socket.
    pub sender: Sender<ServerMessage>,
}

impl Client {
    pub fn new(sender: Sender<ServerMessage>) -> Self {
        Self {
            id: format!("client-{}", uuid::Uuid::new_v4()),
            sender,
        }
    }
}
