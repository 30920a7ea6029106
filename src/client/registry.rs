//! Client registry and dispatcher
//!
//! Every enqueue goes through `try_send` on the client's bounded queue, so a
//! slow client never holds up the dispatch path. When a queue is full the
//! new message is dropped for that client only (drop-newest) and counted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, Receiver, error::SendTimeoutError, error::TrySendError};
use tracing::{debug, info, warn};

use super::pubsub_client::{Client, ClientId};
use crate::broker::SubscriptionRegistry;
use crate::store::PriceStore;
use crate::transport::message::ServerMessage;

/// Result of enqueueing one message for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The client's queue was full.
    Dropped,
    /// The client is not registered or its connection is gone.
    Gone,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct ClientRegistry {
    subscriptions: Arc<SubscriptionRegistry>,
    store: Arc<dyn PriceStore>,
    capacity: usize,
    clients: RwLock<HashMap<ClientId, Client>>,
    dropped: AtomicU64,
}

impl ClientRegistry {
    pub fn new(
        subscriptions: Arc<SubscriptionRegistry>,
        store: Arc<dyn PriceStore>,
        capacity: usize,
    ) -> Self {
        Self {
            subscriptions,
            store,
            capacity: capacity.max(1),
            clients: RwLock::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Creates a client with a fresh ID and an outbound queue of the
    /// configured capacity. The client is not registered yet.
    pub fn open_channel(&self) -> (Client, Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        (Client::new(tx), rx)
    }

    /// From this point the client is a dispatch target.
    pub fn register(&self, client: Client) -> ClientId {
        let id = client.id.clone();
        self.clients.write().insert(id.clone(), client);
        info!(client_id = %id, "Client registered");
        id
    }

    /// Returns false if the client was not registered.
    pub fn unregister(&self, client_id: &str) -> bool {
        let removed = self.clients.write().remove(client_id).is_some();
        if removed {
            info!(client_id, "Client unregistered");
        }
        removed
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.clients.read().contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Messages dropped across all clients because their queue was full.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Enqueues `message` for one client without waiting.
    pub fn send_to(&self, client_id: &str, message: ServerMessage) -> Delivery {
        let clients = self.clients.read();
        let Some(client) = clients.get(client_id) else {
            return Delivery::Gone;
        };

        match client.sender.try_send(message) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(client_id, "Outbound queue full, message dropped");
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    /// Like `send_to`, but waits up to `timeout` for room in the queue.
    /// Used for keepalives, where a queue that stays full counts as dead.
    pub async fn send_with_timeout(
        &self,
        client_id: &str,
        message: ServerMessage,
        timeout: Duration,
    ) -> Delivery {
        let sender = self.clients.read().get(client_id).map(|c| c.sender.clone());
        let Some(sender) = sender else {
            return Delivery::Gone;
        };

        match sender.send_timeout(message, timeout).await {
            Ok(()) => Delivery::Queued,
            Err(SendTimeoutError::Timeout(_)) => Delivery::Dropped,
            Err(SendTimeoutError::Closed(_)) => Delivery::Gone,
        }
    }

    /// Enqueues `message` for every registered client interested in `ticker`.
    pub fn dispatch(&self, ticker: &str, message: &ServerMessage) -> DispatchReport {
        let mut report = DispatchReport::default();

        for client_id in self.subscriptions.interested_clients(ticker) {
            match self.send_to(&client_id, message.clone()) {
                Delivery::Queued => report.delivered += 1,
                Delivery::Dropped => report.dropped += 1,
                Delivery::Gone => debug!(client_id, ticker, "Skipping departed client"),
            }
        }
        report
    }

    /// Best-effort push of the last known price for `ticker` to one client.
    /// Returns whether a snapshot was queued.
    pub async fn send_snapshot(&self, client_id: &str, ticker: &str) -> bool {
        let snapshot = match self.store.latest(ticker).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(client_id, ticker, "No snapshot available");
                return false;
            }
            Err(e) => {
                warn!(client_id, ticker, "Snapshot lookup failed: {e}");
                return false;
            }
        };

        let delivery = self.send_to(client_id, ServerMessage::price(ticker, snapshot.price));
        if delivery != Delivery::Queued {
            warn!(client_id, ticker, ?delivery, "Snapshot not delivered");
        }
        delivery == Delivery::Queued
    }
}
