//! Subscription registry
//!
//! Tracks which clients want which tickers and keeps the bus connection
//! subscribed to exactly the tickers that have at least one interested
//! client.
//!
//! Concurrency notes:
//! - `add_interest`, `remove_interest` and `remove_client` are serialised by
//!   one async gate that stays held across the upstream call, so the
//!   zero-to-one and one-to-zero transitions each produce exactly one bus
//!   command even when connects and disconnects race on the same ticker.
//! - The two maps live behind a short synchronous lock. `interested_clients`
//!   only takes that lock and never waits on bus I/O.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::topic::TopicNames;
use crate::bus::BusConnection;
use crate::client::ClientId;
use crate::utils::Result;

#[derive(Debug, Default)]
struct Interest {
    by_topic: HashMap<String, HashSet<ClientId>>,
    by_client: HashMap<ClientId, HashSet<String>>,
}

impl Interest {
    /// Returns false if the pair was already present.
    fn insert(&mut self, client_id: &str, ticker: &str) -> bool {
        let added = self
            .by_topic
            .entry(ticker.to_string())
            .or_default()
            .insert(client_id.to_string());

        if added {
            self.by_client
                .entry(client_id.to_string())
                .or_default()
                .insert(ticker.to_string());
        }
        added
    }

    /// Returns `(removed, topic_now_empty)`.
    fn remove(&mut self, client_id: &str, ticker: &str) -> (bool, bool) {
        let Some(clients) = self.by_topic.get_mut(ticker) else {
            return (false, false);
        };

        let removed = clients.remove(client_id);
        let empty = clients.is_empty();
        if empty {
            self.by_topic.remove(ticker);
        }

        if removed {
            if let Some(topics) = self.by_client.get_mut(client_id) {
                topics.remove(ticker);
                if topics.is_empty() {
                    self.by_client.remove(client_id);
                }
            }
        }
        (removed, removed && empty)
    }
}

pub struct SubscriptionRegistry {
    bus: Arc<BusConnection>,
    names: TopicNames,
    gate: Mutex<()>,
    maps: RwLock<Interest>,
}

impl SubscriptionRegistry {
    pub fn new(bus: Arc<BusConnection>, names: TopicNames) -> Self {
        Self {
            bus,
            names,
            gate: Mutex::new(()),
            maps: RwLock::new(Interest::default()),
        }
    }

    /// Registers that `client_id` wants `ticker`.
    ///
    /// Returns `Ok(false)` when the interest already existed. The first
    /// interested client triggers the upstream subscribe before this returns;
    /// if that fails the interest is rolled back and the error is returned.
    pub async fn add_interest(&self, client_id: &str, ticker: &str) -> Result<bool> {
        let _gate = self.gate.lock().await;

        let first = {
            let mut maps = self.maps.write();
            if !maps.insert(client_id, ticker) {
                return Ok(false);
            }
            maps.by_topic.get(ticker).is_some_and(|c| c.len() == 1)
        };

        if first {
            let channel = self.names.channel(ticker);
            if let Err(e) = self.bus.subscribe(&channel).await {
                warn!(client_id, ticker, "Upstream subscribe failed: {e}");
                let (_, empty) = self.maps.write().remove(client_id, ticker);
                if empty {
                    self.bus.unsubscribe(&channel).await;
                }
                return Err(e);
            }
            info!(ticker, "First interest, subscribed upstream");
        }

        debug!(client_id, ticker, "Interest added");
        Ok(true)
    }

    /// Unregisters interest. Removing interest that was never added is a no-op.
    pub async fn remove_interest(&self, client_id: &str, ticker: &str) -> bool {
        let _gate = self.gate.lock().await;

        let (removed, empty) = self.maps.write().remove(client_id, ticker);
        if empty {
            self.bus.unsubscribe(&self.names.channel(ticker)).await;
            info!(ticker, "Last interest gone, unsubscribed upstream");
        }
        if removed {
            debug!(client_id, ticker, "Interest removed");
        }
        removed
    }

    /// Removes `client_id` from every ticker it held and releases the
    /// tickers nobody else wants. Returns those released tickers.
    pub async fn remove_client(&self, client_id: &str) -> Vec<String> {
        let _gate = self.gate.lock().await;

        let released: Vec<String> = {
            let mut maps = self.maps.write();
            let topics = maps.by_client.remove(client_id).unwrap_or_default();

            topics
                .into_iter()
                .filter(|ticker| {
                    let Some(clients) = maps.by_topic.get_mut(ticker) else {
                        return false;
                    };
                    clients.remove(client_id);
                    if clients.is_empty() {
                        maps.by_topic.remove(ticker);
                        true
                    } else {
                        false
                    }
                })
                .collect()
        };

        for ticker in &released {
            self.bus.unsubscribe(&self.names.channel(ticker)).await;
        }

        if !released.is_empty() {
            info!(client_id, released = ?released, "Released upstream subscriptions");
        }
        released
    }

    /// Snapshot of the clients interested in `ticker`.
    pub fn interested_clients(&self, ticker: &str) -> Vec<ClientId> {
        self.maps
            .read()
            .by_topic
            .get(ticker)
            .map(|clients| clients.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn topics_of(&self, client_id: &str) -> BTreeSet<String> {
        self.maps
            .read()
            .by_client
            .get(client_id)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Tickers with at least one interested client.
    pub fn active_topics(&self) -> BTreeSet<String> {
        self.maps.read().by_topic.keys().cloned().collect()
    }

    pub fn is_active(&self, ticker: &str) -> bool {
        self.maps.read().by_topic.contains_key(ticker)
    }

    pub fn names(&self) -> &TopicNames {
        &self.names
    }
}
