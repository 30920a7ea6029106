//! Per-connection lifecycle: `Connecting → Active → Closing → Closed`.
//!
//! A [`Session`] is created once the WebSocket handshake is done and closed
//! exactly once when the socket goes away, whatever the reason. Closing
//! cancels the keepalive, releases every ticker the connection held and
//! removes it from the client registry, in that order.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::message::{ClientMessage, Request, ServerMessage};
use crate::broker::PriceFeed;
use crate::client::{ClientId, ClientRegistry, Delivery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

pub struct Session {
    id: ClientId,
    feed: Arc<PriceFeed>,
    state: SessionState,
    topics: BTreeSet<String>,
    token: CancellationToken,
    keepalive: Option<JoinHandle<()>>,
}

impl Session {
    /// Registers a new client, queues the connection acknowledgement and
    /// starts the keepalive. The returned receiver is the client's outbound
    /// queue and must be drained by the caller.
    pub fn open(feed: Arc<PriceFeed>) -> (Self, Receiver<ServerMessage>) {
        let clients = Arc::clone(feed.clients());
        let (client, outbound) = clients.open_channel();

        let mut session = Self {
            id: client.id.clone(),
            feed: Arc::clone(&feed),
            state: SessionState::Connecting,
            topics: BTreeSet::new(),
            token: CancellationToken::new(),
            keepalive: None,
        };

        clients.register(client);
        clients.send_to(&session.id, ServerMessage::connection_established());

        session.keepalive = Some(tokio::spawn(keepalive(
            clients,
            session.id.clone(),
            feed.settings().clients.heartbeat_interval(),
            session.token.clone(),
        )));
        session.state = SessionState::Active;

        info!(client_id = %session.id, "Session opened");
        (session, outbound)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Tickers this connection currently holds.
    pub fn topics(&self) -> &BTreeSet<String> {
        &self.topics
    }

    /// Cancelled when the session should be torn down: keepalive failure
    /// or `close`.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn handle_text(&mut self, text: &str) {
        if self.state != SessionState::Active {
            return;
        }

        match ClientMessage::parse(text) {
            Ok(Request::Subscribe(tickers)) => self.subscribe(tickers).await,
            Ok(Request::Unsubscribe(tickers)) => self.unsubscribe(tickers).await,
            Ok(Request::Unknown(action)) => {
                debug!(client_id = %self.id, action, "Unknown action");
                self.reply(ServerMessage::echo(format!("Received unknown action: {action}")));
            }
            Err(e) => {
                warn!(client_id = %self.id, "Invalid client message: {e}");
                self.reply(ServerMessage::error(format!("Error processing message: {e}")));
            }
        }
    }

    /// Registers interest in each ticker, then queues its snapshot.
    ///
    /// The client becomes a dispatch target before the snapshot is read, so
    /// a live update published in between can reach it ahead of the
    /// snapshot.
    async fn subscribe(&mut self, tickers: Vec<String>) {
        let subscriptions = Arc::clone(self.feed.subscriptions());
        let clients = Arc::clone(self.feed.clients());

        for ticker in tickers {
            if self.topics.contains(&ticker) {
                continue;
            }

            match subscriptions.add_interest(&self.id, &ticker).await {
                Ok(_) => {
                    self.topics.insert(ticker.clone());
                    clients.send_snapshot(&self.id, &ticker).await;
                    info!(client_id = %self.id, ticker, "Subscribed");
                }
                Err(e) => {
                    self.reply(ServerMessage::error(format!(
                        "Failed to subscribe to {ticker}: {e}"
                    )));
                }
            }
        }
    }

    async fn unsubscribe(&mut self, tickers: Vec<String>) {
        let subscriptions = Arc::clone(self.feed.subscriptions());

        for ticker in tickers {
            if self.topics.remove(&ticker) {
                subscriptions.remove_interest(&self.id, &ticker).await;
                info!(client_id = %self.id, ticker, "Unsubscribed");
            }
        }
    }

    fn reply(&self, message: ServerMessage) {
        self.feed.clients().send_to(&self.id, message);
    }

    /// Tears the session down. Safe to call more than once.
    pub async fn close(&mut self) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.state = SessionState::Closing;

        self.token.cancel();
        if let Some(handle) = self.keepalive.take() {
            if let Err(e) = handle.await {
                warn!(client_id = %self.id, "Keepalive task failed: {e}");
            }
        }

        let released = self.feed.subscriptions().remove_client(&self.id).await;
        self.feed.clients().unregister(&self.id);
        self.topics.clear();

        self.state = SessionState::Closed;
        info!(client_id = %self.id, released = released.len(), "Session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        // Dropped without close(): stop the keepalive and finish the
        // teardown on the runtime if there still is one.
        self.token.cancel();
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
        }
        self.feed.clients().unregister(&self.id);

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let feed = Arc::clone(&self.feed);
            let id = self.id.clone();
            runtime.spawn(async move {
                feed.subscriptions().remove_client(&id).await;
            });
        }
    }
}

async fn keepalive(
    clients: Arc<ClientRegistry>,
    client_id: ClientId,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let delivery = tokio::select! {
            _ = token.cancelled() => break,
            delivery = clients.send_with_timeout(&client_id, ServerMessage::heartbeat(), period) => delivery,
        };

        if delivery != Delivery::Queued {
            warn!(%client_id, ?delivery, "Heartbeat could not be queued, closing session");
            token.cancel();
            break;
        }
        debug!(%client_id, "Heartbeat queued");
    }
}
