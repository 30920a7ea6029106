use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::listener::{MessageHandler, UpstreamListener};
use super::message::PriceEvent;
use super::registry::SubscriptionRegistry;
use super::topic::TopicNames;
use crate::bus::{BusConnection, BusMessage, Transport};
use crate::client::ClientRegistry;
use crate::config::Settings;
use crate::store::PriceStore;
use crate::transport::message::ServerMessage;
use crate::utils::{PriceCastError, Result};

/// Counters kept by the dispatch handler.
#[derive(Debug, Default)]
pub struct FeedStats {
    messages_seen: AtomicU64,
    messages_dispatched: AtomicU64,
    messages_dropped: AtomicU64,
    malformed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeedStatsSnapshot {
    /// Price messages seen through the wildcard subscription.
    pub messages_seen: u64,
    /// Per-client deliveries that were queued.
    pub messages_dispatched: u64,
    /// Per-client deliveries dropped because the client's queue was full.
    pub messages_dropped: u64,
    pub malformed: u64,
}

impl FeedStats {
    pub fn snapshot(&self) -> FeedStatsSnapshot {
        FeedStatsSnapshot {
            messages_seen: self.messages_seen.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Routes price messages from the bus to the interested clients.
///
/// With the wildcard enabled every publish arrives twice, once through the
/// pattern and once through the explicit channel. Only the explicit delivery
/// is routed; the pattern copy is counted and discarded.
struct PriceDispatch {
    names: TopicNames,
    clients: Arc<ClientRegistry>,
    stats: Arc<FeedStats>,
}

const DISPATCH_HANDLER: &str = "price-dispatch";

#[async_trait]
impl MessageHandler for PriceDispatch {
    fn name(&self) -> &str {
        DISPATCH_HANDLER
    }

    async fn handle(&self, message: &BusMessage) -> Result<()> {
        let Some(ticker) = self.names.ticker(&message.channel) else {
            debug!(channel = %message.channel, "Ignoring message outside the price namespace");
            return Ok(());
        };

        if message.from_pattern() {
            self.stats.messages_seen.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let event = PriceEvent::parse(ticker, &message.payload).inspect_err(|_| {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
        })?;

        let update = ServerMessage::price(&event.ticker, event.price);
        let report = self.clients.dispatch(ticker, &update);

        self.stats
            .messages_dispatched
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .messages_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);

        debug!(
            ticker,
            price = event.price,
            delivered = report.delivered,
            dropped = report.dropped,
            "Price dispatched"
        );
        Ok(())
    }
}

/// The fanout service: one bus connection, the two registries and the
/// upstream listener, owned together and started and stopped together.
///
/// Build one per process and share it behind an `Arc` with every connection
/// handler.
pub struct PriceFeed {
    settings: Settings,
    bus: Arc<BusConnection>,
    subscriptions: Arc<SubscriptionRegistry>,
    clients: Arc<ClientRegistry>,
    listener: UpstreamListener,
    stats: Arc<FeedStats>,
}

impl PriceFeed {
    pub fn new(
        settings: Settings,
        transport: Arc<dyn Transport>,
        store: Arc<dyn PriceStore>,
    ) -> Self {
        let bus = Arc::new(
            BusConnection::new(transport, settings.bus.reconnect.clone())
                .with_command_timeout(settings.bus.command_timeout()),
        );
        let names = TopicNames::new(settings.bus.channel_prefix.clone());

        let subscriptions = Arc::new(SubscriptionRegistry::new(Arc::clone(&bus), names.clone()));
        let clients = Arc::new(ClientRegistry::new(
            Arc::clone(&subscriptions),
            store,
            settings.clients.outbound_capacity,
        ));
        let stats = Arc::new(FeedStats::default());

        let listener = UpstreamListener::new(Arc::clone(&bus), settings.bus.restart_delay());
        listener.add_handler(Arc::new(PriceDispatch {
            names,
            clients: Arc::clone(&clients),
            stats: Arc::clone(&stats),
        }));

        Self {
            settings,
            bus,
            subscriptions,
            clients,
            listener,
            stats,
        }
    }

    /// Registers the wildcard (when enabled) and starts consuming the bus.
    pub async fn start(&self) -> Result<()> {
        if self.listener.is_running().await {
            return Err(PriceCastError::AlreadyRunning);
        }

        if self.settings.bus.wildcard {
            let pattern = self.settings.bus.wildcard_pattern();
            if let Err(e) = self.bus.psubscribe(&pattern).await {
                // recorded in the desired set, so the next connect replays it
                warn!(pattern, "Wildcard subscribe failed: {e}");
            }
        }

        self.listener.start().await?;
        info!(
            prefix = %self.settings.bus.channel_prefix,
            wildcard = self.settings.bus.wildcard,
            "Price feed started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        self.listener.stop().await;
        info!("Price feed stopped");
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn bus(&self) -> &Arc<BusConnection> {
        &self.bus
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn listener(&self) -> &UpstreamListener {
        &self.listener
    }

    pub fn stats(&self) -> FeedStatsSnapshot {
        self.stats.snapshot()
    }
}
