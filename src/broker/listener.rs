//! Upstream listener
//!
//! Consumes the bus connection's message stream on a background task and
//! hands every message to each registered [`MessageHandler`].
//!
//! - A handler that errors or panics is logged and skipped; the other
//!   handlers and later messages are unaffected.
//! - When the stream ends the listener waits `restart_delay` and connects
//!   again. The bus connection applies its own backoff while connecting.
//! - `stop` lets the handler call in flight finish before returning.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{BusConnection, BusMessage};
use crate::utils::{PriceCastError, Result};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, message: &BusMessage) -> Result<()>;
}

type Handlers = Arc<RwLock<Vec<Arc<dyn MessageHandler>>>>;

pub struct UpstreamListener {
    bus: Arc<BusConnection>,
    restart_delay: Duration,
    handlers: Handlers,
    shutdown: parking_lot::Mutex<CancellationToken>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    restarts: Arc<AtomicU64>,
}

impl UpstreamListener {
    pub fn new(bus: Arc<BusConnection>, restart_delay: Duration) -> Self {
        Self {
            bus,
            restart_delay,
            handlers: Arc::new(RwLock::new(Vec::new())),
            shutdown: parking_lot::Mutex::new(CancellationToken::new()),
            task: tokio::sync::Mutex::new(None),
            restarts: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn MessageHandler>) {
        info!(handler = handler.name(), "Message handler registered");
        self.handlers.write().push(handler);
    }

    /// Returns whether a handler with that name was registered.
    pub fn remove_handler(&self, name: &str) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| h.name() != name);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// How many times the stream ended and the listener reconnected.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(PriceCastError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        *self.shutdown.lock() = token.clone();

        let bus = Arc::clone(&self.bus);
        let handlers = Arc::clone(&self.handlers);
        let restarts = Arc::clone(&self.restarts);
        let restart_delay = self.restart_delay;

        *task = Some(tokio::spawn(async move {
            run(bus, handlers, restart_delay, restarts, token).await;
        }));

        info!("Upstream listener started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.shutdown.lock().cancel();

        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Upstream listener task failed: {e}");
            }
        }
        self.bus.mark_disconnected().await;
        info!("Upstream listener stopped");
    }
}

async fn run(
    bus: Arc<BusConnection>,
    handlers: Handlers,
    restart_delay: Duration,
    restarts: Arc<AtomicU64>,
    token: CancellationToken,
) {
    loop {
        let mut stream = tokio::select! {
            _ = token.cancelled() => break,
            connected = bus.connect() => match connected {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Upstream listener giving up: {e}");
                    break;
                }
            },
        };

        let stream_ended = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break false,
                next = stream.next() => match next {
                    Some(message) => deliver(&handlers, &message).await,
                    None => break true,
                },
            }
        };

        if !stream_ended {
            break;
        }

        bus.mark_disconnected().await;
        restarts.fetch_add(1, Ordering::Relaxed);
        warn!(
            delay_ms = restart_delay.as_millis() as u64,
            "Bus stream ended, restarting listener"
        );

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(restart_delay) => {}
        }
    }
}

async fn deliver(handlers: &Handlers, message: &BusMessage) {
    let handlers: Vec<Arc<dyn MessageHandler>> = handlers.read().clone();

    for handler in handlers {
        match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_transport_error() => warn!(
                handler = handler.name(),
                channel = %message.channel,
                "Message handler hit a bus error: {e}"
            ),
            Ok(Err(e)) => error!(
                handler = handler.name(),
                channel = %message.channel,
                "Message handler failed: {e}"
            ),
            Err(_) => error!(
                handler = handler.name(),
                channel = %message.channel,
                "Message handler panicked"
            ),
        }
    }
}
