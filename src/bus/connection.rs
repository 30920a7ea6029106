use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BusSession, BusStream, Transport, TransportSink};
use crate::config::ReconnectSettings;
use crate::utils::{PriceCastError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Disconnected,
    Connecting,
    Connected,
}

/// What happened to a subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Sent to the live session.
    Issued,
    /// No session right now; it will be sent on the next connect.
    Deferred,
}

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy)]
enum Command<'a> {
    Subscribe(&'a str),
    PSubscribe(&'a str),
    Unsubscribe(&'a str),
}

#[derive(Debug, Default)]
struct Desired {
    channels: BTreeSet<String>,
    patterns: BTreeSet<String>,
}

/// Reconnecting connection to the message bus.
///
/// `desired` always mirrors what the bus should carry. The sink lock is held
/// while `desired` changes and while a new session replays it, so a command
/// is never lost between a replay and a concurrent subscribe.
///
/// A failed or timed-out command drops the session and ends its stream, so
/// the consumer reconnects and the replay brings the bus back in line with
/// `desired`.
pub struct BusConnection {
    transport: Arc<dyn Transport>,
    reconnect: ReconnectSettings,
    command_timeout: Duration,
    state: Mutex<BusState>,
    desired: Mutex<Desired>,
    sink: tokio::sync::Mutex<Option<Box<dyn TransportSink>>>,
    session_token: Mutex<CancellationToken>,
    sessions: AtomicU64,
}

impl BusConnection {
    pub fn new(transport: Arc<dyn Transport>, reconnect: ReconnectSettings) -> Self {
        Self {
            transport,
            reconnect,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            state: Mutex::new(BusState::Disconnected),
            desired: Mutex::new(Desired::default()),
            sink: tokio::sync::Mutex::new(None),
            session_token: Mutex::new(CancellationToken::new()),
            sessions: AtomicU64::new(0),
        }
    }

    /// Upper bound for a single subscribe/unsubscribe on the live session.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn state(&self) -> BusState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == BusState::Connected
    }

    /// Number of sessions opened so far; anything above one is a reconnect.
    pub fn sessions_opened(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Channels the bus is expected to carry.
    pub fn active_channels(&self) -> BTreeSet<String> {
        self.desired.lock().channels.clone()
    }

    pub fn active_patterns(&self) -> BTreeSet<String> {
        self.desired.lock().patterns.clone()
    }

    /// Opens a session, retrying with exponential backoff, and replays every
    /// desired pattern and channel before handing out the stream.
    pub async fn connect(&self) -> Result<BusStream> {
        let mut attempt: u32 = 0;

        loop {
            self.set_state(BusState::Connecting);

            match self.try_connect().await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    attempt += 1;
                    self.set_state(BusState::Disconnected);

                    if self.reconnect.gives_up_after(attempt) {
                        warn!(attempt, "Giving up on the message bus: {e}");
                        return Err(PriceCastError::ReconnectExhausted(attempt));
                    }

                    let delay = self.reconnect.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Message bus connect failed: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<BusStream> {
        let BusSession { mut sink, stream } = self.transport.open().await?;

        let mut current = self.sink.lock().await;
        let (patterns, channels) = {
            let desired = self.desired.lock();
            (desired.patterns.clone(), desired.channels.clone())
        };

        for pattern in &patterns {
            self.issue(&mut sink, Command::PSubscribe(pattern)).await?;
        }
        for channel in &channels {
            self.issue(&mut sink, Command::Subscribe(channel)).await?;
        }

        let token = CancellationToken::new();
        *self.session_token.lock() = token.clone();
        *current = Some(sink);
        self.set_state(BusState::Connected);
        let n = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;

        info!(
            session = n,
            channels = channels.len(),
            patterns = patterns.len(),
            "Connected to message bus"
        );
        Ok(stream.take_until(token.cancelled_owned()).boxed())
    }

    /// Drops the current session. The next `connect` replays `desired`.
    pub async fn mark_disconnected(&self) {
        let mut current = self.sink.lock().await;
        self.drop_session(&mut current);
    }

    /// Ends the stream handed out for the current session.
    fn drop_session(&self, current: &mut Option<Box<dyn TransportSink>>) {
        *current = None;
        self.session_token.lock().cancel();
        self.set_state(BusState::Disconnected);
    }

    async fn issue(&self, sink: &mut Box<dyn TransportSink>, command: Command<'_>) -> Result<()> {
        let pending = match command {
            Command::Subscribe(channel) => sink.subscribe(channel),
            Command::PSubscribe(pattern) => sink.psubscribe(pattern),
            Command::Unsubscribe(channel) => sink.unsubscribe(channel),
        };

        match tokio::time::timeout(self.command_timeout, pending).await {
            Ok(result) => result,
            Err(_) => Err(PriceCastError::BusUnavailable(format!(
                "command timed out after {}ms",
                self.command_timeout.as_millis()
            ))),
        }
    }

    pub async fn subscribe(&self, channel: &str) -> Result<SubscribeOutcome> {
        let mut current = self.sink.lock().await;
        self.desired.lock().channels.insert(channel.to_string());

        let Some(sink) = current.as_mut() else {
            debug!(channel, "Bus down, subscribe deferred");
            return Ok(SubscribeOutcome::Deferred);
        };

        let result = self.issue(sink, Command::Subscribe(channel)).await;
        match result {
            Ok(()) => {
                debug!(channel, "Subscribed upstream");
                Ok(SubscribeOutcome::Issued)
            }
            Err(e) => {
                warn!(channel, "Upstream subscribe failed, dropping session: {e}");
                self.drop_session(&mut current);
                Err(unavailable(e))
            }
        }
    }

    pub async fn psubscribe(&self, pattern: &str) -> Result<SubscribeOutcome> {
        let mut current = self.sink.lock().await;
        self.desired.lock().patterns.insert(pattern.to_string());

        let Some(sink) = current.as_mut() else {
            return Ok(SubscribeOutcome::Deferred);
        };

        let result = self.issue(sink, Command::PSubscribe(pattern)).await;
        match result {
            Ok(()) => Ok(SubscribeOutcome::Issued),
            Err(e) => {
                self.drop_session(&mut current);
                Err(unavailable(e))
            }
        }
    }

    /// Removes `channel` from the desired set. A failed live command drops
    /// the session, so the channel disappears with it and is not replayed.
    pub async fn unsubscribe(&self, channel: &str) {
        let mut current = self.sink.lock().await;
        self.desired.lock().channels.remove(channel);

        let Some(sink) = current.as_mut() else {
            return;
        };

        let result = self.issue(sink, Command::Unsubscribe(channel)).await;
        match result {
            Ok(()) => debug!(channel, "Unsubscribed upstream"),
            Err(e) => {
                warn!(channel, "Upstream unsubscribe failed, dropping session: {e}");
                self.drop_session(&mut current);
            }
        }
    }

    /// Publish primitive for external collaborators; the fanout never calls it.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.transport.publish(channel, payload).await
    }

    fn set_state(&self, state: BusState) {
        *self.state.lock() = state;
    }
}

fn unavailable(e: PriceCastError) -> PriceCastError {
    match e {
        PriceCastError::BusUnavailable(_) => e,
        other => PriceCastError::BusUnavailable(other.to_string()),
    }
}
