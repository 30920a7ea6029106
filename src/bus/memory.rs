//! In-process bus with the same channel/pattern semantics as Redis pub/sub.
//!
//! Used by the test suite and handy for running the server without Redis.
//! Outages can be simulated with [`MemoryTransport::set_available`] and
//! [`MemoryTransport::drop_sessions`].

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{BusMessage, BusSession, Transport, TransportSink};
use crate::utils::{PriceCastError, Result};

/// A command received by the bus, recorded for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCommand {
    Subscribe(String),
    PSubscribe(String),
    Unsubscribe(String),
}

struct SessionSlot {
    id: u64,
    tx: mpsc::UnboundedSender<BusMessage>,
    channels: HashSet<String>,
    patterns: HashSet<String>,
}

struct Inner {
    available: bool,
    stalled: bool,
    next_id: u64,
    sessions: Vec<SessionSlot>,
    commands: Vec<BusCommand>,
}

#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                available: true,
                stalled: false,
                next_id: 0,
                sessions: Vec::new(),
                commands: Vec::new(),
            })),
        }
    }

    /// While unavailable, `open`, `publish` and session commands all fail.
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
    }

    /// While stalled, session commands never complete.
    pub fn set_stalled(&self, stalled: bool) {
        self.inner.lock().stalled = stalled;
    }

    /// Closes every open session; their streams end.
    pub fn drop_sessions(&self) {
        self.inner.lock().sessions.clear();
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Channels explicitly subscribed on any live session.
    pub fn subscribed_channels(&self) -> BTreeSet<String> {
        let inner = self.inner.lock();
        inner
            .sessions
            .iter()
            .flat_map(|s| s.channels.iter().cloned())
            .collect()
    }

    pub fn subscribed_patterns(&self) -> BTreeSet<String> {
        let inner = self.inner.lock();
        inner
            .sessions
            .iter()
            .flat_map(|s| s.patterns.iter().cloned())
            .collect()
    }

    pub fn commands(&self) -> Vec<BusCommand> {
        self.inner.lock().commands.clone()
    }

    /// How many SUBSCRIBE commands were received for `channel`.
    pub fn subscribe_count(&self, channel: &str) -> usize {
        self.inner
            .lock()
            .commands
            .iter()
            .filter(|c| matches!(c, BusCommand::Subscribe(ch) if ch == channel))
            .count()
    }

    pub fn unsubscribe_count(&self, channel: &str) -> usize {
        self.inner
            .lock()
            .commands
            .iter()
            .filter(|c| matches!(c, BusCommand::Unsubscribe(ch) if ch == channel))
            .count()
    }

    fn command(&self, session: u64, command: BusCommand) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.available {
            return Err(PriceCastError::BusUnavailable("bus is down".to_string()));
        }

        let Some(slot) = inner.sessions.iter_mut().find(|s| s.id == session) else {
            return Err(PriceCastError::BusUnavailable(
                "session closed".to_string(),
            ));
        };

        match &command {
            BusCommand::Subscribe(channel) => {
                slot.channels.insert(channel.clone());
            }
            BusCommand::PSubscribe(pattern) => {
                slot.patterns.insert(pattern.clone());
            }
            BusCommand::Unsubscribe(channel) => {
                slot.channels.remove(channel);
            }
        }
        inner.commands.push(command);
        Ok(())
    }
}

struct MemorySink {
    id: u64,
    transport: MemoryTransport,
}

impl MemorySink {
    async fn send(&self, command: BusCommand) -> Result<()> {
        let stalled = self.transport.inner.lock().stalled;
        if stalled {
            futures::future::pending::<()>().await;
        }
        self.transport.command(self.id, command)
    }
}

#[async_trait]
impl TransportSink for MemorySink {
    async fn subscribe(&mut self, channel: &str) -> Result<()> {
        self.send(BusCommand::Subscribe(channel.to_string())).await
    }

    async fn psubscribe(&mut self, pattern: &str) -> Result<()> {
        self.send(BusCommand::PSubscribe(pattern.to_string())).await
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<()> {
        self.send(BusCommand::Unsubscribe(channel.to_string())).await
    }
}

// Dropping the sink closes the session, like closing a Redis connection.
impl Drop for MemorySink {
    fn drop(&mut self) {
        self.transport.inner.lock().sessions.retain(|s| s.id != self.id);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self) -> Result<BusSession> {
        let (tx, rx) = mpsc::unbounded_channel();

        let id = {
            let mut inner = self.inner.lock();
            if !inner.available {
                return Err(PriceCastError::BusUnavailable("bus is down".to_string()));
            }
            inner.next_id += 1;
            let id = inner.next_id;
            inner.sessions.push(SessionSlot {
                id,
                tx,
                channels: HashSet::new(),
                patterns: HashSet::new(),
            });
            id
        };

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        })
        .boxed();

        Ok(BusSession {
            sink: Box::new(MemorySink {
                id,
                transport: self.clone(),
            }),
            stream,
        })
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let inner = self.inner.lock();
        if !inner.available {
            return Err(PriceCastError::BusUnavailable("bus is down".to_string()));
        }

        for slot in &inner.sessions {
            for pattern in &slot.patterns {
                if glob_match(pattern, channel) {
                    let _ = slot.tx.send(BusMessage {
                        channel: channel.to_string(),
                        payload: payload.to_string(),
                        pattern: Some(pattern.clone()),
                    });
                }
            }
            if slot.channels.contains(channel) {
                let _ = slot.tx.send(BusMessage::new(channel, payload));
            }
        }
        Ok(())
    }
}

/// `*` matches any run of characters; everything else is literal.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if text.len() < first.len() + last.len() || !text.starts_with(first) || !text.ends_with(last)
    {
        return false;
    }

    let mut rest = &text[first.len()..text.len() - last.len()];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(pos) => rest = &rest[pos + middle.len()..],
            None => return false,
        }
    }
    true
}
