//! In-process publish/subscribe bus wiring every proxy component together.
//!
//! Each named channel owns a `tokio::sync::broadcast` sender. Every call to
//! [`PubSub::subscribe`] hands back an independent receiver, so a slow
//! subscriber only loses its own backlog (oldest-first) instead of blocking
//! the publisher or any other subscriber. Publishing to a channel with no
//! subscribers yet is a silent no-op — the channel is created lazily and
//! simply has no one listening.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};

/// Default bound on a per-subscriber queue before the oldest message is dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// A message published on the bus. Bodies are always `KEY££VALUE`-shaped
/// strings or raw protocol lines; the bus itself is payload-agnostic.
pub type Message = String;

#[derive(Debug, Error)]
pub enum PubSubError {
    /// The channel was closed (all senders dropped) while waiting.
    #[error("pubsub channel closed")]
    Closed,
}

/// Named-channel publish/subscribe bus with per-subscriber bounded queues.
///
/// Cheaply cloneable; every clone shares the same channel map. A fresh
/// `PubSub` is created for every proxy session so that no state leaks across
/// a restart.
#[derive(Clone)]
pub struct PubSub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Message>>>>,
    capacity: usize,
}

impl PubSub {
    /// Create a bus whose per-channel queues hold up to `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        PubSub {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Message> {
        let mut channels = self.channels.lock().expect("pubsub mutex poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Register a new bounded queue under `channel`. `subscriber_name` is
    /// carried through for logging only — it has no effect on delivery.
    pub fn subscribe(&self, channel: &str, subscriber_name: &str) -> Subscription {
        let tx = self.sender_for(channel);
        let rx = tx.subscribe();
        Subscription {
            channel: channel.to_string(),
            subscriber_name: subscriber_name.to_string(),
            rx,
        }
    }

    /// Remove a queue from its channel. Any messages it had not yet
    /// consumed are discarded; the channel itself is left intact for future
    /// subscribers.
    pub fn unsubscribe(&self, _subscription: Subscription) {
        // Dropping the receiver inside `_subscription` detaches it from the
        // broadcast sender. The channel entry in the map stays so a later
        // `subscribe` call on the same name still observes future publishes.
    }

    /// Fan `payload` out to every queue currently subscribed to `channel`.
    /// A channel with zero subscribers is a silent no-op.
    pub fn publish(&self, channel: &str, payload: impl Into<Message>) {
        let tx = self.sender_for(channel);
        let _ = tx.send(payload.into());
    }
}

impl Default for PubSub {
    fn default() -> Self {
        PubSub::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// A single subscriber's handle on a channel.
pub struct Subscription {
    channel: String,
    subscriber_name: String,
    rx: broadcast::Receiver<Message>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn subscriber_name(&self) -> &str {
        &self.subscriber_name
    }

    /// Wait for the next message, transparently skipping past any gap left
    /// by a full queue (the oldest messages are the ones dropped).
    pub async fn recv(&mut self) -> Result<Message, PubSubError> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Ok(msg),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(PubSubError::Closed),
            }
        }
    }

    /// Wait up to `dur` for the next message. Returns `Ok(None)` on timeout,
    /// mirroring the bus's "receiving on an exhausted queue is empty" rule.
    pub async fn listen(&mut self, dur: Duration) -> Result<Option<Message>, PubSubError> {
        match timeout(dur, self.recv()).await {
            Ok(Ok(msg)) => Ok(Some(msg)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }
}
