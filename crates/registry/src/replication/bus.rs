//! Message bus abstraction.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::StorageResult;

/// Transport for replication events.
///
/// Delivery is at-most-once and ordered per subscription. Each node's own publications may be
/// delivered back to it.
#[async_trait]
pub trait MessageBus: Send + Sync + fmt::Debug {
    /// Publishes a message to every current subscriber.
    async fn publish(&self, message: Bytes) -> StorageResult<()>;

    /// Subscribes to messages published from now on.
    fn subscribe(&self) -> Box<dyn Subscription>;
}

/// A stream of messages from a [`MessageBus`].
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next message. Returns `None` once the bus is gone.
    async fn next(&mut self) -> Option<Bytes>;
}

/// In-process bus over a [`tokio::sync::broadcast`] channel.
///
/// Clones share the channel. Slow subscribers that fall more than `capacity` messages behind
/// skip the missed messages.
#[derive(Clone)]
pub struct BroadcastBus {
    sender: broadcast::Sender<Bytes>,
}

impl BroadcastBus {
    /// Default channel capacity.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Creates a bus buffering up to `capacity` messages per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl fmt::Debug for BroadcastBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastBus").field("subscribers", &self.subscriber_count()).finish()
    }
}

#[async_trait]
impl MessageBus for BroadcastBus {
    async fn publish(&self, message: Bytes) -> StorageResult<()> {
        // Publishing with no subscribers is not an error: there is simply no peer yet.
        if self.sender.send(message).is_err() {
            tracing::debug!("replication event published without subscribers");
        }
        Ok(())
    }

    fn subscribe(&self) -> Box<dyn Subscription> {
        Box::new(BroadcastSubscription { receiver: self.sender.subscribe() })
    }
}

struct BroadcastSubscription {
    receiver: broadcast::Receiver<Bytes>,
}

#[async_trait]
impl Subscription for BroadcastSubscription {
    async fn next(&mut self) -> Option<Bytes> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "replication subscriber lagged, events dropped");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
