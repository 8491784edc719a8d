//! Topic-based fan-out of committed ops and presence.
//!
//! Each channel name maps to one tokio broadcast channel. Two channels exist
//! per document: `collection` (live queries) and `collection.id` (document
//! subscribers). A publish is delivered to every receiver attached at the
//! time of the send; dropping a [`Subscription`] detaches its receiver, so
//! nothing published after the drop can reach it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::protocol::Message;

pub fn doc_channel(collection: &str, id: &str) -> String {
    format!("{collection}.{id}")
}

pub fn collection_channel(collection: &str) -> String {
    collection.to_string()
}

/// Statistics for monitoring bus health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PubSubStats {
    pub messages_published: u64,
    /// Messages skipped by receivers that fell behind
    pub messages_dropped: u64,
    pub active_channels: usize,
}

struct Inner {
    channels: Mutex<HashMap<String, broadcast::Sender<Arc<Message>>>>,
    capacity: usize,
    messages_published: AtomicU64,
    messages_dropped: AtomicU64,
}

impl Inner {
    /// Removes the channel once its last receiver is gone.
    fn prune(&self, channel: &str) {
        let mut channels = self.channels.lock();
        if channels.get(channel).is_some_and(|tx| tx.receiver_count() == 0) {
            channels.remove(channel);
            log::trace!("Closed channel {channel}");
        }
    }
}

/// In-process channel bus. Cheap to clone.
#[derive(Clone)]
pub struct PubSub {
    inner: Arc<Inner>,
}

impl PubSub {
    /// `capacity` is how many messages a receiver may fall behind before
    /// it starts losing them.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: Mutex::new(HashMap::new()),
                capacity,
                messages_published: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self, channel: &str) -> Subscription {
        let mut channels = self.inner.channels.lock();
        let rx = match channels.get(channel) {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(self.inner.capacity);
                channels.insert(channel.to_string(), tx);
                rx
            }
        };
        Subscription {
            channel: channel.to_string(),
            rx: Some(rx),
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Sends `message` to every listed channel. Returns the number of
    /// receivers reached.
    pub fn publish(&self, channels: &[String], message: Arc<Message>) -> usize {
        let senders = self.inner.channels.lock();
        let mut delivered = 0;
        for channel in channels {
            if let Some(tx) = senders.get(channel) {
                delivered += tx.send(Arc::clone(&message)).unwrap_or(0);
            }
        }
        self.inner.messages_published.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    pub fn stats(&self) -> PubSubStats {
        PubSubStats {
            messages_published: self.inner.messages_published.load(Ordering::Relaxed),
            messages_dropped: self.inner.messages_dropped.load(Ordering::Relaxed),
            active_channels: self.channel_count(),
        }
    }
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub").field("stats", &self.stats()).finish()
    }
}

/// A live attachment to one channel.
pub struct Subscription {
    channel: String,
    rx: Option<broadcast::Receiver<Arc<Message>>>,
    bus: Weak<Inner>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` once the bus is gone. A receiver that falls
    /// behind skips what it missed; subscribers recover from the version
    /// gap themselves.
    pub async fn recv(&mut self) -> Option<Arc<Message>> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Subscriber on {} lagged, skipped {n} messages", self.channel);
                    if let Some(bus) = self.bus.upgrade() {
                        bus.messages_dropped.fetch_add(n, Ordering::Relaxed);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        drop(self.rx.take());
        if let Some(bus) = self.bus.upgrade() {
            bus.prune(&self.channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DocRequest, Message};
    use std::time::Duration;
    use tokio::time::timeout;

    fn message(d: &str) -> Arc<Message> {
        Arc::new(Message::Fetch(DocRequest::new("dogs", d, None)))
    }

    #[tokio::test]
    async fn test_fan_out_to_doc_and_collection() {
        let bus = PubSub::new(16);
        let mut doc = bus.subscribe(&doc_channel("dogs", "fido"));
        let mut collection = bus.subscribe(&collection_channel("dogs"));
        let mut other = bus.subscribe(&doc_channel("dogs", "spot"));

        let channels = [doc_channel("dogs", "fido"), collection_channel("dogs")];
        assert_eq!(bus.publish(&channels, message("fido")), 2);

        assert_eq!(doc.recv().await, Some(message("fido")));
        assert_eq!(collection.recv().await, Some(message("fido")));
        assert!(timeout(Duration::from_millis(20), other.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_nothing_after_unsubscribe() {
        let bus = PubSub::new(16);
        let channel = doc_channel("dogs", "fido");
        let sub = bus.subscribe(&channel);
        assert_eq!(bus.channel_count(), 1);

        drop(sub);
        assert_eq!(bus.channel_count(), 0);
        assert_eq!(bus.publish(&[channel.clone()], message("fido")), 0);

        let mut late = bus.subscribe(&channel);
        bus.publish(&[channel], message("spot"));
        assert_eq!(late.recv().await, Some(message("spot")));
    }

    #[tokio::test]
    async fn test_channel_survives_while_receivers_remain() {
        let bus = PubSub::new(16);
        let channel = doc_channel("dogs", "fido");
        let first = bus.subscribe(&channel);
        let mut second = bus.subscribe(&channel);
        drop(first);
        assert_eq!(bus.channel_count(), 1);
        assert_eq!(bus.publish(&[channel], message("fido")), 1);
        assert!(second.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_lagged_receiver_skips_and_counts() {
        let bus = PubSub::new(2);
        let channel = doc_channel("dogs", "fido");
        let mut sub = bus.subscribe(&channel);
        for id in ["a", "b", "c", "d"] {
            bus.publish(&[channel.clone()], message(id));
        }
        assert_eq!(sub.recv().await, Some(message("c")));
        let stats = bus.stats();
        assert_eq!(stats.messages_published, 4);
        assert_eq!(stats.messages_dropped, 2);
    }
}
