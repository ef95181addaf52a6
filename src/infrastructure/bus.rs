//! Message bus boundary.
//!
//! The pub/sub transport is an external collaborator: the engine only
//! requires ordered delivery of opaque byte payloads to and from named
//! topics, expressed by the [`MessageBus`] trait. Inbound delivery is
//! push-based: the bus forwards every message on a subscribed topic into
//! the mpsc channel handed over at construction.
//!
//! [`LocalBus`] is the in-process implementation used by the binary and
//! the test suite; real transports (MQTT, platform IPC) implement the
//! same trait outside this crate.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("bus publish failed: {0}")]
    Publish(String),
    #[error("bus subscription failed: {0}")]
    Subscribe(String),
}

#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publish a payload to a topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Begin delivering messages published to `topic` into the inbound
    /// channel. Subscribing twice to the same topic is a no-op.
    async fn subscribe(&self, topic: &str) -> Result<(), BusError>;

    /// Stop delivering messages for `topic`. Unknown topics are a no-op.
    async fn unsubscribe(&self, topic: &str) -> Result<(), BusError>;
}

const PUBLISHED_CHANNEL_CAPACITY: usize = 256;

/// In-process topic pub/sub with exact-match subscriptions.
pub struct LocalBus {
    subscriptions: Mutex<HashSet<String>>,
    inbound: mpsc::UnboundedSender<BusMessage>,
    published: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    /// `inbound` receives every message injected on a subscribed topic.
    pub fn new(inbound: mpsc::UnboundedSender<BusMessage>) -> Self {
        let (published, _) = broadcast::channel(PUBLISHED_CHANNEL_CAPACITY);
        Self {
            subscriptions: Mutex::new(HashSet::new()),
            inbound,
            published,
        }
    }

    /// Deliver a message from the outside world toward the gateway.
    /// Returns whether the topic had a subscription.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let subscribed = self
            .subscriptions
            .lock()
            .expect("subscription set poisoned")
            .contains(topic);
        if subscribed {
            let _ = self.inbound.send(BusMessage {
                topic: topic.to_string(),
                payload: payload.into(),
            });
        } else {
            debug!("dropping injected message for unsubscribed topic {}", topic);
        }
        subscribed
    }

    /// Observe everything the gateway publishes.
    pub fn published(&self) -> broadcast::Receiver<BusMessage> {
        self.published.subscribe()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions
            .lock()
            .expect("subscription set poisoned")
            .contains(topic)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        // No receiver just means nobody is watching; not an error.
        let _ = self.published.send(BusMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.subscriptions
            .lock()
            .expect("subscription set poisoned")
            .insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        self.subscriptions
            .lock()
            .expect("subscription set poisoned")
            .remove(topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inject_respects_subscriptions() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bus = LocalBus::new(tx);

        assert!(!bus.inject("some/topic", b"dropped".to_vec()));

        bus.subscribe("some/topic").await.unwrap();
        assert!(bus.inject("some/topic", b"delivered".to_vec()));

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "some/topic");
        assert_eq!(msg.payload, b"delivered");

        bus.unsubscribe("some/topic").await.unwrap();
        assert!(!bus.inject("some/topic", b"dropped again".to_vec()));
    }

    #[tokio::test]
    async fn published_messages_are_observable() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let bus = LocalBus::new(tx);
        let mut observer = bus.published();

        bus.publish("out/topic", b"{}".to_vec()).await.unwrap();
        let msg = observer.recv().await.unwrap();
        assert_eq!(msg.topic, "out/topic");
    }
}
