//! Pub/sub broker abstraction used by the ingestion listener.
//!
//! A subscription is a stream of messages; the stream ending means the
//! connection was lost and the caller is expected to reconnect.

use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;

use wattloop_telemetry::topic_matches;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("broker publish failed: {0}")]
    Publish(String),
}

pub type BrokerStream = Pin<Box<dyn Stream<Item = BrokerMessage> + Send>>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Connect and subscribe to the given wildcard patterns.
    async fn subscribe(&self, patterns: &[&str]) -> Result<BrokerStream, BrokerError>;

    /// Publish a payload to a concrete topic.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;
}

struct Subscriber {
    patterns: Vec<String>,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

/// In-process broker.
///
/// Messages published while nobody is subscribed are lost, like real pub/sub.
/// `disconnect` ends every open subscription; `fail_connections(n)` makes the
/// next `n` subscribe calls fail.
pub struct InMemoryBroker {
    subscribers: Mutex<Vec<Subscriber>>,
    failing_connects: Mutex<u32>,
    connects: watch::Sender<usize>,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("connections", &*self.connects.borrow())
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            failing_connects: Mutex::new(0),
            connects: watch::channel(0).0,
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop every live subscription, as if the connection was lost.
    pub fn disconnect(&self) {
        self.subscribers().clear();
    }

    pub fn fail_connections(&self, count: u32) {
        *self
            .failing_connects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = count;
    }

    /// Number of successful subscribe calls so far.
    pub fn connection_count(&self) -> usize {
        *self.connects.borrow()
    }

    /// Wait until at least `count` successful subscribe calls happened.
    pub async fn wait_for_connections(&self, count: usize) {
        let mut rx = self.connects.subscribe();
        let _ = rx.wait_for(|connects| *connects >= count).await;
    }

    /// Deliver to every matching subscriber. Returns how many received it.
    pub fn send(&self, topic: &str, payload: impl AsRef<[u8]>) -> usize {
        let message = BrokerMessage::new(topic, payload.as_ref());
        let mut subscribers = self.subscribers();
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers
            .iter()
            .filter(|s| s.patterns.iter().any(|p| topic_matches(p, topic)))
            .filter(|s| s.tx.send(message.clone()).is_ok())
            .count()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn subscribe(&self, patterns: &[&str]) -> Result<BrokerStream, BrokerError> {
        {
            let mut failing = self
                .failing_connects
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *failing > 0 {
                *failing -= 1;
                return Err(BrokerError::Connection("connection refused".to_string()));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers().push(Subscriber {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            tx,
        });
        self.connects.send_modify(|c| *c += 1);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.send(topic, payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn routes_by_pattern_and_ends_streams_on_disconnect() {
        let broker = InMemoryBroker::new();
        let mut stream = broker.subscribe(&["devices/*/telemetry"]).await.unwrap();

        assert_eq!(broker.send("devices/d1/telemetry", b"{}"), 1);
        assert_eq!(broker.send("devices/d1/status", b"{}"), 0);

        let msg = stream.next().await.unwrap();
        assert_eq!(msg.topic, "devices/d1/telemetry");

        broker.disconnect();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn injected_connection_failures_are_consumed() {
        let broker = InMemoryBroker::new();
        broker.fail_connections(1);
        assert!(broker.subscribe(&["a/*/b"]).await.is_err());
        assert!(broker.subscribe(&["a/*/b"]).await.is_ok());
        assert_eq!(broker.connection_count(), 1);
    }
}
