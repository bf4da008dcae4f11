//! Redis pub/sub broker.
//!
//! Redis pub/sub is not durable: messages published while the listener is
//! reconnecting are lost. Subscriptions use `PSUBSCRIBE`, so the `*` wildcard
//! follows Redis glob rules; topics are re-parsed by the listener anyway.

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio_stream::StreamExt;
use tracing::debug;

use super::broker::{Broker, BrokerError, BrokerMessage, BrokerStream};

#[derive(Debug, Clone)]
pub struct RedisBroker {
    client: redis::Client,
}

impl RedisBroker {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn subscribe(&self, patterns: &[&str]) -> Result<BrokerStream, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        for pattern in patterns {
            pubsub
                .psubscribe(*pattern)
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
        }
        debug!(?patterns, "redis pattern subscriptions active");

        let stream = pubsub.into_on_message().map(|msg| BrokerMessage {
            topic: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        });
        Ok(Box::pin(stream))
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let _receivers: i64 = conn
            .publish(topic, payload)
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }
}
