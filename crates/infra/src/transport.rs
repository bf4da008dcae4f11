//! Delivery of commands to gateways.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

use wattloop_core::{CommandId, DeviceId, GatewayId};
use wattloop_energy::{Command, CommandAction};

use crate::ingestion::Broker;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("gateway transport unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode command: {0}")]
    Encode(String),
}

/// What a gateway receives on `gateways/{gateway_id}/commands`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayCommand {
    pub command_id: CommandId,
    pub device_id: DeviceId,
    pub action: CommandAction,
    pub params: Map<String, JsonValue>,
    pub idempotency_key: String,
    pub attempt: u32,
}

impl GatewayCommand {
    pub fn from_command(command: &Command) -> Self {
        Self {
            command_id: command.id,
            device_id: command.device_id,
            action: command.action,
            params: command.params.clone(),
            idempotency_key: command.idempotency_key.to_string(),
            attempt: command.dispatch_attempts + 1,
        }
    }
}

pub fn command_topic(gateway_id: GatewayId) -> String {
    format!("gateways/{gateway_id}/commands")
}

#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn send(&self, command: &Command) -> Result<(), TransportError>;
}

/// Publishes commands on the pub/sub broker.
pub struct BrokerTransport {
    broker: Arc<dyn Broker>,
}

impl BrokerTransport {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl CommandTransport for BrokerTransport {
    async fn send(&self, command: &Command) -> Result<(), TransportError> {
        let topic = command_topic(command.gateway_id);
        let payload = serde_json::to_vec(&GatewayCommand::from_command(command))
            .map_err(|e| TransportError::Encode(e.to_string()))?;

        self.broker
            .publish(&topic, &payload)
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        debug!(command_id = %command.id, topic = %topic, "command published");
        Ok(())
    }
}

/// Records sent commands; can be switched off to simulate an unreachable gateway.
#[derive(Debug)]
pub struct InMemoryTransport {
    sent: Mutex<Vec<GatewayCommand>>,
    available: AtomicBool,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<GatewayCommand> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CommandTransport for InMemoryTransport {
    async fn send(&self, command: &Command) -> Result<(), TransportError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable(format!(
                "gateway {} unreachable",
                command.gateway_id
            )));
        }
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| TransportError::Unavailable("lock poisoned".to_string()))?;
        sent.push(GatewayCommand::from_command(command));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio_stream::StreamExt;
    use wattloop_energy::NewCommand;

    use crate::ingestion::InMemoryBroker;

    #[tokio::test]
    async fn broker_transport_publishes_on_the_gateway_topic() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut gateway_side = broker.subscribe(&["gateways/*/commands"]).await.unwrap();
        let transport = BrokerTransport::new(broker.clone());

        let command = Command::create(
            NewCommand::new(GatewayId::new(), DeviceId::new(), CommandAction::EcoMode),
            Utc::now(),
        )
        .unwrap();
        transport.send(&command).await.unwrap();

        let message = gateway_side.next().await.unwrap();
        assert_eq!(message.topic, command_topic(command.gateway_id));
        let body: GatewayCommand = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(body.command_id, command.id);
        assert_eq!(body.idempotency_key, command.idempotency_key.as_str());
        assert_eq!(body.attempt, 1);
    }
}
