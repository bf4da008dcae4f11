use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use wattloop_core::{CommandId, DomainError, DomainResult, ProofId};

use crate::command::{Command, CommandStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofKind {
    StateChanged,
    PowerDrop,
    Both,
}

impl_str_enum!(ProofKind, "proof kind" {
    StateChanged => "state_changed",
    PowerDrop => "power_drop",
    Both => "both",
});

/// Evidence that a command took effect on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandProof {
    pub id: ProofId,
    pub command_id: CommandId,
    pub kind: ProofKind,
    /// Before/after evidence as reported by the gateway.
    pub payload: JsonValue,
    pub verified_at: DateTime<Utc>,
}

impl CommandProof {
    /// Build a proof for a command that has reached `success`.
    pub fn for_command(
        command: &Command,
        kind: ProofKind,
        payload: JsonValue,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if command.status != CommandStatus::Success {
            return Err(DomainError::validation(format!(
                "proof requires a successful command, {} is {}",
                command.id, command.status
            )));
        }
        if payload.is_null() {
            return Err(DomainError::validation("proof payload cannot be empty"));
        }
        Ok(Self {
            id: ProofId::new(),
            command_id: command.id,
            kind,
            payload,
            verified_at: now,
        })
    }
}
