//! Typed commands sent to a worker and the acknowledgements they produce.

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::envelope::{Envelope, MessageKind, Operation, ProtocolGeneration};
use crate::inference::{EnhancedInference, InferencePayload, LegacyInference};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InitializeArgs {
    pub accelerator_index: u32,
    pub worker_type: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoadModelArgs {
    pub model_path: String,
    pub model_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

/// The closed set of commands a worker accepts, one variant per operation.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCommand {
    Initialize(InitializeArgs),
    LoadModel(LoadModelArgs),
    UnloadModel,
    Inference(InferencePayload),
    Status,
    Health,
    Cleanup,
    Shutdown,
}

impl WorkerCommand {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Initialize(_) => Operation::Initialize,
            Self::LoadModel(_) => Operation::LoadModel,
            Self::UnloadModel => Operation::UnloadModel,
            Self::Inference(_) => Operation::Inference,
            Self::Status => Operation::Status,
            Self::Health => Operation::Health,
            Self::Cleanup => Operation::Cleanup,
            Self::Shutdown => Operation::Shutdown,
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandDecodeError {
    #[error("expected a request envelope, got {0:?}")]
    UnexpectedKind(MessageKind),
    #[error("unsupported protocol version '{0}'")]
    UnknownVersion(String),
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),
    #[error("invalid payload for '{operation}': {source}")]
    InvalidPayload {
        operation: Operation,
        #[source]
        source: serde_json::Error,
    },
}

/// A command tagged with the protocol generation it is encoded in.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    command: WorkerCommand,
    generation: ProtocolGeneration,
}

impl Command {
    /// Inference payloads carry their own layout, so their generation wins
    /// over `generation`.
    pub fn new(command: WorkerCommand, generation: ProtocolGeneration) -> Self {
        let generation = match &command {
            WorkerCommand::Inference(payload) => payload.generation(),
            _ => generation,
        };
        Self {
            command,
            generation,
        }
    }

    pub fn inference(payload: InferencePayload) -> Self {
        let generation = payload.generation();
        Self::new(WorkerCommand::Inference(payload), generation)
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    pub fn generation(&self) -> ProtocolGeneration {
        self.generation
    }

    pub fn operation(&self) -> Operation {
        self.command.operation()
    }

    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match &self.command {
            WorkerCommand::Initialize(args) => serde_json::to_value(args),
            WorkerCommand::LoadModel(args) => serde_json::to_value(args),
            WorkerCommand::Inference(InferencePayload::Legacy(legacy)) => {
                serde_json::to_value(legacy)
            }
            WorkerCommand::Inference(InferencePayload::Enhanced(enhanced)) => {
                serde_json::to_value(enhanced)
            }
            WorkerCommand::UnloadModel
            | WorkerCommand::Status
            | WorkerCommand::Health
            | WorkerCommand::Cleanup
            | WorkerCommand::Shutdown => Ok(Value::Object(Map::new())),
        }
    }

    pub fn to_envelope(&self, id: Option<u64>) -> Result<Envelope, serde_json::Error> {
        Ok(Envelope {
            version: self.generation.version().to_string(),
            kind: MessageKind::Request,
            operation: self.operation().as_str().to_string(),
            id,
            payload: self.payload()?,
        })
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, CommandDecodeError> {
        if envelope.kind != MessageKind::Request {
            return Err(CommandDecodeError::UnexpectedKind(envelope.kind));
        }
        let generation = ProtocolGeneration::from_version(&envelope.version)
            .ok_or_else(|| CommandDecodeError::UnknownVersion(envelope.version.clone()))?;
        let operation = Operation::parse(&envelope.operation)
            .ok_or_else(|| CommandDecodeError::UnknownOperation(envelope.operation.clone()))?;

        let command = match operation {
            Operation::Initialize => WorkerCommand::Initialize(decode(operation, &envelope.payload)?),
            Operation::LoadModel => WorkerCommand::LoadModel(decode(operation, &envelope.payload)?),
            Operation::UnloadModel => WorkerCommand::UnloadModel,
            Operation::Inference => {
                let payload = match generation {
                    ProtocolGeneration::Legacy => InferencePayload::Legacy(decode::<LegacyInference>(
                        operation,
                        &envelope.payload,
                    )?),
                    ProtocolGeneration::Enhanced => InferencePayload::Enhanced(
                        decode::<EnhancedInference>(operation, &envelope.payload)?,
                    ),
                };
                WorkerCommand::Inference(payload)
            }
            Operation::Status => WorkerCommand::Status,
            Operation::Health => WorkerCommand::Health,
            Operation::Cleanup => WorkerCommand::Cleanup,
            Operation::Shutdown => WorkerCommand::Shutdown,
        };
        Ok(Self::new(command, generation))
    }
}

fn decode<T: DeserializeOwned>(operation: Operation, payload: &Value) -> Result<T, CommandDecodeError> {
    serde_json::from_value(payload.clone())
        .map_err(|source| CommandDecodeError::InvalidPayload { operation, source })
}

/// `data` of a successful `initialize` response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct InitializeAck {
    #[serde(default)]
    pub accelerator_index: u32,
    #[serde(default)]
    pub worker_type: String,
    /// Optional components the worker has available.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Envelope versions the worker understands.
    #[serde(default)]
    pub protocol_versions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_total_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// `data` of a successful `load_model` response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct LoadModelAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_time_ms: Option<f64>,
}

/// `data` of a successful `status` response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct StatusReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_total_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands_handled: Option<u64>,
}

/// What a worker reported it can do during `initialize`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct CapabilitySet {
    pub components: BTreeSet<String>,
    pub generations: BTreeSet<String>,
}

impl CapabilitySet {
    pub fn new<I, S>(components: I, generations: &[ProtocolGeneration]) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            components: components.into_iter().map(Into::into).collect(),
            generations: generations.iter().map(|g| g.version().to_string()).collect(),
        }
    }

    pub fn from_ack(ack: &InitializeAck) -> Self {
        Self {
            components: ack.capabilities.iter().cloned().collect(),
            generations: ack.protocol_versions.iter().cloned().collect(),
        }
    }

    pub fn supports(&self, generation: ProtocolGeneration) -> bool {
        self.generations
            .iter()
            .any(|v| ProtocolGeneration::from_version(v) == Some(generation))
    }

    /// Required components that are not available.
    pub fn missing<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|name| !self.components.contains(name.as_str()))
            .map(String::as_str)
            .collect()
    }
}
