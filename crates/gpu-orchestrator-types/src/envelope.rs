//! Message envelope and response payload of the line protocol.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which generation of the request layout a message uses.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolGeneration {
    /// Flat, action-style payloads (`version: "1.0"`).
    Legacy,
    /// Structured payloads with metadata and feature flags (`version: "2.0"`).
    Enhanced,
}

impl ProtocolGeneration {
    /// Version string carried in the envelope.
    pub fn version(self) -> &'static str {
        match self {
            Self::Legacy => "1.0",
            Self::Enhanced => "2.0",
        }
    }

    /// Map an envelope version back to a generation. Only the major
    /// component is significant, so "2", "2.0" and "2.1" are all enhanced.
    pub fn from_version(version: &str) -> Option<Self> {
        let major = version.trim().split('.').next()?;
        match major {
            "1" => Some(Self::Legacy),
            "2" => Some(Self::Enhanced),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy/{}", self.version()),
            Self::Enhanced => write!(f, "enhanced/{}", self.version()),
        }
    }
}

/// The `type` field of an envelope.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Event,
    Error,
}

/// Operations a worker accepts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Initialize,
    LoadModel,
    UnloadModel,
    Inference,
    Status,
    Health,
    Cleanup,
    Shutdown,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Operation::Initialize,
        Operation::LoadModel,
        Operation::UnloadModel,
        Operation::Inference,
        Operation::Status,
        Operation::Health,
        Operation::Cleanup,
        Operation::Shutdown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::LoadModel => "load_model",
            Self::UnloadModel => "unload_model",
            Self::Inference => "inference",
            Self::Status => "status",
            Self::Health => "health",
            Self::Cleanup => "cleanup",
            Self::Shutdown => "shutdown",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == name)
    }

    /// Operations that may be retried without side effects.
    pub fn is_idempotent(self) -> bool {
        matches!(self, Self::Status | Self::Health)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    pub version: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub operation: String,
    /// Correlation id. Requests always carry one; workers echo it back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Build the response envelope for `request`, echoing its version,
    /// operation and id. Unsuccessful payloads are sent as `error`.
    pub fn reply_to(request: &Envelope, payload: &ResponsePayload) -> Self {
        let kind = if payload.success {
            MessageKind::Response
        } else {
            MessageKind::Error
        };
        Self {
            version: request.version.clone(),
            kind,
            operation: request.operation.clone(),
            id: request.id,
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    /// Progress or diagnostic event tied to an in-flight request.
    pub fn event(request: &Envelope, payload: Value) -> Self {
        Self {
            version: request.version.clone(),
            kind: MessageKind::Event,
            operation: request.operation.clone(),
            id: request.id,
            payload,
        }
    }
}

/// `payload` of a response or error envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ResponsePayload {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ResponseMetrics>,
}

impl ResponsePayload {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_metrics(mut self, metrics: ResponseMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Timing and memory samples reported alongside a response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ResponseMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_memory_mb: Option<f64>,
    /// Worker-specific samples that have no dedicated field.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A response line after decoding and correlation.
#[derive(Debug, Clone, PartialEq)]
pub struct WireResponse {
    pub operation: String,
    pub id: Option<u64>,
    pub generation: Option<ProtocolGeneration>,
    pub payload: ResponsePayload,
}

impl WireResponse {
    /// A failure response that never touched the wire, used to report
    /// channel-side defects in response form.
    pub fn failure(operation: &str, message: impl Into<String>) -> Self {
        Self {
            operation: operation.to_string(),
            id: None,
            generation: None,
            payload: ResponsePayload::failure(message),
        }
    }

    pub fn is_success(&self) -> bool {
        self.payload.success
    }

    pub fn data(&self) -> Option<&Value> {
        self.payload.data.as_ref()
    }

    pub fn metrics(&self) -> Option<&ResponseMetrics> {
        self.payload.metrics.as_ref()
    }

    /// The worker's error text, or a generic message when it sent none.
    pub fn error_message(&self) -> String {
        self.payload
            .error
            .clone()
            .unwrap_or_else(|| format!("worker reported failure for '{}'", self.operation))
    }
}
