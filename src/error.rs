//! Error taxonomy for the worker layer.

use std::fmt;
use std::time::Duration;

use gpu_orchestrator_types::{ErrorKind, WireResponse};
use thiserror::Error;

use crate::worker::WorkerState;

/// Defects in the line protocol itself, as seen by the channel.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("worker closed its output stream")]
    StreamClosed,
    #[error("worker sent an empty response line")]
    EmptyResponse,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("unexpected message from worker: {0}")]
    UnexpectedMessage(String),
    #[error("response id {got} does not match request id {expected}")]
    CorrelationMismatch { expected: u64, got: u64 },
    #[error("channel lost sync after an abandoned exchange")]
    Desynchronized,
    #[error("channel is closed")]
    Closed,
    #[error("pipe I/O failed: {0}")]
    Io(String),
    #[error("failed to encode command: {0}")]
    Encode(String),
}

/// Reasons a request was rejected before dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(Vec<String>);

impl ValidationErrors {
    pub fn push(&mut self, reason: impl Into<String>) {
        self.0.push(reason.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn reasons(&self) -> &[String] {
        &self.0
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkerError {
    #[error("failed to launch worker process: {0}")]
    ProcessLaunch(String),
    #[error("protocol error during '{operation}': {source}")]
    Protocol {
        operation: String,
        #[source]
        source: ProtocolError,
    },
    #[error("request validation failed: {0}")]
    Validation(ValidationErrors),
    #[error("'{operation}' failed: {message}")]
    Operation { operation: String, message: String },
    #[error("'{operation}' timed out after {}ms", timeout.as_millis())]
    Timeout { operation: String, timeout: Duration },
    #[error("no worker available: {0}")]
    WorkerUnavailable(String),
    #[error("health check failed for {accelerator}: {reason}")]
    HealthCheck { accelerator: String, reason: String },
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: WorkerState, to: WorkerState },
    #[error("worker not ready: {0}")]
    NotReady(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl WorkerError {
    pub fn protocol(operation: impl fmt::Display, source: ProtocolError) -> Self {
        Self::Protocol {
            operation: operation.to_string(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProcessLaunch(_) => ErrorKind::ProcessLaunch,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Operation { .. } => ErrorKind::Operation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::WorkerUnavailable(_) => ErrorKind::WorkerUnavailable,
            Self::HealthCheck { .. } => ErrorKind::HealthCheck,
            Self::InvalidTransition { .. } | Self::NotReady(_) => ErrorKind::InvalidState,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Failures after which the subprocess state is unknown.
    pub fn leaves_worker_suspect(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. } | Self::Timeout { .. } | Self::Operation { .. }
        )
    }

    pub fn to_wire_response(&self, operation: &str) -> WireResponse {
        WireResponse::failure(operation, self.to_string())
    }
}

impl From<ValidationErrors> for WorkerError {
    fn from(errors: ValidationErrors) -> Self {
        Self::Validation(errors)
    }
}
