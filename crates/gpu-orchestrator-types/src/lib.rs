//! Types shared between the orchestrator and accelerator worker processes.
//!
//! The wire protocol is JSON Lines: one envelope per line, written to the
//! worker's stdin, with exactly one response envelope read back from its
//! stdout. Two protocol generations share the envelope and differ only in
//! how inference payloads are laid out.

pub mod api;
pub mod command;
pub mod envelope;
pub mod inference;

pub use api::{ApiResponse, ErrorKind};
pub use command::{
    CapabilitySet, Command, CommandDecodeError, InitializeAck, InitializeArgs, LoadModelAck,
    LoadModelArgs, StatusReport, WorkerCommand,
};
pub use envelope::{
    Envelope, MessageKind, Operation, ProtocolGeneration, ResponseMetrics, ResponsePayload,
    WireResponse,
};
pub use inference::{
    EnhancedInference, EnhancedInferenceResult, FeatureFlags, GeneratedImage,
    GenerationParameters, InferencePayload, InferenceRequest, InferenceResponse,
    LegacyInference, LegacyInferenceResult, LoraAdapter, MemoryInfo, OutputFormat,
    RequestMetadata, StageMetrics, TimingInfo,
};
