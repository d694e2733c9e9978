//! Orchestration of long-lived accelerator worker subprocesses.
//!
//! Each worker runs in its own child process for:
//! - Memory reclaim: kill the process to free all device memory
//! - Crash isolation: a faulty model or driver doesn't take down the pool
//!
//! Callers go through [`bridge::ProtocolBridge`] (validation and wire
//! layout), which leases a [`worker::WorkerController`] from the
//! [`worker::WorkerPoolManager`]; the controller talks to its subprocess
//! over a [`worker::MessageChannel`].

pub mod bridge;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod worker;

pub use bridge::ProtocolBridge;
pub use error::{ProtocolError, ValidationErrors, WorkerError};
pub use orchestrator::Orchestrator;
pub use worker::{
    AcceleratorId, AllocationRequest, MessageChannel, WorkerController, WorkerLease,
    WorkerPoolManager, WorkerState, WorkerStatus,
};

pub use gpu_orchestrator_config as config;
pub use gpu_orchestrator_types as types;
