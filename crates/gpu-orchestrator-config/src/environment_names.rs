//! Environment variables read by the orchestrator.
//!
//! Every override lives here so the full set is discoverable in one place.

/// Path to the worker executable.
pub const WORKER_PROGRAM: &str = "GPU_ORCH_WORKER_PROGRAM";
/// Worker type / capability profile passed on the worker command line.
pub const WORKER_TYPE: &str = "GPU_ORCH_WORKER_TYPE";
/// Comma separated accelerator indices, e.g. `0,1,3`.
pub const ACCELERATORS: &str = "GPU_ORCH_ACCELERATORS";
/// Pool size for interchangeable workers.
pub const MAX_WORKERS: &str = "GPU_ORCH_MAX_WORKERS";
pub const CALL_TIMEOUT_MS: &str = "GPU_ORCH_CALL_TIMEOUT_MS";
pub const HEALTH_CHECK_INTERVAL_MS: &str = "GPU_ORCH_HEALTH_CHECK_INTERVAL_MS";
/// `fail_fast` or `queue`.
pub const BACKPRESSURE: &str = "GPU_ORCH_BACKPRESSURE";
/// `legacy` or `enhanced`.
pub const PROTOCOL: &str = "GPU_ORCH_PROTOCOL";
/// `downgrade` or `strict`.
pub const PROTOCOL_FALLBACK: &str = "GPU_ORCH_PROTOCOL_FALLBACK";
pub const LOG_LEVEL: &str = "GPU_ORCH_LOG_LEVEL";
pub const LOG_DIR: &str = "GPU_ORCH_LOG_DIR";

/// Device list honoured by CUDA runtimes; used to size the pool when no
/// explicit inventory is configured.
pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";
