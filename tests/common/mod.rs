//! Shared setup for tests that drive the mock worker binary.

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use gpu_orchestrator::config::{BackpressurePolicy, OrchestratorConfig};
use gpu_orchestrator::worker::{AcceleratorId, ControllerOptions, WorkerController};
use tempfile::TempDir;

/// Config pointing at the mock worker with timeouts short enough for tests.
/// The periodic health check is pushed out of the way; tests trigger it.
pub fn mock_config(workers: usize) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.worker.program = PathBuf::from(env!("CARGO_BIN_EXE_gpu_mock_worker"));
    config.worker.env.insert("MOCK_WORKER_LOG_LEVEL".into(), "warn".into());
    config.pool.accelerators = Some((0..workers as u32).collect());
    config.pool.initialize_timeout_ms = 10_000;
    config.pool.load_timeout_ms = 10_000;
    config.pool.call_timeout_ms = 5_000;
    config.pool.health_timeout_ms = 2_000;
    config.pool.health_check_interval_ms = 3_600_000;
    config.pool.dispose_grace_ms = 1_000;
    config.pool.retry.backoff_ms = 10;
    config.pool.backpressure = BackpressurePolicy::FailFast;
    config
}

/// Set a `MOCK_WORKER_*` knob on every worker the config spawns.
pub fn with_knob(mut config: OrchestratorConfig, key: &str, value: &str) -> OrchestratorConfig {
    config.worker.env.insert(key.to_string(), value.to_string());
    config
}

pub fn controller(config: &OrchestratorConfig) -> WorkerController {
    WorkerController::new(ControllerOptions::new(AcceleratorId::new(0), config))
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// A temporary model file; the mock only checks that the path exists.
pub struct ModelFile {
    _dir: TempDir,
    path: PathBuf,
}

impl ModelFile {
    pub fn new(name: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("{name}.safetensors"));
        std::fs::write(&path, b"weights").unwrap();
        Self { _dir: dir, path }
    }

    pub fn path(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}
