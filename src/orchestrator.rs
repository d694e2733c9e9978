//! Top-level entry point: one pool, one negotiated bridge, and the
//! `ApiResponse` contract for everything except inference.

use std::collections::BTreeMap;

use futures_util::future::join_all;
use gpu_orchestrator_config::OrchestratorConfig;
use gpu_orchestrator_types::{ApiResponse, CapabilitySet, InferenceRequest, InferenceResponse, ProtocolGeneration};
use log::{info, warn};

use crate::bridge::ProtocolBridge;
use crate::error::WorkerError;
use crate::worker::{AllocationRequest, LoadedModel, PoolStatus, WorkerPoolManager, WorkerStatus};

pub struct Orchestrator {
    pool: WorkerPoolManager,
    bridge: ProtocolBridge,
}

impl Orchestrator {
    /// Start the pool and negotiate the protocol against the first worker.
    pub async fn start(config: OrchestratorConfig) -> Result<Self, WorkerError> {
        let pool = WorkerPoolManager::start(&config).await?;
        let capabilities = match config.protocol.preferred {
            ProtocolGeneration::Legacy => CapabilitySet::default(),
            ProtocolGeneration::Enhanced => {
                let lease = match pool.allocate(&AllocationRequest::default()).await {
                    Ok(lease) => lease,
                    Err(err) => {
                        pool.shutdown().await;
                        return Err(err);
                    }
                };
                lease.capabilities().unwrap_or_default()
            }
        };
        let bridge = match ProtocolBridge::negotiate(&capabilities, &config.protocol) {
            Ok(bridge) => bridge,
            Err(err) => {
                pool.shutdown().await;
                return Err(err);
            }
        };
        info!("[ORCHESTRATOR] Started with {} protocol", bridge.generation());
        Ok(Self { pool, bridge })
    }

    pub fn from_parts(pool: WorkerPoolManager, bridge: ProtocolBridge) -> Self {
        Self { pool, bridge }
    }

    pub fn pool(&self) -> &WorkerPoolManager {
        &self.pool
    }

    pub fn bridge(&self) -> &ProtocolBridge {
        &self.bridge
    }

    /// Make sure a worker is up and report it.
    pub async fn initialize_worker(&self) -> ApiResponse<WorkerStatus> {
        respond(self.pool.allocate(&AllocationRequest::default()).await.map(|lease| lease.get_status()))
    }

    /// Load a model on some worker, preferring one that already has it.
    pub async fn load_model(
        &self,
        model_path: &str,
        model_type: &str,
        model_id: Option<&str>,
    ) -> ApiResponse<LoadedModel> {
        let request = AllocationRequest {
            worker_type: None,
            model_id: model_id.map(str::to_string),
        };
        let result = match self.pool.allocate(&request).await {
            Ok(lease) => lease.load_model(model_path, model_type, model_id).await,
            Err(err) => Err(err),
        };
        respond(result)
    }

    /// Unload `model_id` from the worker holding it. `false` when no idle
    /// worker has it loaded; never starts a worker to find out.
    pub async fn unload_model(&self, model_id: &str) -> ApiResponse<bool> {
        if self.pool.status().shut_down {
            return respond(Err(WorkerError::WorkerUnavailable("pool is shut down".into())));
        }
        let holder = self
            .pool
            .lease_idle()
            .into_iter()
            .find(|lease| lease.current_model_id().as_deref() == Some(model_id));
        let result = match holder {
            Some(lease) => lease.unload_model().await.map(|()| true),
            None => Ok(false),
        };
        respond(result)
    }

    pub async fn run_inference(&self, request: &InferenceRequest) -> InferenceResponse {
        self.bridge.execute(&self.pool, request).await
    }

    pub fn status(&self) -> ApiResponse<PoolStatus> {
        ApiResponse::ok(self.pool.status())
    }

    /// Ask every idle worker to free cached memory.
    pub async fn cleanup(&self) -> ApiResponse<BTreeMap<String, bool>> {
        let leases = self.pool.lease_idle();
        let outcomes = join_all(leases.iter().map(|lease| async move {
            (lease.accelerator_id().to_string(), lease.cleanup_memory().await)
        }))
        .await;
        for (id, ok) in &outcomes {
            if !ok {
                warn!("[ORCHESTRATOR] Cleanup failed on {id}");
            }
        }
        ApiResponse::ok(outcomes.into_iter().collect())
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

fn respond<T>(result: Result<T, WorkerError>) -> ApiResponse<T> {
    match result {
        Ok(data) => ApiResponse::ok(data),
        Err(err) => ApiResponse::failure(err.kind(), err.to_string()),
    }
}
