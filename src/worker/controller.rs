//! One accelerator, one worker subprocess.
//!
//! The controller owns the subprocess and its channel, enforces the
//! lifecycle state machine, and tracks the loaded model and in-flight
//! sessions. Lifecycle operations (load, unload, inference, cleanup) are
//! serialized by an operation lock; `initialize` has its own gate so that
//! concurrent callers share a single handshake.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gpu_orchestrator_config::{OrchestratorConfig, PoolConfig, RetryPolicy, WorkerLaunchConfig};
use gpu_orchestrator_types::{
    CapabilitySet, Command, InferencePayload, InitializeAck, InitializeArgs, LoadModelAck,
    LoadModelArgs, Operation, ProtocolGeneration, StatusReport, WireResponse, WorkerCommand,
};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::BufReader;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex as TokioMutex;
use uuid::Uuid;

use super::channel::{MessageChannel, PipeChannel};
use super::process::WorkerProcess;
use super::state::WorkerState;
use crate::error::{ProtocolError, WorkerError};

/// How long to wait for an exit after the worker's stdout closes.
const EXIT_PROBE: Duration = Duration::from_millis(250);
/// Wait for the `shutdown` acknowledgement during dispose.
const SHUTDOWN_ACK_WAIT: Duration = Duration::from_secs(1);
const STDIN_CLOSE_WAIT: Duration = Duration::from_millis(100);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AcceleratorId(u32);

impl AcceleratorId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for AcceleratorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "accel-{}", self.0)
    }
}

/// Sent to the pool when a controller enters `Error`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerFault {
    pub accelerator: AcceleratorId,
    pub incarnation: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerTimeouts {
    pub initialize: Duration,
    pub load: Duration,
    pub call: Duration,
    pub health: Duration,
    pub dispose_grace: Duration,
}

impl WorkerTimeouts {
    pub fn from_pool(config: &PoolConfig) -> Self {
        Self {
            initialize: config.initialize_timeout(),
            load: config.load_timeout(),
            call: config.call_timeout(),
            health: config.health_timeout(),
            dispose_grace: config.dispose_grace(),
        }
    }
}

pub struct ControllerOptions {
    pub accelerator: AcceleratorId,
    /// Distinguishes successive controllers on the same accelerator.
    pub incarnation: u64,
    pub worker_type: String,
    pub launch: WorkerLaunchConfig,
    pub timeouts: WorkerTimeouts,
    pub retry: RetryPolicy,
    /// Generation used for control commands when the worker supports it.
    pub preferred: ProtocolGeneration,
    pub faults: Option<UnboundedSender<WorkerFault>>,
}

impl ControllerOptions {
    pub fn new(accelerator: AcceleratorId, config: &OrchestratorConfig) -> Self {
        Self {
            accelerator,
            incarnation: 0,
            worker_type: config.pool.worker_type.clone(),
            launch: config.worker.clone(),
            timeouts: WorkerTimeouts::from_pool(&config.pool),
            retry: config.pool.retry.clone(),
            preferred: config.protocol.preferred,
            faults: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoadedModel {
    pub model_id: String,
    pub model_path: String,
    pub model_type: String,
    pub loaded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_mb: Option<f64>,
}

/// An inference call that has been dispatched and not yet answered.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerStatus {
    pub accelerator_id: String,
    pub incarnation: u64,
    pub state: WorkerState,
    pub initialized: bool,
    pub has_model_loaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<LoadedModel>,
    pub last_activity: DateTime<Utc>,
    pub active_sessions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub commands_sent: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<ProtocolGeneration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct WorkerLink {
    process: WorkerProcess,
    channel: PipeChannel,
}

struct Shared {
    state: WorkerState,
    model: Option<LoadedModel>,
    last_activity: DateTime<Utc>,
    last_error: Option<String>,
    capabilities: Option<CapabilitySet>,
    control: ProtocolGeneration,
}

pub struct WorkerController {
    accelerator: AcceleratorId,
    incarnation: u64,
    worker_type: String,
    launch: WorkerLaunchConfig,
    timeouts: WorkerTimeouts,
    retry: RetryPolicy,
    preferred: ProtocolGeneration,
    faults: Option<UnboundedSender<WorkerFault>>,
    init_gate: TokioMutex<()>,
    op_lock: TokioMutex<()>,
    link: Mutex<Option<Arc<WorkerLink>>>,
    shared: RwLock<Shared>,
    sessions: Mutex<HashMap<Uuid, Session>>,
}

impl WorkerController {
    pub fn new(options: ControllerOptions) -> Self {
        Self {
            accelerator: options.accelerator,
            incarnation: options.incarnation,
            worker_type: options.worker_type,
            launch: options.launch,
            timeouts: options.timeouts,
            retry: options.retry,
            preferred: options.preferred,
            faults: options.faults,
            init_gate: TokioMutex::new(()),
            op_lock: TokioMutex::new(()),
            link: Mutex::new(None),
            shared: RwLock::new(Shared {
                state: WorkerState::Uninitialized,
                model: None,
                last_activity: Utc::now(),
                last_error: None,
                capabilities: None,
                control: ProtocolGeneration::Legacy,
            }),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn accelerator(&self) -> AcceleratorId {
        self.accelerator
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn state(&self) -> WorkerState {
        self.shared().state
    }

    pub fn current_model(&self) -> Option<LoadedModel> {
        self.shared().model.clone()
    }

    pub fn current_model_id(&self) -> Option<String> {
        self.shared().model.as_ref().map(|m| m.model_id.clone())
    }

    pub fn has_model_loaded(&self) -> bool {
        self.shared().model.is_some()
    }

    /// Capabilities reported during the handshake.
    pub fn capabilities(&self) -> Option<CapabilitySet> {
        self.shared().capabilities.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared().last_error.clone()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions().len()
    }

    pub fn commands_sent(&self) -> u64 {
        self.link_slot()
            .as_ref()
            .map_or(0, |link| link.channel.commands_sent())
    }

    pub fn pid(&self) -> Option<u32> {
        self.link_slot().as_ref().and_then(|link| link.process.pid())
    }

    /// Initialized, not failed, and the process has not been seen exiting.
    pub fn is_healthy(&self) -> bool {
        let state = self.state();
        if !state.is_initialized() || state == WorkerState::Error {
            return false;
        }
        self.link_slot()
            .as_ref()
            .is_some_and(|link| link.process.is_alive())
    }

    /// Spawn the subprocess and complete the handshake. Safe to call
    /// repeatedly and concurrently; only the first caller does the work.
    pub async fn initialize(&self) -> Result<(), WorkerError> {
        let _gate = self.init_gate.lock().await;
        match self.state() {
            WorkerState::Uninitialized => {}
            WorkerState::Initializing => {
                // An earlier initialize was dropped mid-handshake.
                let reason = "initialization was interrupted";
                self.fail(reason);
                return Err(WorkerError::NotReady(format!("{}: {reason}", self.accelerator)));
            }
            state @ (WorkerState::Error | WorkerState::Disposed) => {
                return Err(WorkerError::NotReady(format!(
                    "{} cannot be initialized while {state}",
                    self.accelerator
                )));
            }
            _ => return Ok(()),
        }

        self.transition(WorkerState::Initializing)?;
        info!(
            "[WORKER {}] Initializing {} worker",
            self.accelerator, self.worker_type
        );

        match self.handshake().await {
            Ok(ack) => {
                let capabilities = CapabilitySet::from_ack(&ack);
                let control = if self.preferred == ProtocolGeneration::Enhanced
                    && capabilities.supports(ProtocolGeneration::Enhanced)
                {
                    ProtocolGeneration::Enhanced
                } else {
                    ProtocolGeneration::Legacy
                };
                self.transition_with(WorkerState::Ready, |shared| {
                    shared.capabilities = Some(capabilities);
                    shared.control = control;
                })?;
                info!(
                    "[WORKER {}] Ready (device: {}, protocols: {:?}, pid: {:?})",
                    self.accelerator,
                    ack.device_name.as_deref().unwrap_or("unknown"),
                    ack.protocol_versions,
                    self.pid()
                );
                Ok(())
            }
            Err(err) => {
                self.fail(&err.to_string());
                Err(err)
            }
        }
    }

    async fn handshake(&self) -> Result<InitializeAck, WorkerError> {
        let label = self.accelerator.to_string();
        let (process, pipes) = WorkerProcess::spawn(
            &label,
            &self.launch,
            &self.worker_type,
            self.accelerator.index(),
        )?;
        let channel = MessageChannel::new(label, pipes.stdin, BufReader::new(pipes.stdout));
        let link = Arc::new(WorkerLink { process, channel });
        *self.link_slot() = Some(link.clone());

        // Every worker understands the legacy envelope for the handshake.
        let command = Command::new(
            WorkerCommand::Initialize(InitializeArgs {
                accelerator_index: self.accelerator.index(),
                worker_type: self.worker_type.clone(),
            }),
            ProtocolGeneration::Legacy,
        );
        let response = self.call(&link, &command, self.timeouts.initialize).await?;
        decode_data(&response)
    }

    /// Load a model, replacing any model already loaded.
    ///
    /// On failure the controller moves to `Error` and the previously loaded
    /// model (if any) is still reported.
    pub async fn load_model(
        &self,
        model_path: &str,
        model_type: &str,
        model_id: Option<&str>,
    ) -> Result<LoadedModel, WorkerError> {
        let _op = self.op_lock.lock().await;
        let state = self.state();
        if !matches!(state, WorkerState::Ready | WorkerState::Loaded) {
            return Err(WorkerError::NotReady(format!(
                "{} cannot load a model while {state}",
                self.accelerator
            )));
        }
        let link = self.current_link()?;

        self.transition(WorkerState::Loading)?;
        let mut guard = InflightGuard::new(self, Operation::LoadModel, None);
        info!("[WORKER {}] Loading model {model_path}", self.accelerator);

        let command = Command::new(
            WorkerCommand::LoadModel(LoadModelArgs {
                model_path: model_path.to_string(),
                model_type: model_type.to_string(),
                model_id: model_id.map(str::to_string),
            }),
            self.control_generation(),
        );
        let result = match self.call(&link, &command, self.timeouts.load).await {
            Ok(response) => decode_data::<LoadModelAck>(&response),
            Err(err) => Err(err),
        };
        guard.finish();

        let ack = match result {
            Ok(ack) => ack,
            Err(err) => {
                self.fail(&err.to_string());
                return Err(err);
            }
        };

        let model = LoadedModel {
            model_id: model_id
                .map(str::to_string)
                .or(ack.model_id)
                .unwrap_or_else(|| model_id_from_path(model_path)),
            model_path: model_path.to_string(),
            model_type: model_type.to_string(),
            loaded_at: Utc::now(),
            memory_used_mb: ack.memory_used_mb,
        };
        let stored = model.clone();
        self.transition_with(WorkerState::Loaded, |shared| shared.model = Some(stored))?;
        info!(
            "[WORKER {}] Model {} loaded in {}ms",
            self.accelerator,
            model.model_id,
            ack.load_time_ms.unwrap_or_default()
        );
        Ok(model)
    }

    /// Unload the current model. A no-op when nothing is loaded.
    pub async fn unload_model(&self) -> Result<(), WorkerError> {
        let _op = self.op_lock.lock().await;
        match self.state() {
            WorkerState::Ready => return Ok(()),
            WorkerState::Loaded => {}
            state => {
                return Err(WorkerError::NotReady(format!(
                    "{} cannot unload while {state}",
                    self.accelerator
                )));
            }
        }
        let link = self.current_link()?;

        self.transition(WorkerState::Loading)?;
        let mut guard = InflightGuard::new(self, Operation::UnloadModel, None);
        let command = Command::new(WorkerCommand::UnloadModel, self.control_generation());
        let result = self.call(&link, &command, self.timeouts.call).await;
        guard.finish();

        match result {
            Ok(_) => {
                self.transition_with(WorkerState::Ready, |shared| shared.model = None)?;
                info!("[WORKER {}] Model unloaded", self.accelerator);
                Ok(())
            }
            Err(err) => {
                self.fail(&err.to_string());
                Err(err)
            }
        }
    }

    /// Dispatch one inference payload. Fails fast, without touching the
    /// subprocess, when no model is loaded.
    pub async fn run_inference(
        &self,
        payload: InferencePayload,
    ) -> Result<WireResponse, WorkerError> {
        if !self.has_model_loaded() {
            return Err(self.no_model());
        }
        let _op = self.op_lock.lock().await;
        let state = self.state();
        if !self.has_model_loaded() {
            return Err(self.no_model());
        }
        if state != WorkerState::Loaded {
            return Err(WorkerError::NotReady(format!(
                "{} cannot run inference while {state}",
                self.accelerator
            )));
        }
        let link = self.current_link()?;

        let session_id = Uuid::new_v4();
        self.transition(WorkerState::Running)?;
        self.sessions().insert(
            session_id,
            Session {
                session_id,
                started_at: Utc::now(),
            },
        );
        let mut guard = InflightGuard::new(self, Operation::Inference, Some(session_id));
        debug!(
            "[WORKER {}] Session {session_id} started ({})",
            self.accelerator,
            payload.generation()
        );

        let result = self
            .call(&link, &Command::inference(payload), self.timeouts.call)
            .await;
        guard.finish();

        match result {
            Ok(response) => {
                if let Err(e) = self.transition(WorkerState::Loaded) {
                    debug!("[WORKER {}] {e}", self.accelerator);
                }
                Ok(response)
            }
            Err(err) => {
                self.fail(&err.to_string());
                Err(err)
            }
        }
    }

    /// Ask the worker to release cached memory. Leaves the load state alone.
    pub async fn cleanup_memory(&self) -> bool {
        let _op = self.op_lock.lock().await;
        let state = self.state();
        if !matches!(state, WorkerState::Ready | WorkerState::Loaded) {
            debug!("[WORKER {}] Skipping cleanup while {state}", self.accelerator);
            return false;
        }
        let Ok(link) = self.current_link() else {
            return false;
        };

        let command = Command::new(WorkerCommand::Cleanup, self.control_generation());
        match self.call(&link, &command, self.timeouts.call).await {
            Ok(_) => {
                debug!("[WORKER {}] Memory cleanup done", self.accelerator);
                true
            }
            Err(WorkerError::Operation { message, .. }) if link.process.is_alive() => {
                warn!("[WORKER {}] Cleanup refused: {message}", self.accelerator);
                false
            }
            Err(err) => {
                self.fail(&err.to_string());
                false
            }
        }
    }

    /// Fetch the worker's own status report. Retried per the retry policy.
    pub async fn query_status(&self) -> Result<StatusReport, WorkerError> {
        let _op = self.op_lock.lock().await;
        let state = self.state();
        if !matches!(state, WorkerState::Ready | WorkerState::Loaded) {
            return Err(WorkerError::NotReady(format!(
                "{} cannot report status while {state}",
                self.accelerator
            )));
        }
        let link = self.current_link()?;
        let command = Command::new(WorkerCommand::Status, self.control_generation());
        match self.call_with_retry(&link, &command, self.timeouts.call).await {
            Ok(response) => decode_data(&response),
            Err(err) => {
                self.fail(&err.to_string());
                Err(err)
            }
        }
    }

    /// Liveness plus, when the worker is idle, a `health` round trip.
    /// A failed probe moves the controller to `Error`.
    pub async fn probe_health(&self) -> Result<(), WorkerError> {
        let unhealthy = |reason: String| WorkerError::HealthCheck {
            accelerator: self.accelerator.to_string(),
            reason,
        };

        let state = self.state();
        if !state.is_initialized() || state == WorkerState::Error {
            return Err(unhealthy(
                self.last_error()
                    .unwrap_or_else(|| format!("worker is {state}")),
            ));
        }
        let link = self.current_link().map_err(|e| unhealthy(e.to_string()))?;
        if !link.process.check_alive().await {
            let reason = format!(
                "worker process exited ({})",
                link.process
                    .exit_description()
                    .unwrap_or_else(|| "exit status unknown".to_string())
            );
            self.fail(&reason);
            return Err(unhealthy(reason));
        }

        let Ok(_op) = self.op_lock.try_lock() else {
            debug!("[WORKER {}] Busy, liveness check only", self.accelerator);
            return Ok(());
        };
        let command = Command::new(WorkerCommand::Health, self.control_generation());
        match self.call_with_retry(&link, &command, self.timeouts.health).await {
            Ok(_) => Ok(()),
            Err(err) => {
                let reason = err.to_string();
                self.fail(&reason);
                Err(unhealthy(reason))
            }
        }
    }

    /// Tear down the subprocess. Idempotent; the controller cannot be
    /// reused afterwards.
    pub async fn dispose(&self) {
        let from = {
            let mut shared = self.shared_mut();
            let from = shared.state;
            if from == WorkerState::Disposed {
                return;
            }
            if !from.can_transition_to(WorkerState::Disposed) {
                // Busy states pass through Error; nobody needs a fault for it.
                shared.state = WorkerState::Error;
                shared
                    .last_error
                    .get_or_insert_with(|| format!("disposed while {from}"));
            }
            shared.state = WorkerState::Disposed;
            from
        };
        info!("[WORKER {}] Disposing (was {from})", self.accelerator);

        let link = self.link_slot().take();
        let Some(link) = link else {
            return;
        };
        let grace = self.timeouts.dispose_grace;
        if from != WorkerState::Error && !link.channel.is_busy() {
            let command = Command::new(WorkerCommand::Shutdown, self.control_generation());
            if let Err(e) = link.channel.send(&command, SHUTDOWN_ACK_WAIT.min(grace)).await {
                debug!("[WORKER {}] Shutdown not acknowledged: {e}", self.accelerator);
            }
        }
        link.channel.close(STDIN_CLOSE_WAIT).await;
        link.process.terminate(grace).await;
        debug!("[WORKER {}] Disposed", self.accelerator);
    }

    pub fn get_status(&self) -> WorkerStatus {
        let link = self.link_slot().clone();
        let active_sessions = self.active_sessions();
        let shared = self.shared();
        WorkerStatus {
            accelerator_id: self.accelerator.to_string(),
            incarnation: self.incarnation,
            state: shared.state,
            initialized: shared.state.is_initialized(),
            has_model_loaded: shared.model.is_some(),
            model: shared.model.clone(),
            last_activity: shared.last_activity,
            active_sessions,
            pid: link.as_ref().and_then(|l| l.process.pid()),
            commands_sent: link.as_ref().map_or(0, |l| l.channel.commands_sent()),
            protocol: shared.capabilities.as_ref().map(|_| shared.control),
            capabilities: shared
                .capabilities
                .as_ref()
                .map(|c| c.components.iter().cloned().collect())
                .unwrap_or_default(),
            error: shared.last_error.clone(),
        }
    }

    async fn call(
        &self,
        link: &WorkerLink,
        command: &Command,
        deadline: Duration,
    ) -> Result<WireResponse, WorkerError> {
        let operation = command.operation();
        let result = link.channel.send(command, deadline).await;
        self.shared_mut().last_activity = Utc::now();

        match result {
            Ok(response) if response.is_success() => Ok(response),
            Ok(response) => Err(WorkerError::Operation {
                operation: operation.to_string(),
                message: response.error_message(),
            }),
            Err(err) => {
                let pipe_gone = matches!(
                    &err,
                    WorkerError::Protocol {
                        source: ProtocolError::StreamClosed | ProtocolError::Io(_),
                        ..
                    }
                );
                if pipe_gone {
                    if let Some(exit) = link.process.exited_within(EXIT_PROBE).await {
                        return Err(WorkerError::Operation {
                            operation: operation.to_string(),
                            message: format!("worker process exited ({exit}) during '{operation}'"),
                        });
                    }
                }
                Err(err)
            }
        }
    }

    /// Like [`Self::call`], retrying idempotent operations with backoff.
    async fn call_with_retry(
        &self,
        link: &WorkerLink,
        command: &Command,
        deadline: Duration,
    ) -> Result<WireResponse, WorkerError> {
        let attempts = if command.operation().is_idempotent() {
            self.retry.max_attempts.max(1)
        } else {
            1
        };
        let mut attempt = 1;
        loop {
            match self.call(link, command, deadline).await {
                Ok(response) => return Ok(response),
                Err(err) if attempt < attempts && link.process.is_alive() => {
                    debug!(
                        "[WORKER {}] '{}' attempt {attempt}/{attempts} failed: {err}",
                        self.accelerator,
                        command.operation()
                    );
                    tokio::time::sleep(self.retry.backoff()).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn control_generation(&self) -> ProtocolGeneration {
        self.shared().control
    }

    fn no_model(&self) -> WorkerError {
        WorkerError::NotReady(format!("no model loaded on {}", self.accelerator))
    }

    fn transition(&self, next: WorkerState) -> Result<(), WorkerError> {
        self.transition_with(next, |_| {})
    }

    fn transition_with(
        &self,
        next: WorkerState,
        update: impl FnOnce(&mut Shared),
    ) -> Result<(), WorkerError> {
        let mut shared = self.shared_mut();
        let from = shared.state;
        if !from.can_transition_to(next) {
            return Err(WorkerError::InvalidTransition { from, to: next });
        }
        shared.state = next;
        shared.last_activity = Utc::now();
        update(&mut shared);
        drop(shared);
        debug!("[WORKER {}] {from} -> {next}", self.accelerator);
        Ok(())
    }

    /// Move to `Error` and tell the pool. No-op once failed or disposed.
    fn fail(&self, reason: &str) {
        let from = {
            let mut shared = self.shared_mut();
            let from = shared.state;
            if !from.can_transition_to(WorkerState::Error) {
                return;
            }
            shared.state = WorkerState::Error;
            shared.last_error = Some(reason.to_string());
            from
        };
        warn!("[WORKER {}] {from} -> error: {reason}", self.accelerator);
        if let Some(ref faults) = self.faults {
            let _ = faults.send(WorkerFault {
                accelerator: self.accelerator,
                incarnation: self.incarnation,
                reason: reason.to_string(),
            });
        }
    }

    fn current_link(&self) -> Result<Arc<WorkerLink>, WorkerError> {
        self.link_slot().clone().ok_or_else(|| {
            WorkerError::NotReady(format!("{} has no running process", self.accelerator))
        })
    }

    fn link_slot(&self) -> MutexGuard<'_, Option<Arc<WorkerLink>>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shared(&self) -> RwLockReadGuard<'_, Shared> {
        self.shared.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn shared_mut(&self) -> RwLockWriteGuard<'_, Shared> {
        self.shared.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fails the controller if an operation is dropped between dispatch and
/// reply, since the worker may still be acting on it.
struct InflightGuard<'a> {
    controller: &'a WorkerController,
    operation: Operation,
    session: Option<Uuid>,
    armed: bool,
}

impl<'a> InflightGuard<'a> {
    fn new(controller: &'a WorkerController, operation: Operation, session: Option<Uuid>) -> Self {
        Self {
            controller,
            operation,
            session,
            armed: true,
        }
    }

    fn finish(&mut self) {
        self.armed = false;
        self.end_session();
    }

    fn end_session(&mut self) {
        if let Some(id) = self.session.take() {
            self.controller.sessions().remove(&id);
        }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.end_session();
        if self.armed {
            self.controller.fail(&format!(
                "'{}' was abandoned before the worker replied",
                self.operation
            ));
        }
    }
}

/// Decode a response's `data`, treating a missing `data` as empty.
fn decode_data<T: DeserializeOwned + Default>(response: &WireResponse) -> Result<T, WorkerError> {
    match response.data() {
        None | Some(serde_json::Value::Null) => Ok(T::default()),
        Some(data) => serde_json::from_value(data.clone()).map_err(|e| {
            WorkerError::protocol(
                &response.operation,
                ProtocolError::Malformed(format!("unexpected data: {e}")),
            )
        }),
    }
}

fn model_id_from_path(model_path: &str) -> String {
    Path::new(model_path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| model_path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accelerator_display() {
        assert_eq!(AcceleratorId::new(3).to_string(), "accel-3");
        assert_eq!(serde_json::to_value(AcceleratorId::new(3)).unwrap(), json!(3));
    }

    #[test]
    fn test_model_id_from_path() {
        assert_eq!(model_id_from_path("/models/sdxl-base.safetensors"), "sdxl-base");
        assert_eq!(model_id_from_path("plain"), "plain");
    }

    #[test]
    fn test_decode_data_defaults_when_missing() {
        let response = WireResponse::failure("load_model", "ignored");
        let ack: LoadModelAck = decode_data(&response).unwrap();
        assert_eq!(ack, LoadModelAck::default());

        let mut response = WireResponse::failure("status", "ignored");
        response.payload.data = Some(json!({"uptime_s": "soon"}));
        let err = decode_data::<StatusReport>(&response).unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Protocol { source: ProtocolError::Malformed(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_fresh_controller_rejects_work_without_spawning() {
        let config = OrchestratorConfig::default();
        let controller = WorkerController::new(ControllerOptions::new(AcceleratorId::new(0), &config));

        let err = controller
            .run_inference(InferencePayload::Legacy(gpu_orchestrator_types::LegacyInference::new(
                gpu_orchestrator_types::InferenceRequest::new("cat").parameters(),
            )))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::NotReady(ref m) if m.contains("no model loaded")));
        assert!(matches!(
            controller.load_model("/m.bin", "sd15", None).await,
            Err(WorkerError::NotReady(_))
        ));
        assert!(!controller.cleanup_memory().await);
        assert!(!controller.is_healthy());

        let status = controller.get_status();
        assert_eq!(status.state, WorkerState::Uninitialized);
        assert_eq!(status.commands_sent, 0);
        assert!(status.pid.is_none());

        controller.dispose().await;
        assert_eq!(controller.state(), WorkerState::Disposed);
    }

    #[tokio::test]
    async fn test_launch_failure_moves_to_error_and_notifies() {
        let mut config = OrchestratorConfig::default();
        config.worker.program = "/nonexistent/gpu-worker-binary".into();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut options = ControllerOptions::new(AcceleratorId::new(1), &config);
        options.incarnation = 7;
        options.faults = Some(tx);
        let controller = WorkerController::new(options);

        let err = controller.initialize().await.unwrap_err();
        assert!(matches!(err, WorkerError::ProcessLaunch(_)));
        assert_eq!(controller.state(), WorkerState::Error);
        assert!(controller.get_status().error.is_some());

        let fault = rx.try_recv().unwrap();
        assert_eq!(fault.accelerator, AcceleratorId::new(1));
        assert_eq!(fault.incarnation, 7);

        // Failed controllers are not re-initialized in place.
        assert!(matches!(controller.initialize().await, Err(WorkerError::NotReady(_))));
    }
}
