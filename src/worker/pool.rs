//! Pool of worker controllers, one slot per accelerator.
//!
//! Callers lease a worker with [`WorkerPoolManager::allocate`]; the lease
//! returns the worker to the pool when dropped. A worker that fails is
//! reported over the fault channel and replaced in the background by a
//! fresh controller (a new incarnation), so a failure never blocks the
//! caller that observed it.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use gpu_orchestrator_config::{BackpressurePolicy, OrchestratorConfig};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::controller::{AcceleratorId, ControllerOptions, WorkerController, WorkerFault, WorkerStatus};
use crate::error::WorkerError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// No controller; one is created on first demand.
    Vacant,
    Provisioning,
    Idle,
    Leased,
    Recycling,
}

/// What a caller needs from a worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationRequest {
    /// Must match the pool's worker type when set.
    pub worker_type: Option<String>,
    /// Prefer a worker that already has this model loaded.
    pub model_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SlotStatus {
    pub accelerator_id: String,
    pub slot: SlotState,
    pub incarnation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerStatus>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PoolStatus {
    pub worker_type: String,
    pub capacity: usize,
    pub idle: usize,
    pub leased: usize,
    pub waiting: usize,
    pub workers_started: u64,
    pub workers_recycled: u64,
    pub shut_down: bool,
    pub slots: Vec<SlotStatus>,
}

struct Slot {
    state: SlotState,
    incarnation: u64,
    controller: Option<Arc<WorkerController>>,
}

struct PoolInner {
    config: OrchestratorConfig,
    slots: RwLock<BTreeMap<AcceleratorId, Slot>>,
    available: Notify,
    waiting: AtomicUsize,
    next_incarnation: AtomicU64,
    started: AtomicU64,
    recycled: AtomicU64,
    faults: UnboundedSender<WorkerFault>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct WorkerPoolManager {
    inner: Arc<PoolInner>,
}

impl WorkerPoolManager {
    /// Build the pool over the configured inventory and start the health
    /// and recycling tasks. Must be called inside a Tokio runtime.
    pub async fn start(config: &OrchestratorConfig) -> Result<Self, WorkerError> {
        let inventory = config.pool.inventory();
        Self::with_inventory(config, &inventory).await
    }

    pub async fn with_inventory(
        config: &OrchestratorConfig,
        inventory: &[u32],
    ) -> Result<Self, WorkerError> {
        if inventory.is_empty() {
            return Err(WorkerError::Config("no accelerators to manage".into()));
        }

        let (faults, fault_rx) = mpsc::unbounded_channel();
        let slots = inventory
            .iter()
            .map(|&index| {
                (
                    AcceleratorId::new(index),
                    Slot {
                        state: SlotState::Vacant,
                        incarnation: 0,
                        controller: None,
                    },
                )
            })
            .collect();
        let inner = Arc::new(PoolInner {
            config: config.clone(),
            slots: RwLock::new(slots),
            available: Notify::new(),
            waiting: AtomicUsize::new(0),
            next_incarnation: AtomicU64::new(1),
            started: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
            faults,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(recycle_loop(
            Arc::downgrade(&inner),
            fault_rx,
            inner.shutdown.clone(),
        ));
        tokio::spawn(health_loop(
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
            config.pool.health_check_interval(),
        ));

        info!(
            "[POOL] Managing {} {} worker(s) on {:?}",
            inventory.len(),
            config.pool.worker_type,
            inventory
        );

        let pool = Self { inner };
        if config.pool.prewarm {
            pool.prewarm().await?;
        }
        Ok(pool)
    }

    pub fn capacity(&self) -> usize {
        self.inner.slots().len()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Initialize every vacant slot now. Fails only if no worker came up.
    pub async fn prewarm(&self) -> Result<(), WorkerError> {
        let mut leases = Vec::new();
        let mut last_error = None;
        for _ in 0..self.capacity() {
            match self.inner.try_allocate(&AllocationRequest::default()).await {
                Ok(Some(lease)) => leases.push(lease),
                Ok(None) => break,
                Err(err) => {
                    warn!("[POOL] Prewarm failed: {err}");
                    last_error = Some(err);
                }
            }
        }
        let warmed = leases.len();
        drop(leases);
        info!("[POOL] Prewarmed {warmed} worker(s)");
        match last_error {
            Some(err) if warmed == 0 => Err(err),
            _ => Ok(()),
        }
    }

    /// Lease a healthy worker, provisioning one if a slot is vacant. When
    /// every worker is busy the backpressure policy decides between an
    /// immediate `WorkerUnavailable` and a bounded wait.
    pub async fn allocate(&self, request: &AllocationRequest) -> Result<WorkerLease, WorkerError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(WorkerError::WorkerUnavailable("pool is shut down".into()));
        }
        if let Some(ref wanted) = request.worker_type {
            if *wanted != inner.config.pool.worker_type {
                return Err(WorkerError::WorkerUnavailable(format!(
                    "no workers of type '{wanted}'"
                )));
            }
        }

        let (max_waiters, wait_timeout) = match inner.config.pool.backpressure {
            BackpressurePolicy::FailFast => {
                return match inner.try_allocate(request).await? {
                    Some(lease) => Ok(lease),
                    None => Err(WorkerError::WorkerUnavailable(format!(
                        "all {} worker(s) are busy",
                        self.capacity()
                    ))),
                };
            }
            BackpressurePolicy::Queue {
                max_waiters,
                wait_timeout_ms,
            } => (max_waiters, Duration::from_millis(wait_timeout_ms)),
        };

        let deadline = Instant::now() + wait_timeout;
        let mut ticket: Option<WaitTicket<'_>> = None;
        loop {
            // Register for wakeups before looking, so a release between the
            // look and the wait is not missed.
            let notified = inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = inner.try_allocate(request).await? {
                return Ok(lease);
            }
            if inner.shutdown.is_cancelled() {
                return Err(WorkerError::WorkerUnavailable("pool is shut down".into()));
            }
            if ticket.is_none() {
                ticket = Some(WaitTicket::take(&inner.waiting, max_waiters).ok_or_else(|| {
                    WorkerError::WorkerUnavailable(format!(
                        "wait queue is full ({max_waiters} waiting)"
                    ))
                })?);
                debug!("[POOL] All workers busy, waiting");
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(WorkerError::WorkerUnavailable(format!(
                    "no worker became available within {}ms",
                    wait_timeout.as_millis()
                )));
            }
        }
    }

    /// Replace the controller on `accelerator` if it is still `incarnation`.
    pub async fn recycle(&self, accelerator: AcceleratorId, incarnation: u64, reason: &str) {
        self.inner.recycle(accelerator, incarnation, reason).await;
    }

    /// Probe every initialized worker concurrently. Failed workers are
    /// scheduled for recycling. Returns each probed worker's verdict.
    pub async fn run_health_check(&self) -> Vec<(AcceleratorId, bool)> {
        self.inner.check_health().await
    }

    pub fn is_worker_healthy(&self, accelerator: AcceleratorId) -> bool {
        self.controller(accelerator)
            .is_some_and(|controller| controller.is_healthy())
    }

    pub fn controller(&self, accelerator: AcceleratorId) -> Option<Arc<WorkerController>> {
        self.inner
            .slots()
            .get(&accelerator)
            .and_then(|slot| slot.controller.clone())
    }

    pub fn status(&self) -> PoolStatus {
        let slots = self.inner.slots();
        let count = |state: SlotState| slots.values().filter(|s| s.state == state).count();
        PoolStatus {
            worker_type: self.inner.config.pool.worker_type.clone(),
            capacity: slots.len(),
            idle: count(SlotState::Idle),
            leased: count(SlotState::Leased),
            waiting: self.inner.waiting.load(Ordering::SeqCst),
            workers_started: self.inner.started.load(Ordering::SeqCst),
            workers_recycled: self.inner.recycled.load(Ordering::SeqCst),
            shut_down: self.inner.shutdown.is_cancelled(),
            slots: slots
                .iter()
                .map(|(id, slot)| SlotStatus {
                    accelerator_id: id.to_string(),
                    slot: slot.state,
                    incarnation: slot.incarnation,
                    worker: slot.controller.as_ref().map(|c| c.get_status()),
                })
                .collect(),
        }
    }

    /// Lease every idle worker at once, for pool-wide maintenance.
    pub fn lease_idle(&self) -> Vec<WorkerLease> {
        let mut slots = self.inner.slots_mut();
        slots
            .iter_mut()
            .filter(|(_, slot)| slot.state == SlotState::Idle)
            .filter_map(|(&id, slot)| {
                let controller = slot.controller.clone()?;
                slot.state = SlotState::Leased;
                Some(WorkerLease::new(&self.inner, id, slot.incarnation, controller))
            })
            .collect()
    }

    /// Stop background tasks and dispose every worker. Outstanding leases
    /// stay usable until dropped but their workers are already gone.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        info!("[POOL] Shutting down");

        let controllers: Vec<Arc<WorkerController>> = {
            let mut slots = self.inner.slots_mut();
            slots
                .values_mut()
                .filter_map(|slot| {
                    slot.state = SlotState::Vacant;
                    slot.controller.take()
                })
                .collect()
        };
        join_all(controllers.iter().map(|c| c.dispose())).await;
        self.inner.available.notify_waiters();
        info!("[POOL] Disposed {} worker(s)", controllers.len());
    }
}

impl PoolInner {
    fn slots(&self) -> RwLockReadGuard<'_, BTreeMap<AcceleratorId, Slot>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn slots_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<AcceleratorId, Slot>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_controller(&self, accelerator: AcceleratorId, incarnation: u64) -> Arc<WorkerController> {
        let mut options = ControllerOptions::new(accelerator, &self.config);
        options.incarnation = incarnation;
        options.faults = Some(self.faults.clone());
        self.started.fetch_add(1, Ordering::SeqCst);
        Arc::new(WorkerController::new(options))
    }

    /// One allocation attempt: an idle worker (preferring the requested
    /// model), else a vacant slot to provision, else nothing.
    async fn try_allocate(
        self: &Arc<Self>,
        request: &AllocationRequest,
    ) -> Result<Option<WorkerLease>, WorkerError> {
        let vacancy = {
            let mut slots = self.slots_mut();

            let mut pick: Option<AcceleratorId> = None;
            for (&id, slot) in slots.iter() {
                if slot.state != SlotState::Idle {
                    continue;
                }
                let Some(ref controller) = slot.controller else {
                    continue;
                };
                if !controller.is_healthy() {
                    continue;
                }
                let has_model = request.model_id.is_some()
                    && controller.current_model_id() == request.model_id;
                if has_model {
                    pick = Some(id);
                    break;
                }
                if pick.is_none() {
                    pick = Some(id);
                }
            }

            if let Some(id) = pick {
                if let Some(slot) = slots.get_mut(&id) {
                    if let Some(controller) = slot.controller.clone() {
                        slot.state = SlotState::Leased;
                        debug!("[POOL] Leased {id}");
                        return Ok(Some(WorkerLease::new(self, id, slot.incarnation, controller)));
                    }
                }
            }

            slots
                .iter_mut()
                .find(|(_, slot)| slot.state == SlotState::Vacant)
                .map(|(&id, slot)| {
                    let incarnation = self.next_incarnation.fetch_add(1, Ordering::SeqCst);
                    slot.state = SlotState::Provisioning;
                    slot.incarnation = incarnation;
                    (id, incarnation)
                })
        };

        match vacancy {
            Some((id, incarnation)) => self.provision(id, incarnation).await.map(Some),
            None => Ok(None),
        }
    }

    async fn provision(
        self: &Arc<Self>,
        accelerator: AcceleratorId,
        incarnation: u64,
    ) -> Result<WorkerLease, WorkerError> {
        let mut guard = ProvisionGuard {
            inner: self,
            accelerator,
            incarnation,
            armed: true,
        };
        let controller = self.new_controller(accelerator, incarnation);
        info!("[POOL] Provisioning {accelerator} (incarnation {incarnation})");

        if let Err(err) = controller.initialize().await {
            error!("[POOL] Failed to start worker on {accelerator}: {err}");
            controller.dispose().await;
            return Err(err);
        }

        let claimed = {
            let mut slots = self.slots_mut();
            match slots.get_mut(&accelerator) {
                Some(slot)
                    if slot.incarnation == incarnation && slot.state == SlotState::Provisioning =>
                {
                    slot.controller = Some(controller.clone());
                    slot.state = SlotState::Leased;
                    true
                }
                _ => false,
            }
        };
        guard.armed = false;
        if claimed {
            Ok(WorkerLease::new(self, accelerator, incarnation, controller))
        } else {
            // Shut down while we were starting.
            controller.dispose().await;
            Err(WorkerError::WorkerUnavailable("pool is shut down".into()))
        }
    }

    fn release(&self, accelerator: AcceleratorId, incarnation: u64, controller: &WorkerController) {
        let healthy = controller.is_healthy();
        {
            let mut slots = self.slots_mut();
            let Some(slot) = slots.get_mut(&accelerator) else {
                return;
            };
            if slot.incarnation != incarnation || slot.state != SlotState::Leased {
                return;
            }
            if healthy {
                slot.state = SlotState::Idle;
                debug!("[POOL] Released {accelerator}");
            }
        }
        if !healthy {
            // Duplicates of a fault the controller already sent are ignored.
            let _ = self.faults.send(WorkerFault {
                accelerator,
                incarnation,
                reason: controller
                    .last_error()
                    .unwrap_or_else(|| "worker returned unhealthy".to_string()),
            });
        }
        self.available.notify_waiters();
    }

    async fn recycle(self: &Arc<Self>, accelerator: AcceleratorId, incarnation: u64, reason: &str) {
        let (old, next) = {
            let mut slots = self.slots_mut();
            let Some(slot) = slots.get_mut(&accelerator) else {
                return;
            };
            if slot.incarnation != incarnation
                || !matches!(slot.state, SlotState::Idle | SlotState::Leased)
            {
                debug!("[POOL] Ignoring stale fault for {accelerator} (incarnation {incarnation})");
                return;
            }
            let next = self.next_incarnation.fetch_add(1, Ordering::SeqCst);
            slot.state = SlotState::Recycling;
            slot.incarnation = next;
            (slot.controller.take(), next)
        };
        warn!("[POOL] Recycling {accelerator} (incarnation {incarnation}): {reason}");

        if let Some(old) = old {
            old.dispose().await;
        }
        if self.shutdown.is_cancelled() {
            return;
        }

        let controller = self.new_controller(accelerator, next);
        let started = controller.initialize().await;
        if let Err(ref err) = started {
            error!("[POOL] Replacement worker on {accelerator} failed: {err}");
            controller.dispose().await;
        }

        {
            let mut slots = self.slots_mut();
            if let Some(slot) = slots.get_mut(&accelerator) {
                if slot.incarnation == next && slot.state == SlotState::Recycling {
                    if started.is_ok() {
                        slot.controller = Some(controller);
                        slot.state = SlotState::Idle;
                        self.recycled.fetch_add(1, Ordering::SeqCst);
                        info!("[POOL] {accelerator} recycled (incarnation {next})");
                    } else {
                        // Next allocation retries from scratch.
                        slot.state = SlotState::Vacant;
                    }
                }
            }
        }
        self.available.notify_waiters();
    }

    async fn check_health(&self) -> Vec<(AcceleratorId, bool)> {
        let targets: Vec<(AcceleratorId, u64, Arc<WorkerController>)> = self
            .slots()
            .iter()
            .filter(|(_, slot)| matches!(slot.state, SlotState::Idle | SlotState::Leased))
            .filter_map(|(&id, slot)| {
                slot.controller
                    .clone()
                    .map(|controller| (id, slot.incarnation, controller))
            })
            .collect();

        let probes = targets.iter().map(|(id, incarnation, controller)| async move {
            let result = controller.probe_health().await;
            (*id, *incarnation, result)
        });
        let results = join_all(probes).await;

        let mut verdicts = Vec::with_capacity(results.len());
        for (id, incarnation, result) in results {
            if let Err(err) = result {
                warn!("[POOL] {err}");
                let _ = self.faults.send(WorkerFault {
                    accelerator: id,
                    incarnation,
                    reason: err.to_string(),
                });
                verdicts.push((id, false));
            } else {
                verdicts.push((id, true));
            }
        }
        debug!(
            "[POOL] Health check: {}/{} healthy",
            verdicts.iter().filter(|(_, ok)| *ok).count(),
            verdicts.len()
        );
        verdicts
    }
}

async fn recycle_loop(
    pool: Weak<PoolInner>,
    mut faults: UnboundedReceiver<WorkerFault>,
    shutdown: CancellationToken,
) {
    loop {
        let fault = tokio::select! {
            _ = shutdown.cancelled() => break,
            fault = faults.recv() => fault,
        };
        let Some(fault) = fault else {
            break;
        };
        let Some(inner) = pool.upgrade() else {
            break;
        };
        tokio::spawn(async move {
            inner
                .recycle(fault.accelerator, fault.incarnation, &fault.reason)
                .await;
        });
    }
    debug!("[POOL] Recycler stopped");
}

async fn health_loop(pool: Weak<PoolInner>, shutdown: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = pool.upgrade() else {
            break;
        };
        inner.check_health().await;
    }
    debug!("[POOL] Health monitor stopped");
}

/// Resets a slot claimed for provisioning if the provisioning future is
/// dropped or fails.
struct ProvisionGuard<'a> {
    inner: &'a Arc<PoolInner>,
    accelerator: AcceleratorId,
    incarnation: u64,
    armed: bool,
}

impl Drop for ProvisionGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut slots = self.inner.slots_mut();
            if let Some(slot) = slots.get_mut(&self.accelerator) {
                if slot.incarnation == self.incarnation && slot.state == SlotState::Provisioning {
                    slot.state = SlotState::Vacant;
                    slot.controller = None;
                }
            }
        }
        self.inner.available.notify_waiters();
    }
}

/// A place in the bounded wait queue.
struct WaitTicket<'a>(&'a AtomicUsize);

impl<'a> WaitTicket<'a> {
    fn take(waiting: &'a AtomicUsize, max: usize) -> Option<Self> {
        waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self(waiting))
    }
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive use of one worker. Returned to the pool on drop.
pub struct WorkerLease {
    pool: Weak<PoolInner>,
    accelerator: AcceleratorId,
    incarnation: u64,
    controller: Arc<WorkerController>,
}

impl WorkerLease {
    fn new(
        pool: &Arc<PoolInner>,
        accelerator: AcceleratorId,
        incarnation: u64,
        controller: Arc<WorkerController>,
    ) -> Self {
        Self {
            pool: Arc::downgrade(pool),
            accelerator,
            incarnation,
            controller,
        }
    }

    pub fn accelerator_id(&self) -> AcceleratorId {
        self.accelerator
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn controller(&self) -> &Arc<WorkerController> {
        &self.controller
    }
}

impl Deref for WorkerLease {
    type Target = WorkerController;

    fn deref(&self) -> &WorkerController {
        &self.controller
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.accelerator, self.incarnation, &self.controller);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_ticket_is_bounded_and_released() {
        let waiting = AtomicUsize::new(0);
        let first = WaitTicket::take(&waiting, 2).unwrap();
        let second = WaitTicket::take(&waiting, 2).unwrap();
        assert!(WaitTicket::take(&waiting, 2).is_none());
        assert_eq!(waiting.load(Ordering::SeqCst), 2);

        drop(first);
        let third = WaitTicket::take(&waiting, 2);
        assert!(third.is_some());
        drop(second);
        drop(third);
        assert_eq!(waiting.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_inventory_is_rejected() {
        let result = WorkerPoolManager::with_inventory(&OrchestratorConfig::default(), &[]).await;
        assert!(matches!(result, Err(WorkerError::Config(_))));
    }

    #[tokio::test]
    async fn test_worker_type_mismatch_fails_without_spawning() {
        let pool = WorkerPoolManager::with_inventory(&OrchestratorConfig::default(), &[0])
            .await
            .unwrap();
        let request = AllocationRequest {
            worker_type: Some("upscaler".into()),
            model_id: None,
        };
        let err = pool.allocate(&request).await.err().unwrap();
        assert!(matches!(err, WorkerError::WorkerUnavailable(_)));
        assert_eq!(pool.status().workers_started, 0);

        pool.shutdown().await;
        let err = pool.allocate(&AllocationRequest::default()).await.err().unwrap();
        assert!(matches!(err, WorkerError::WorkerUnavailable(ref m) if m.contains("shut down")));
        assert!(pool.status().shut_down);
    }
}
