//! Pool allocation, backpressure and recycling against the mock worker.

mod common;

use std::time::Duration;

use common::{eventually, mock_config, with_knob, ModelFile};
use gpu_orchestrator::bridge::ProtocolBridge;
use gpu_orchestrator::config::BackpressurePolicy;
use gpu_orchestrator::types::InferenceRequest;
use gpu_orchestrator::worker::SlotState;
use gpu_orchestrator::{AcceleratorId, AllocationRequest, WorkerError, WorkerPoolManager, WorkerState};

const SETTLE: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_fail_fast_when_all_busy() {
    let pool = WorkerPoolManager::start(&mock_config(1)).await.unwrap();
    assert_eq!(pool.status().workers_started, 0);

    let lease = pool.allocate(&AllocationRequest::default()).await.unwrap();
    assert_eq!(lease.accelerator_id(), AcceleratorId::new(0));
    assert_eq!(lease.state(), WorkerState::Ready);
    let incarnation = lease.incarnation();
    assert_eq!(pool.status().leased, 1);

    let err = pool.allocate(&AllocationRequest::default()).await.err().unwrap();
    assert!(matches!(err, WorkerError::WorkerUnavailable(ref m) if m.contains("busy")));

    drop(lease);
    assert_eq!(pool.status().idle, 1);
    let again = pool.allocate(&AllocationRequest::default()).await.unwrap();
    assert_eq!(again.incarnation(), incarnation);
    assert_eq!(pool.status().workers_started, 1);
    drop(again);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_queued_caller_gets_released_worker() {
    let mut config = mock_config(1);
    config.pool.backpressure = BackpressurePolicy::Queue {
        max_waiters: 1,
        wait_timeout_ms: 5_000,
    };
    let pool = WorkerPoolManager::start(&config).await.unwrap();
    let lease = pool.allocate(&AllocationRequest::default()).await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.allocate(&AllocationRequest::default())
                .await
                .map(|lease| lease.accelerator_id())
        })
    };
    assert!(eventually(SETTLE, || pool.status().waiting == 1).await);

    let err = pool.allocate(&AllocationRequest::default()).await.err().unwrap();
    assert!(matches!(err, WorkerError::WorkerUnavailable(ref m) if m.contains("queue is full")));

    drop(lease);
    let got = waiter.await.unwrap().unwrap();
    assert_eq!(got, AcceleratorId::new(0));
    assert_eq!(pool.status().waiting, 0);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_queue_wait_times_out() {
    let mut config = mock_config(1);
    config.pool.backpressure = BackpressurePolicy::Queue {
        max_waiters: 4,
        wait_timeout_ms: 200,
    };
    let pool = WorkerPoolManager::start(&config).await.unwrap();
    let _lease = pool.allocate(&AllocationRequest::default()).await.unwrap();

    let err = pool.allocate(&AllocationRequest::default()).await.err().unwrap();
    assert!(matches!(err, WorkerError::WorkerUnavailable(ref m) if m.contains("within 200ms")));
    assert_eq!(pool.status().waiting, 0);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_prewarm_and_model_preference() {
    let mut config = mock_config(2);
    config.pool.prewarm = true;
    let pool = WorkerPoolManager::start(&config).await.unwrap();
    let status = pool.status();
    assert_eq!(status.capacity, 2);
    assert_eq!(status.idle, 2);
    assert_eq!(status.workers_started, 2);

    let alpha = ModelFile::new("alpha");
    let beta = ModelFile::new("beta");
    let first = pool.allocate(&AllocationRequest::default()).await.unwrap();
    let second = pool.allocate(&AllocationRequest::default()).await.unwrap();
    first.load_model(&alpha.path(), "sd15", None).await.unwrap();
    second.load_model(&beta.path(), "sdxl", None).await.unwrap();
    let beta_home = second.accelerator_id();
    drop(first);
    drop(second);

    let request = AllocationRequest {
        worker_type: None,
        model_id: Some("beta".into()),
    };
    let lease = pool.allocate(&request).await.unwrap();
    assert_eq!(lease.accelerator_id(), beta_home);
    assert_eq!(lease.current_model_id().as_deref(), Some("beta"));
    drop(lease);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_crashed_worker_is_replaced() {
    let config = with_knob(mock_config(1), "MOCK_WORKER_CRASH_ON", "inference");
    let pool = WorkerPoolManager::start(&config).await.unwrap();
    let model = ModelFile::new("fragile");

    let lease = pool.allocate(&AllocationRequest::default()).await.unwrap();
    let old_incarnation = lease.incarnation();
    lease.load_model(&model.path(), "sd15", None).await.unwrap();
    let payload = ProtocolBridge::enhanced()
        .prepare(&InferenceRequest::new("storm over the sea"))
        .unwrap()
        .payload;
    let err = lease.run_inference(payload).await.unwrap_err();
    assert!(err.leaves_worker_suspect());
    // The recycler may already be tearing it down.
    assert!(matches!(lease.state(), WorkerState::Error | WorkerState::Disposed));
    // Unhealthy from the crash until the replacement is in place.
    assert!(!pool.is_worker_healthy(AcceleratorId::new(0)));
    drop(lease);

    assert!(eventually(SETTLE, || pool.status().workers_recycled == 1).await);
    assert!(pool.is_worker_healthy(AcceleratorId::new(0)));
    let slot = &pool.status().slots[0];
    assert_eq!(slot.slot, SlotState::Idle);
    assert_ne!(slot.incarnation, old_incarnation);

    let lease = pool.allocate(&AllocationRequest::default()).await.unwrap();
    assert_ne!(lease.incarnation(), old_incarnation);
    assert_eq!(lease.state(), WorkerState::Ready);
    assert!(!lease.has_model_loaded());
    assert_eq!(pool.status().workers_started, 2);
    drop(lease);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_health_check_verdicts() {
    let pool = WorkerPoolManager::start(&mock_config(1)).await.unwrap();
    // Nothing started yet, nothing to probe.
    assert!(pool.run_health_check().await.is_empty());

    drop(pool.allocate(&AllocationRequest::default()).await.unwrap());
    let verdicts = pool.run_health_check().await;
    assert_eq!(verdicts, vec![(AcceleratorId::new(0), true)]);
    assert!(pool.is_worker_healthy(AcceleratorId::new(0)));
    assert!(!pool.is_worker_healthy(AcceleratorId::new(7)));
    pool.shutdown().await;
}

#[tokio::test]
async fn test_periodic_health_check_recycles_unhealthy_worker() {
    let mut config = with_knob(mock_config(1), "MOCK_WORKER_FAIL_OPS", "health");
    config.pool.health_check_interval_ms = 200;
    let pool = WorkerPoolManager::start(&config).await.unwrap();

    let lease = pool.allocate(&AllocationRequest::default()).await.unwrap();
    let first = lease.incarnation();
    drop(lease);

    assert!(eventually(SETTLE, || pool.status().workers_recycled >= 1).await);
    let status = pool.status();
    assert_ne!(status.slots[0].incarnation, first);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_disposes_workers() {
    let pool = WorkerPoolManager::start(&mock_config(2)).await.unwrap();
    let lease = pool.allocate(&AllocationRequest::default()).await.unwrap();
    let controller = lease.controller().clone();
    drop(lease);

    pool.shutdown().await;
    assert_eq!(controller.state(), WorkerState::Disposed);
    let status = pool.status();
    assert!(status.shut_down);
    assert!(status.slots.iter().all(|s| s.slot == SlotState::Vacant && s.worker.is_none()));

    let err = pool.allocate(&AllocationRequest::default()).await.err().unwrap();
    assert!(matches!(err, WorkerError::WorkerUnavailable(_)));
    // Idempotent.
    pool.shutdown().await;
}

#[tokio::test]
async fn test_busy_worker_gets_liveness_probe_only() {
    let config = with_knob(mock_config(1), "MOCK_WORKER_DELAY_MS", "500");
    let pool = WorkerPoolManager::start(&config).await.unwrap();
    let model = ModelFile::new("steady");
    let lease = pool.allocate(&AllocationRequest::default()).await.unwrap();
    lease.load_model(&model.path(), "sd15", None).await.unwrap();
    let sent_before = lease.commands_sent();

    let payload = ProtocolBridge::enhanced()
        .prepare(&InferenceRequest::new("long exposure"))
        .unwrap()
        .payload;
    let (result, verdicts) = tokio::join!(lease.run_inference(payload), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let running = lease.active_sessions();
        (running, pool.run_health_check().await)
    });

    assert!(result.unwrap().is_success());
    let (running, verdicts) = verdicts;
    assert_eq!(running, 1);
    assert_eq!(verdicts, vec![(AcceleratorId::new(0), true)]);
    // Only the inference itself went over the wire.
    assert_eq!(lease.commands_sent(), sent_before + 1);
    drop(lease);
    pool.shutdown().await;
}
