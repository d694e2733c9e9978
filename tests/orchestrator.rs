//! End-to-end requests through the orchestrator and the mock worker.

mod common;

use common::{mock_config, with_knob, ModelFile};
use gpu_orchestrator::bridge::applied_features;
use gpu_orchestrator::config::FallbackPolicy;
use gpu_orchestrator::types::{ErrorKind, InferenceRequest, ProtocolGeneration};
use gpu_orchestrator::{Orchestrator, WorkerError};

#[tokio::test]
async fn test_enhanced_round_trip() {
    let orchestrator = Orchestrator::start(mock_config(1)).await.unwrap();
    assert_eq!(orchestrator.bridge().generation(), ProtocolGeneration::Enhanced);

    let model = ModelFile::new("dreamshaper");
    let loaded = orchestrator.load_model(&model.path(), "sd15", None).await;
    assert!(loaded.success, "{:?}", loaded.error);
    assert_eq!(loaded.data.unwrap().model_id, "dreamshaper");

    let mut request = InferenceRequest::new("a red fox in fresh snow");
    request.request_id = Some("req-1".into());
    request.model_id = Some("dreamshaper".into());
    request.num_images = 2;
    request.seed = Some(7);
    request.features.upscale_factor = Some(2);
    let response = orchestrator.run_inference(&request).await;

    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.request_id.as_deref(), Some("req-1"));
    assert_eq!(response.protocol, Some(ProtocolGeneration::Enhanced));
    assert_eq!(response.accelerator_id.as_deref(), Some("accel-0"));
    assert_eq!(response.model_id.as_deref(), Some("dreamshaper"));
    assert_eq!(response.images.len(), 2);
    assert_eq!(response.images[0].width, Some(1024));
    assert_eq!(response.images[1].seed, Some(8));
    assert!(applied_features(&response).contains(&"upscale"));
    assert!(response.timing.as_ref().and_then(|t| t.inference_ms).is_some());

    let status = orchestrator.status().data.unwrap();
    assert_eq!(status.idle, 1);
    let worker = status.slots[0].worker.as_ref().unwrap();
    assert!(worker.has_model_loaded);
    assert_eq!(worker.active_sessions, 0);

    let cleanup = orchestrator.cleanup().await.data.unwrap();
    assert_eq!(cleanup.get("accel-0"), Some(&true));

    assert_eq!(orchestrator.unload_model("other").await.data, Some(false));
    assert_eq!(orchestrator.unload_model("dreamshaper").await.data, Some(true));
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_legacy_worker_downgrades() {
    let config = with_knob(mock_config(1), "MOCK_WORKER_LEGACY_ONLY", "1");
    let orchestrator = Orchestrator::start(config).await.unwrap();
    assert_eq!(orchestrator.bridge().generation(), ProtocolGeneration::Legacy);

    let model = ModelFile::new("classic");
    assert!(orchestrator.load_model(&model.path(), "sd15", None).await.success);

    let response = orchestrator
        .run_inference(&InferenceRequest::new("an old stone bridge"))
        .await;
    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.protocol, Some(ProtocolGeneration::Legacy));
    assert_eq!(response.images.len(), 1);
    assert!(response.features_used.is_empty());

    let mut fancy = InferenceRequest::new("an old stone bridge");
    fancy.features.high_res_fix = true;
    let rejected = orchestrator.run_inference(&fancy).await;
    assert!(!rejected.success);
    assert_eq!(rejected.error_kind, Some(ErrorKind::Validation));
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_strict_fallback_refuses_legacy_worker() {
    let mut config = with_knob(mock_config(1), "MOCK_WORKER_LEGACY_ONLY", "1");
    config.protocol.fallback = FallbackPolicy::Strict;
    let err = Orchestrator::start(config).await.err().unwrap();
    assert!(matches!(err, WorkerError::Config(ref m) if m.contains("2.0")));
}

#[tokio::test]
async fn test_invalid_request_never_reaches_a_worker() {
    let mut config = mock_config(1);
    config.protocol.preferred = ProtocolGeneration::Legacy;
    let orchestrator = Orchestrator::start(config).await.unwrap();

    let mut request = InferenceRequest::new("   ");
    request.width = 100;
    request.request_id = Some("bad-1".into());
    let response = orchestrator.run_inference(&request).await;

    assert!(!response.success);
    assert_eq!(response.request_id.as_deref(), Some("bad-1"));
    assert_eq!(response.error_kind, Some(ErrorKind::Validation));
    assert!(response.validation_errors.len() >= 2);
    assert_eq!(orchestrator.status().data.unwrap().workers_started, 0);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_inference_needs_the_requested_model() {
    let orchestrator = Orchestrator::start(mock_config(1)).await.unwrap();

    let response = orchestrator
        .run_inference(&InferenceRequest::new("empty handed"))
        .await;
    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::InvalidState));

    let model = ModelFile::new("alpha");
    assert!(orchestrator.load_model(&model.path(), "sd15", None).await.success);
    let mut request = InferenceRequest::new("wrong model");
    request.model_id = Some("beta".into());
    let response = orchestrator.run_inference(&request).await;
    assert!(!response.success);
    assert!(response.error.unwrap().contains("not loaded"));

    // Neither failure costs the worker.
    let status = orchestrator.initialize_worker().await;
    assert!(status.success);
    assert!(status.data.unwrap().error.is_none());
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_worker_failure_is_reported_not_raised() {
    let config = with_knob(mock_config(1), "MOCK_WORKER_FAIL_OPS", "inference");
    let orchestrator = Orchestrator::start(config).await.unwrap();
    let model = ModelFile::new("grumpy");
    assert!(orchestrator.load_model(&model.path(), "sd15", None).await.success);

    let response = orchestrator
        .run_inference(&InferenceRequest::new("anything"))
        .await;
    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::Operation));
    assert!(response.error.unwrap().contains("injected failure"));
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_unload_unknown_model_starts_no_worker() {
    let mut config = mock_config(2);
    config.protocol.preferred = ProtocolGeneration::Legacy;
    let orchestrator = Orchestrator::start(config).await.unwrap();

    assert_eq!(orchestrator.unload_model("ghost").await.data, Some(false));
    assert_eq!(orchestrator.status().data.unwrap().workers_started, 0);

    orchestrator.shutdown().await;
    let response = orchestrator.unload_model("ghost").await;
    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::WorkerUnavailable));
}
