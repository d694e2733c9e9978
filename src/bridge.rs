//! Translation between the external inference contract and the worker's
//! wire layouts.
//!
//! The protocol generation is decided once, when the bridge is built, from
//! the capabilities the workers reported. Every request then goes through
//! the same [`ProtocolStrategy`]: shared validation first, then the
//! strategy's own checks and encoding. Requests that fail validation never
//! reach a worker.

use std::collections::BTreeMap;

use chrono::Utc;
use gpu_orchestrator_config::{FallbackPolicy, ProtocolConfig};
use gpu_orchestrator_types::{
    CapabilitySet, EnhancedInference, EnhancedInferenceResult, Envelope, ErrorKind, GeneratedImage,
    InferencePayload, InferenceRequest, InferenceResponse, LegacyInference, LegacyInferenceResult,
    MemoryInfo, ProtocolGeneration, RequestMetadata, ResponseMetrics, TimingInfo, WireResponse,
};
use log::{debug, info, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ProtocolError, ValidationErrors, WorkerError};
use crate::worker::channel::decode_response;
use crate::worker::{AllocationRequest, WorkerPoolManager};

pub const MAX_PROMPT_CHARS: usize = 2000;
pub const MIN_DIMENSION: u32 = 64;
pub const MAX_DIMENSION: u32 = 2048;
pub const DIMENSION_STEP: u32 = 8;
pub const MAX_STEPS: u32 = 150;
pub const MAX_GUIDANCE_SCALE: f32 = 30.0;
pub const MAX_IMAGES: u32 = 8;
pub const MAX_LORA_ADAPTERS: usize = 4;
pub const MAX_LORA_WEIGHT: f32 = 2.0;
pub const UPSCALE_FACTORS: [u32; 2] = [2, 4];

/// One protocol generation's view of inference traffic.
pub trait ProtocolStrategy: Send + Sync {
    fn generation(&self) -> ProtocolGeneration;

    /// Checks on top of the shared parameter validation.
    fn validate(&self, request: &InferenceRequest, errors: &mut ValidationErrors);

    fn encode(&self, request: &InferenceRequest, request_id: &str) -> InferencePayload;

    /// Fill `response` from a successful response's `data`.
    fn decode(
        &self,
        data: &Value,
        metrics: Option<&ResponseMetrics>,
        response: &mut InferenceResponse,
    ) -> Result<(), String>;
}

/// Flat `generate` payloads. Optional features cannot be expressed.
pub struct LegacyProtocol;

impl ProtocolStrategy for LegacyProtocol {
    fn generation(&self) -> ProtocolGeneration {
        ProtocolGeneration::Legacy
    }

    fn validate(&self, request: &InferenceRequest, errors: &mut ValidationErrors) {
        for feature in request.features.requested() {
            errors.push(format!("feature '{feature}' requires the enhanced protocol"));
        }
    }

    fn encode(&self, request: &InferenceRequest, _request_id: &str) -> InferencePayload {
        InferencePayload::Legacy(LegacyInference::new(request.parameters()))
    }

    fn decode(
        &self,
        data: &Value,
        metrics: Option<&ResponseMetrics>,
        response: &mut InferenceResponse,
    ) -> Result<(), String> {
        let result: LegacyInferenceResult =
            serde_json::from_value(data.clone()).map_err(|e| e.to_string())?;
        let format = result.format.unwrap_or_default();
        response.images = result
            .images
            .into_iter()
            .map(|data| GeneratedImage {
                data,
                format,
                width: None,
                height: None,
                seed: result.seed,
            })
            .collect();
        let total_ms = result
            .generation_time
            .map(|seconds| seconds * 1000.0)
            .or_else(|| metrics.and_then(|m| m.duration_ms));
        response.timing = total_ms.map(|total| TimingInfo {
            total_ms: Some(total),
            ..TimingInfo::default()
        });
        let used_mb = result
            .memory_mb
            .or_else(|| metrics.and_then(|m| m.memory_used_mb));
        response.memory = used_mb.map(|used| MemoryInfo {
            used_mb: Some(used),
            peak_mb: metrics.and_then(|m| m.peak_memory_mb),
        });
        Ok(())
    }
}

/// Structured payloads with metadata, feature flags and stage metrics.
pub struct EnhancedProtocol;

impl ProtocolStrategy for EnhancedProtocol {
    fn generation(&self) -> ProtocolGeneration {
        ProtocolGeneration::Enhanced
    }

    fn validate(&self, _request: &InferenceRequest, _errors: &mut ValidationErrors) {}

    fn encode(&self, request: &InferenceRequest, request_id: &str) -> InferencePayload {
        InferencePayload::Enhanced(EnhancedInference {
            request_id: request_id.to_string(),
            parameters: request.parameters(),
            features: request.features.clone(),
            metadata: RequestMetadata {
                submitted_at: Utc::now().to_rfc3339(),
                client: request.client.clone(),
                model_id: request.model_id.clone(),
            },
        })
    }

    fn decode(
        &self,
        data: &Value,
        metrics: Option<&ResponseMetrics>,
        response: &mut InferenceResponse,
    ) -> Result<(), String> {
        let result: EnhancedInferenceResult =
            serde_json::from_value(data.clone()).map_err(|e| e.to_string())?;
        let stages = result.metrics.unwrap_or_default();
        let staged_total = match (stages.preprocess_ms, stages.inference_ms, stages.postprocess_ms) {
            (None, None, None) => None,
            (pre, run, post) => {
                Some(pre.unwrap_or_default() + run.unwrap_or_default() + post.unwrap_or_default())
            }
        };
        response.timing = Some(TimingInfo {
            total_ms: metrics.and_then(|m| m.duration_ms).or(staged_total),
            preprocess_ms: stages.preprocess_ms,
            inference_ms: stages.inference_ms,
            postprocess_ms: stages.postprocess_ms,
        });
        response.memory = Some(MemoryInfo {
            used_mb: stages
                .memory_used_mb
                .or_else(|| metrics.and_then(|m| m.memory_used_mb)),
            peak_mb: stages
                .peak_memory_mb
                .or_else(|| metrics.and_then(|m| m.peak_memory_mb)),
        });
        response.images = result.images;
        response.features_used = result.features_used;
        if result.model_id.is_some() {
            response.model_id = result.model_id;
        }
        Ok(())
    }
}

/// A validated request ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedInference {
    pub request_id: String,
    pub payload: InferencePayload,
}

pub struct ProtocolBridge {
    strategy: Box<dyn ProtocolStrategy>,
}

impl ProtocolBridge {
    pub fn with_strategy(strategy: Box<dyn ProtocolStrategy>) -> Self {
        Self { strategy }
    }

    pub fn legacy() -> Self {
        Self::with_strategy(Box::new(LegacyProtocol))
    }

    pub fn enhanced() -> Self {
        Self::with_strategy(Box::new(EnhancedProtocol))
    }

    /// Pick the generation for this deployment. Enhanced needs the worker
    /// to accept "2.0" envelopes and report every required component;
    /// otherwise the fallback policy decides between legacy and an error.
    pub fn negotiate(
        capabilities: &CapabilitySet,
        config: &ProtocolConfig,
    ) -> Result<Self, WorkerError> {
        if config.preferred == ProtocolGeneration::Legacy {
            info!("[BRIDGE] Using legacy protocol (configured)");
            return Ok(Self::legacy());
        }

        let missing = capabilities.missing(&config.required_components);
        let reason = if !capabilities.supports(ProtocolGeneration::Enhanced) {
            Some("worker does not accept version 2.0 envelopes".to_string())
        } else if !missing.is_empty() {
            Some(format!("worker lacks {}", missing.join(", ")))
        } else {
            None
        };

        match (reason, config.fallback) {
            (None, _) => {
                info!("[BRIDGE] Using enhanced protocol");
                Ok(Self::enhanced())
            }
            (Some(reason), FallbackPolicy::Downgrade) => {
                warn!("[BRIDGE] Enhanced protocol unavailable ({reason}), falling back to legacy");
                Ok(Self::legacy())
            }
            (Some(reason), FallbackPolicy::Strict) => Err(WorkerError::Config(format!(
                "enhanced protocol required but unavailable: {reason}"
            ))),
        }
    }

    pub fn generation(&self) -> ProtocolGeneration {
        self.strategy.generation()
    }

    /// Collect every reason the request cannot be dispatched.
    pub fn validate(&self, request: &InferenceRequest) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();

        if let Some(ref id) = request.request_id {
            if id.trim().is_empty() {
                errors.push("request_id must not be blank");
            }
        }
        if request.prompt.trim().is_empty() {
            errors.push("prompt is required");
        } else if request.prompt.chars().count() > MAX_PROMPT_CHARS {
            errors.push(format!("prompt exceeds {MAX_PROMPT_CHARS} characters"));
        }
        if let Some(ref negative) = request.negative_prompt {
            if negative.chars().count() > MAX_PROMPT_CHARS {
                errors.push(format!("negative_prompt exceeds {MAX_PROMPT_CHARS} characters"));
            }
        }
        for (name, value) in [("width", request.width), ("height", request.height)] {
            if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&value) {
                errors.push(format!(
                    "{name} must be between {MIN_DIMENSION} and {MAX_DIMENSION} (got {value})"
                ));
            } else if value % DIMENSION_STEP != 0 {
                errors.push(format!("{name} must be a multiple of {DIMENSION_STEP} (got {value})"));
            }
        }
        if !(1..=MAX_STEPS).contains(&request.steps) {
            errors.push(format!("steps must be between 1 and {MAX_STEPS} (got {})", request.steps));
        }
        let guidance = request.guidance_scale;
        if !guidance.is_finite() || !(0.0..=MAX_GUIDANCE_SCALE).contains(&guidance) {
            errors.push(format!(
                "guidance_scale must be between 0 and {MAX_GUIDANCE_SCALE} (got {guidance})"
            ));
        }
        if !(1..=MAX_IMAGES).contains(&request.num_images) {
            errors.push(format!(
                "num_images must be between 1 and {MAX_IMAGES} (got {})",
                request.num_images
            ));
        }

        let features = &request.features;
        if let Some(factor) = features.upscale_factor {
            if !UPSCALE_FACTORS.contains(&factor) {
                errors.push(format!("upscale_factor must be 2 or 4 (got {factor})"));
            }
        }
        if features.lora.len() > MAX_LORA_ADAPTERS {
            errors.push(format!("at most {MAX_LORA_ADAPTERS} LoRA adapters are supported"));
        }
        for adapter in &features.lora {
            if adapter.name.trim().is_empty() {
                errors.push("LoRA adapter name is required");
            }
            if !adapter.weight.is_finite() || adapter.weight.abs() > MAX_LORA_WEIGHT {
                errors.push(format!(
                    "LoRA weight for '{}' must be between -{MAX_LORA_WEIGHT} and {MAX_LORA_WEIGHT}",
                    adapter.name
                ));
            }
        }

        self.strategy.validate(request, &mut errors);
        errors.into_result()
    }

    /// Validate and encode `request` in this bridge's layout.
    pub fn prepare(&self, request: &InferenceRequest) -> Result<PreparedInference, WorkerError> {
        self.validate(request)?;
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let payload = self.strategy.encode(request, &request_id);
        Ok(PreparedInference {
            request_id,
            payload,
        })
    }

    /// Map a worker result to the external response shape. Never fails:
    /// errors become unsuccessful responses.
    pub fn interpret(
        &self,
        request_id: &str,
        result: Result<WireResponse, WorkerError>,
    ) -> InferenceResponse {
        let mut response = InferenceResponse {
            request_id: Some(request_id.to_string()),
            protocol: Some(self.generation()),
            ..InferenceResponse::default()
        };

        let wire = match result {
            Ok(wire) => wire,
            Err(err) => return failed(response, &err),
        };
        if !wire.is_success() {
            response.error = Some(wire.error_message());
            response.error_kind = Some(ErrorKind::Operation);
            return response;
        }
        let Some(data) = wire.data() else {
            response.error = Some("worker response carried no data".to_string());
            response.error_kind = Some(ErrorKind::Protocol);
            return response;
        };

        match self.strategy.decode(data, wire.metrics(), &mut response) {
            Ok(()) => response.success = true,
            Err(reason) => {
                debug!("[BRIDGE] Undecodable result for {request_id}: {reason}");
                response = InferenceResponse {
                    request_id: Some(request_id.to_string()),
                    protocol: Some(self.generation()),
                    error: Some(format!("malformed inference result: {reason}")),
                    error_kind: Some(ErrorKind::Protocol),
                    ..InferenceResponse::default()
                };
            }
        }
        response
    }

    /// Like [`Self::interpret`], starting from a raw response line.
    pub fn interpret_line(&self, request_id: &str, line: &str) -> InferenceResponse {
        let decoded = serde_json::from_str::<Envelope>(line.trim())
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
            .and_then(decode_response)
            .map_err(|source| WorkerError::protocol("inference", source));
        self.interpret(request_id, decoded)
    }

    /// Validate, lease a worker, run the request, and shape the result.
    pub async fn execute(
        &self,
        pool: &WorkerPoolManager,
        request: &InferenceRequest,
    ) -> InferenceResponse {
        let prepared = match self.prepare(request) {
            Ok(prepared) => prepared,
            Err(err) => {
                let request_id = request.request_id.clone().unwrap_or_default();
                let response = self.interpret(&request_id, Err(err));
                return InferenceResponse {
                    request_id: request.request_id.clone(),
                    ..response
                };
            }
        };

        let allocation = AllocationRequest {
            worker_type: request.worker_type.clone(),
            model_id: request.model_id.clone(),
        };
        let lease = match pool.allocate(&allocation).await {
            Ok(lease) => lease,
            Err(err) => return self.interpret(&prepared.request_id, Err(err)),
        };
        let accelerator = lease.accelerator_id();
        let loaded_model = lease.current_model_id();

        let result = match (&request.model_id, &loaded_model) {
            (Some(wanted), Some(loaded)) if wanted != loaded => Err(WorkerError::NotReady(format!(
                "model '{wanted}' is not loaded on {accelerator} (has '{loaded}')"
            ))),
            _ => lease.run_inference(prepared.payload).await,
        };
        drop(lease);

        let mut response = self.interpret(&prepared.request_id, result);
        response.accelerator_id = Some(accelerator.to_string());
        if response.model_id.is_none() {
            response.model_id = loaded_model;
        }
        if response.success {
            debug!(
                "[BRIDGE] {} produced {} image(s) on {accelerator}",
                prepared.request_id,
                response.images.len()
            );
        }
        response
    }
}

fn failed(mut response: InferenceResponse, err: &WorkerError) -> InferenceResponse {
    response.error = Some(err.to_string());
    response.error_kind = Some(err.kind());
    if let WorkerError::Validation(ref errors) = err {
        response.validation_errors = errors.reasons().to_vec();
    }
    response
}

/// Features a response reports as applied, for logging.
pub fn applied_features(response: &InferenceResponse) -> Vec<&str> {
    used_features(&response.features_used)
}

fn used_features(features: &BTreeMap<String, bool>) -> Vec<&str> {
    features
        .iter()
        .filter(|(_, used)| **used)
        .map(|(name, _)| name.as_str())
        .collect()
}
