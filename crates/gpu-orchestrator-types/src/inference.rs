//! Inference request/response shapes: the external contract callers use,
//! and the two wire layouts the worker understands.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::envelope::ProtocolGeneration;

fn default_dimension() -> u32 {
    512
}

fn default_steps() -> u32 {
    30
}

fn default_guidance_scale() -> f32 {
    7.5
}

fn default_num_images() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

/// A LoRA adapter to apply on top of the loaded model.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoraAdapter {
    pub name: String,
    pub weight: f32,
}

/// Optional pipeline features. Only the enhanced protocol can carry them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FeatureFlags {
    #[serde(default)]
    pub high_res_fix: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upscale_factor: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lora: Vec<LoraAdapter>,
    #[serde(default = "default_true")]
    pub safety_checker: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            high_res_fix: false,
            upscale_factor: None,
            lora: Vec::new(),
            safety_checker: true,
        }
    }
}

impl FeatureFlags {
    /// Names of the features that differ from the plain pipeline.
    pub fn requested(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.high_res_fix {
            names.push("high_res_fix");
        }
        if self.upscale_factor.is_some() {
            names.push("upscale");
        }
        if !self.lora.is_empty() {
            names.push("lora");
        }
        if !self.safety_checker {
            names.push("safety_checker_disabled");
        }
        names
    }
}

/// Inference request as issued by an external caller.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    /// Prefer a worker that already has this model loaded.
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub worker_type: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f32,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_num_images")]
    pub num_images: u32,
    #[serde(default)]
    pub scheduler: Option<String>,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub client: Option<String>,
}

impl InferenceRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            request_id: None,
            model_id: None,
            worker_type: None,
            prompt: prompt.into(),
            negative_prompt: None,
            width: default_dimension(),
            height: default_dimension(),
            steps: default_steps(),
            guidance_scale: default_guidance_scale(),
            seed: None,
            num_images: default_num_images(),
            scheduler: None,
            output_format: OutputFormat::default(),
            features: FeatureFlags::default(),
            client: None,
        }
    }

    /// The generation knobs shared by both wire layouts.
    pub fn parameters(&self) -> GenerationParameters {
        GenerationParameters {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            width: self.width,
            height: self.height,
            steps: self.steps,
            guidance_scale: self.guidance_scale,
            seed: self.seed,
            num_images: self.num_images,
            scheduler: self.scheduler.clone(),
            output_format: self.output_format,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GenerationParameters {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub num_images: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    #[serde(default)]
    pub output_format: OutputFormat,
}

/// Legacy layout: every parameter at the top level next to an `action`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LegacyInference {
    pub action: String,
    #[serde(flatten)]
    pub parameters: GenerationParameters,
}

impl LegacyInference {
    pub const ACTION: &'static str = "generate";

    pub fn new(parameters: GenerationParameters) -> Self {
        Self {
            action: Self::ACTION.to_string(),
            parameters,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestMetadata {
    /// RFC 3339 timestamp set by the orchestrator.
    pub submitted_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

/// Enhanced layout: parameters, features and metadata as nested objects.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EnhancedInference {
    pub request_id: String,
    pub parameters: GenerationParameters,
    #[serde(default)]
    pub features: FeatureFlags,
    pub metadata: RequestMetadata,
}

/// Inference payload in one of the two wire layouts.
#[derive(Debug, Clone, PartialEq)]
pub enum InferencePayload {
    Legacy(LegacyInference),
    Enhanced(EnhancedInference),
}

impl InferencePayload {
    pub fn generation(&self) -> ProtocolGeneration {
        match self {
            Self::Legacy(_) => ProtocolGeneration::Legacy,
            Self::Enhanced(_) => ProtocolGeneration::Enhanced,
        }
    }

    pub fn parameters(&self) -> &GenerationParameters {
        match self {
            Self::Legacy(legacy) => &legacy.parameters,
            Self::Enhanced(enhanced) => &enhanced.parameters,
        }
    }
}

/// Image as returned by the worker and forwarded to callers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    /// Base64 encoded image bytes.
    pub data: String,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// `data` of a legacy inference response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LegacyInferenceResult {
    /// Base64 encoded images.
    pub images: Vec<String>,
    #[serde(default)]
    pub format: Option<OutputFormat>,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Seconds.
    #[serde(default)]
    pub generation_time: Option<f64>,
    #[serde(default)]
    pub memory_mb: Option<f64>,
}

/// Per-stage timings and memory reported by an enhanced worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct StageMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocess_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postprocess_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_memory_mb: Option<f64>,
}

/// `data` of an enhanced inference response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EnhancedInferenceResult {
    pub images: Vec<GeneratedImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StageMetrics>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features_used: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct TimingInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocess_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postprocess_ms: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct MemoryInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_mb: Option<f64>,
}

/// Inference response as returned to an external caller.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct InferenceResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<GeneratedImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<TimingInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryInfo>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features_used: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<ProtocolGeneration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<crate::api::ErrorKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,
}
