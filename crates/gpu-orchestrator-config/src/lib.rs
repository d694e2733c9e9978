//! Orchestrator configuration.
//!
//! Values come from built-in defaults, an optional JSON file, and then
//! `GPU_ORCH_*` environment overrides, in that order. The result is
//! validated before it is handed to the pool.

pub mod environment_names;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use gpu_orchestrator_types::ProtocolGeneration;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use environment_names as env_names;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// What happens when the pool is at capacity and every worker is busy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Reject immediately with `WorkerUnavailable`.
    FailFast,
    /// Wait for a worker, up to `max_waiters` callers for at most
    /// `wait_timeout_ms` each. Callers beyond the bound are rejected.
    Queue {
        max_waiters: usize,
        wait_timeout_ms: u64,
    },
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self::Queue {
            max_waiters: 32,
            wait_timeout_ms: 30_000,
        }
    }
}

/// Retry policy for idempotent queries (status, health). Inference is
/// never retried.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 200,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Explicit accelerator indices, one worker each.
    pub accelerators: Option<Vec<u32>>,
    /// Pool size when workers are interchangeable.
    pub max_workers: Option<usize>,
    pub worker_type: String,
    pub initialize_timeout_ms: u64,
    pub load_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub health_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub dispose_grace_ms: u64,
    /// Spawn and initialize every worker at startup instead of on demand.
    pub prewarm: bool,
    pub backpressure: BackpressurePolicy,
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            accelerators: None,
            max_workers: None,
            worker_type: "diffusion".to_string(),
            initialize_timeout_ms: 60_000,
            load_timeout_ms: 300_000,
            call_timeout_ms: 120_000,
            health_timeout_ms: 5_000,
            health_check_interval_ms: 30_000,
            dispose_grace_ms: 5_000,
            prewarm: false,
            backpressure: BackpressurePolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl PoolConfig {
    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_millis(self.initialize_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn dispose_grace(&self) -> Duration {
        Duration::from_millis(self.dispose_grace_ms)
    }

    /// Accelerator indices the pool manages, from the process environment.
    pub fn inventory(&self) -> Vec<u32> {
        self.inventory_with(|key| std::env::var(key).ok())
    }

    /// Resolution order: explicit list, `max_workers`, `CUDA_VISIBLE_DEVICES`,
    /// then a single device.
    pub fn inventory_with<F>(&self, lookup: F) -> Vec<u32>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ref list) = self.accelerators {
            return list.clone();
        }
        if let Some(count) = self.max_workers {
            return (0..count as u32).collect();
        }
        if let Some(visible) = lookup(env_names::CUDA_VISIBLE_DEVICES) {
            let entries: Vec<&str> = visible
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            if !entries.is_empty() {
                let parsed: Option<Vec<u32>> = entries.iter().map(|s| s.parse().ok()).collect();
                // UUID style entries cannot be used as indices; number them instead.
                return parsed.unwrap_or_else(|| (0..entries.len() as u32).collect());
            }
        }
        vec![0]
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WorkerLaunchConfig {
    pub program: PathBuf,
    /// Arguments placed before the worker-type flag.
    pub args: Vec<String>,
    pub worker_type_flag: String,
    /// Environment variable carrying the accelerator index.
    pub accelerator_env: String,
    /// Also restrict the worker to its device via `CUDA_VISIBLE_DEVICES`.
    pub pin_visible_devices: bool,
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerLaunchConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("gpu_worker"),
            args: Vec::new(),
            worker_type_flag: "--worker-type".to_string(),
            accelerator_env: "ACCELERATOR_INDEX".to_string(),
            pin_visible_devices: false,
            env: BTreeMap::new(),
        }
    }
}

/// Behaviour when the preferred protocol generation is unavailable.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Use the legacy protocol and log a warning.
    #[default]
    Downgrade,
    /// Refuse to start.
    Strict,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ProtocolConfig {
    pub preferred: ProtocolGeneration,
    pub fallback: FallbackPolicy,
    /// Components a worker must report before the enhanced protocol is used.
    pub required_components: Vec<String>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            preferred: ProtocolGeneration::Enhanced,
            fallback: FallbackPolicy::Downgrade,
            required_components: vec![
                "structured_requests".to_string(),
                "feature_flags".to_string(),
                "extended_metrics".to_string(),
            ],
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Directory for timestamped log files; console only when unset.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

const LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub pool: PoolConfig,
    pub worker: WorkerLaunchConfig,
    pub protocol: ProtocolConfig,
    pub logging: LoggingConfig,
}

impl OrchestratorConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("[CONFIG] Loaded {}", path.display());
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(program) = lookup(env_names::WORKER_PROGRAM) {
            self.worker.program = PathBuf::from(program);
        }
        if let Some(worker_type) = lookup(env_names::WORKER_TYPE) {
            self.pool.worker_type = worker_type;
        }
        if let Some(list) = lookup(env_names::ACCELERATORS) {
            let indices = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<u32>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| invalid(env_names::ACCELERATORS, &list))?;
            self.pool.accelerators = Some(indices);
        }
        if let Some(value) = lookup(env_names::MAX_WORKERS) {
            self.pool.max_workers = Some(parse_number(env_names::MAX_WORKERS, &value)?);
        }
        if let Some(value) = lookup(env_names::CALL_TIMEOUT_MS) {
            self.pool.call_timeout_ms = parse_number(env_names::CALL_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(env_names::HEALTH_CHECK_INTERVAL_MS) {
            self.pool.health_check_interval_ms =
                parse_number(env_names::HEALTH_CHECK_INTERVAL_MS, &value)?;
        }
        if let Some(value) = lookup(env_names::BACKPRESSURE) {
            self.pool.backpressure = match value.as_str() {
                "fail_fast" => BackpressurePolicy::FailFast,
                "queue" => match self.pool.backpressure {
                    BackpressurePolicy::Queue { .. } => self.pool.backpressure.clone(),
                    BackpressurePolicy::FailFast => BackpressurePolicy::default(),
                },
                _ => return Err(invalid(env_names::BACKPRESSURE, &value)),
            };
        }
        if let Some(value) = lookup(env_names::PROTOCOL) {
            self.protocol.preferred = match value.as_str() {
                "legacy" => ProtocolGeneration::Legacy,
                "enhanced" => ProtocolGeneration::Enhanced,
                _ => return Err(invalid(env_names::PROTOCOL, &value)),
            };
        }
        if let Some(value) = lookup(env_names::PROTOCOL_FALLBACK) {
            self.protocol.fallback = match value.as_str() {
                "downgrade" => FallbackPolicy::Downgrade,
                "strict" => FallbackPolicy::Strict,
                _ => return Err(invalid(env_names::PROTOCOL_FALLBACK, &value)),
            };
        }
        if let Some(level) = lookup(env_names::LOG_LEVEL) {
            self.logging.level = level;
        }
        if let Some(dir) = lookup(env_names::LOG_DIR) {
            self.logging.directory = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.pool;
        if pool.worker_type.trim().is_empty() {
            return Err(ConfigError::Invalid("pool.worker_type must not be empty".into()));
        }
        if pool.max_workers == Some(0) {
            return Err(ConfigError::Invalid("pool.max_workers must be at least 1".into()));
        }
        if let Some(ref list) = pool.accelerators {
            if list.is_empty() {
                return Err(ConfigError::Invalid("pool.accelerators must not be empty".into()));
            }
            let unique: BTreeSet<&u32> = list.iter().collect();
            if unique.len() != list.len() {
                return Err(ConfigError::Invalid(
                    "pool.accelerators contains duplicate indices".into(),
                ));
            }
            if pool.max_workers.is_some() {
                warn!("[CONFIG] Both accelerators and max_workers set; using accelerators");
            }
        }
        for (name, value) in [
            ("pool.initialize_timeout_ms", pool.initialize_timeout_ms),
            ("pool.load_timeout_ms", pool.load_timeout_ms),
            ("pool.call_timeout_ms", pool.call_timeout_ms),
            ("pool.health_timeout_ms", pool.health_timeout_ms),
            ("pool.health_check_interval_ms", pool.health_check_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        if pool.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("pool.retry.max_attempts must be at least 1".into()));
        }
        if let BackpressurePolicy::Queue {
            max_waiters,
            wait_timeout_ms,
        } = pool.backpressure
        {
            if max_waiters == 0 || wait_timeout_ms == 0 {
                return Err(ConfigError::Invalid(
                    "queue backpressure needs max_waiters and wait_timeout_ms above 0".into(),
                ));
            }
        }
        if self.worker.program.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("worker.program must not be empty".into()));
        }
        if self.worker.accelerator_env.trim().is_empty() {
            return Err(ConfigError::Invalid("worker.accelerator_env must not be empty".into()));
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(invalid("logging.level", &self.logging.level));
        }
        Ok(())
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pool.retry.max_attempts, 3);
        assert_eq!(config.protocol.preferred, ProtocolGeneration::Enhanced);
        assert_eq!(config.protocol.fallback, FallbackPolicy::Downgrade);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = OrchestratorConfig::from_json_str(
            r#"{"pool": {"max_workers": 2, "backpressure": {"policy": "fail_fast"}}}"#,
        )
        .unwrap();
        assert_eq!(config.pool.max_workers, Some(2));
        assert_eq!(config.pool.backpressure, BackpressurePolicy::FailFast);
        assert_eq!(config.pool.call_timeout_ms, 120_000);
        assert_eq!(config.worker.worker_type_flag, "--worker-type");
    }

    #[test]
    fn test_queue_policy_from_json() {
        let config = OrchestratorConfig::from_json_str(
            r#"{"pool": {"backpressure": {"policy": "queue", "max_waiters": 4, "wait_timeout_ms": 250}}}"#,
        )
        .unwrap();
        assert_eq!(
            config.pool.backpressure,
            BackpressurePolicy::Queue {
                max_waiters: 4,
                wait_timeout_ms: 250
            }
        );
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"pool": {{"worker_type": "upscaler"}}, "logging": {{"level": "debug"}}}}"#)
            .unwrap();
        let config = OrchestratorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pool.worker_type, "upscaler");
        assert_eq!(config.logging.level, "debug");

        let missing = OrchestratorConfig::from_file(Path::new("/nonexistent/orchestrator.json"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = OrchestratorConfig::default();
        config
            .apply_env_overrides(env(&[
                (env_names::ACCELERATORS, "0, 2"),
                (env_names::CALL_TIMEOUT_MS, "1500"),
                (env_names::BACKPRESSURE, "fail_fast"),
                (env_names::PROTOCOL, "legacy"),
                (env_names::PROTOCOL_FALLBACK, "strict"),
            ]))
            .unwrap();
        assert_eq!(config.pool.accelerators, Some(vec![0, 2]));
        assert_eq!(config.pool.call_timeout(), Duration::from_millis(1500));
        assert_eq!(config.pool.backpressure, BackpressurePolicy::FailFast);
        assert_eq!(config.protocol.preferred, ProtocolGeneration::Legacy);
        assert_eq!(config.protocol.fallback, FallbackPolicy::Strict);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = OrchestratorConfig::default();
        let err = config
            .apply_env_overrides(env(&[(env_names::CALL_TIMEOUT_MS, "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == env_names::CALL_TIMEOUT_MS));
    }

    #[test]
    fn test_inventory_resolution_order() {
        let mut pool = PoolConfig::default();
        assert_eq!(pool.inventory_with(env(&[])), vec![0]);
        assert_eq!(
            pool.inventory_with(env(&[(env_names::CUDA_VISIBLE_DEVICES, "1,3")])),
            vec![1, 3]
        );
        assert_eq!(
            pool.inventory_with(env(&[(env_names::CUDA_VISIBLE_DEVICES, "GPU-aa,GPU-bb")])),
            vec![0, 1]
        );

        pool.max_workers = Some(3);
        assert_eq!(pool.inventory_with(env(&[])), vec![0, 1, 2]);

        pool.accelerators = Some(vec![5]);
        assert_eq!(pool.inventory_with(env(&[])), vec![5]);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = OrchestratorConfig::default();
        config.pool.accelerators = Some(vec![1, 1]);
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.pool.call_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.pool.backpressure = BackpressurePolicy::Queue {
            max_waiters: 0,
            wait_timeout_ms: 10,
        };
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }
}
