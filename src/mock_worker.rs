//! Stand-in accelerator worker for tests and local runs.
//!
//! Speaks the same JSON Lines protocol as a real worker (both generations)
//! but fakes all device work. Behaviour can be scripted through the
//! environment:
//!
//! - `MOCK_WORKER_DELAY_MS`: sleep this long before answering `inference`
//! - `MOCK_WORKER_FAIL_OPS`: comma separated operations answered with an error
//! - `MOCK_WORKER_CRASH_ON`: exit with status 101 on this operation
//! - `MOCK_WORKER_HANG_ON`: stop responding (and ignore EOF) on this operation
//! - `MOCK_WORKER_GARBAGE_ON`: answer this operation with a non-JSON line
//! - `MOCK_WORKER_NO_IDS`: omit correlation ids from replies
//! - `MOCK_WORKER_LEGACY_ONLY`: only accept "1.0" envelopes, report no components
//! - `MOCK_WORKER_LOG_LEVEL`: stderr log level (default `info`)
//!
//! Thread design:
//! - Thread 0 (stdin reader): reads lines into a channel
//! - Thread 1 (main loop): handles one command at a time, writes to stdout

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use gpu_orchestrator::config::LoggingConfig;
use gpu_orchestrator::logging::setup_logging;
use gpu_orchestrator::types::{
    Command, EnhancedInferenceResult, Envelope, GeneratedImage, InferencePayload, InitializeAck,
    LegacyInferenceResult, LoadModelAck, MessageKind, ProtocolGeneration, ResponseMetrics,
    ResponsePayload, StageMetrics, StatusReport, WorkerCommand,
};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{json, Value};

/// "mock-image", base64 encoded.
const MOCK_IMAGE: &str = "bW9jay1pbWFnZQ==";
const MEMORY_TOTAL_MB: f64 = 24_576.0;
const MODEL_MEMORY_MB: f64 = 4_096.0;
const COMPONENTS: [&str; 3] = ["structured_requests", "feature_flags", "extended_metrics"];

struct Knobs {
    delay: Duration,
    fail_ops: BTreeSet<String>,
    crash_on: Option<String>,
    hang_on: Option<String>,
    garbage_on: Option<String>,
    no_ids: bool,
    legacy_only: bool,
}

impl Knobs {
    fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let flag = |key: &str| var(key).is_some_and(|v| v != "0" && v != "false");
        Self {
            delay: Duration::from_millis(
                var("MOCK_WORKER_DELAY_MS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            ),
            fail_ops: var("MOCK_WORKER_FAIL_OPS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            crash_on: var("MOCK_WORKER_CRASH_ON"),
            hang_on: var("MOCK_WORKER_HANG_ON"),
            garbage_on: var("MOCK_WORKER_GARBAGE_ON"),
            no_ids: flag("MOCK_WORKER_NO_IDS"),
            legacy_only: flag("MOCK_WORKER_LEGACY_ONLY"),
        }
    }
}

struct MockWorker {
    accelerator_index: u32,
    worker_type: String,
    knobs: Knobs,
    model: Option<String>,
    started: Instant,
    handled: u64,
}

enum Flow {
    Continue,
    Exit,
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let worker_type = args
        .windows(2)
        .find(|pair| pair[0] == "--worker-type")
        .map(|pair| pair[1].clone())
        .unwrap_or_else(|| "diffusion".to_string());
    let accelerator_index = std::env::var("ACCELERATOR_INDEX")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let logging = LoggingConfig {
        level: std::env::var("MOCK_WORKER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        directory: None,
    };
    setup_logging(&logging).map_err(|e| anyhow::anyhow!("logging setup failed: {e}"))?;
    info!(
        "[MOCK] Starting {worker_type} worker on accelerator {accelerator_index} (pid={})",
        std::process::id()
    );

    let (stdin_tx, stdin_rx): (Sender<String>, Receiver<String>) = crossbeam_channel::unbounded();

    // Thread 0: stdin reader
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) if !l.trim().is_empty() => {
                    if stdin_tx.send(l).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        debug!("[MOCK] Stdin reader thread exiting");
    });

    let mut worker = MockWorker {
        accelerator_index,
        worker_type,
        knobs: Knobs::from_env(),
        model: None,
        started: Instant::now(),
        handled: 0,
    };
    let stdout = io::stdout();
    let mut stdout = stdout.lock();

    loop {
        let line = match stdin_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                info!("[MOCK] Stdin closed, shutting down");
                break;
            }
        };
        match worker.handle_line(&line, &mut stdout) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Exit) => {
                info!("[MOCK] Shutdown requested");
                break;
            }
            Err(e) => {
                error!("[MOCK] Failed to write to stdout: {e}");
                break;
            }
        }
    }
    Ok(())
}

impl MockWorker {
    fn handle_line(&mut self, line: &str, out: &mut impl Write) -> io::Result<Flow> {
        let request: Envelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("[MOCK] Failed to parse command: {e}");
                let reply = Envelope {
                    version: ProtocolGeneration::Legacy.version().to_string(),
                    kind: MessageKind::Error,
                    operation: "unknown".to_string(),
                    id: None,
                    payload: to_value(&ResponsePayload::failure(format!("parse error: {e}"))),
                };
                write_envelope(out, &reply)?;
                return Ok(Flow::Continue);
            }
        };
        let operation = request.operation.clone();
        self.handled += 1;
        debug!("[MOCK] <- {operation} id={:?}", request.id);

        if self.knobs.crash_on.as_deref() == Some(operation.as_str()) {
            error!("[MOCK] Crashing on '{operation}'");
            std::process::exit(101);
        }
        if self.knobs.hang_on.as_deref() == Some(operation.as_str()) {
            warn!("[MOCK] Hanging on '{operation}'");
            loop {
                thread::sleep(Duration::from_secs(3600));
            }
        }
        if self.knobs.garbage_on.as_deref() == Some(operation.as_str()) {
            writeln!(out, "RuntimeError: mock worker garbage for {operation}")?;
            out.flush()?;
            return Ok(Flow::Continue);
        }

        let (payload, flow) = if self.knobs.fail_ops.contains(&operation) {
            (
                ResponsePayload::failure(format!("injected failure for '{operation}'")),
                Flow::Continue,
            )
        } else if self.knobs.legacy_only
            && ProtocolGeneration::from_version(&request.version) != Some(ProtocolGeneration::Legacy)
        {
            (
                ResponsePayload::failure(format!(
                    "unsupported protocol version '{}'",
                    request.version
                )),
                Flow::Continue,
            )
        } else {
            match Command::from_envelope(&request) {
                Ok(command) => self.execute(command, &request, out)?,
                Err(e) => (ResponsePayload::failure(e.to_string()), Flow::Continue),
            }
        };

        let mut reply = Envelope::reply_to(&request, &payload);
        if self.knobs.no_ids {
            reply.id = None;
        }
        write_envelope(out, &reply)?;
        Ok(flow)
    }

    fn execute(
        &mut self,
        command: Command,
        request: &Envelope,
        out: &mut impl Write,
    ) -> io::Result<(ResponsePayload, Flow)> {
        let payload = match command.command() {
            WorkerCommand::Initialize(args) => {
                let (capabilities, versions) = if self.knobs.legacy_only {
                    (Vec::new(), vec![ProtocolGeneration::Legacy])
                } else {
                    (
                        COMPONENTS.iter().map(|c| c.to_string()).collect(),
                        vec![ProtocolGeneration::Legacy, ProtocolGeneration::Enhanced],
                    )
                };
                if args.accelerator_index != self.accelerator_index {
                    warn!(
                        "[MOCK] Asked to initialize accelerator {} but was started on {}",
                        args.accelerator_index, self.accelerator_index
                    );
                }
                ResponsePayload::ok(to_value(&InitializeAck {
                    accelerator_index: self.accelerator_index,
                    worker_type: self.worker_type.clone(),
                    capabilities,
                    protocol_versions: versions.iter().map(|g| g.version().to_string()).collect(),
                    device_name: Some(format!("Mock Accelerator {}", self.accelerator_index)),
                    memory_total_mb: Some(MEMORY_TOTAL_MB),
                    pid: Some(std::process::id()),
                }))
            }
            WorkerCommand::LoadModel(args) => {
                let started = Instant::now();
                if !Path::new(&args.model_path).exists() {
                    ResponsePayload::failure(format!("model file not found: {}", args.model_path))
                } else {
                    let model_id = args.model_id.clone().unwrap_or_else(|| {
                        Path::new(&args.model_path)
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_else(|| args.model_path.clone())
                    });
                    info!("[MOCK] Loaded {model_id} ({})", args.model_type);
                    self.model = Some(model_id.clone());
                    ResponsePayload::ok(to_value(&LoadModelAck {
                        model_id: Some(model_id),
                        memory_used_mb: Some(MODEL_MEMORY_MB),
                        load_time_ms: Some(elapsed_ms(started)),
                    }))
                }
            }
            WorkerCommand::UnloadModel => {
                self.model = None;
                ResponsePayload::ok(json!({"unloaded": true}))
            }
            WorkerCommand::Inference(payload) => self.generate(payload, request, out)?,
            WorkerCommand::Status => ResponsePayload::ok(to_value(&StatusReport {
                model_id: self.model.clone(),
                memory_used_mb: Some(self.memory_used()),
                memory_total_mb: Some(MEMORY_TOTAL_MB),
                uptime_s: Some(self.started.elapsed().as_secs_f64()),
                commands_handled: Some(self.handled),
            })),
            WorkerCommand::Health => ResponsePayload::ok(json!({"healthy": true})),
            WorkerCommand::Cleanup => ResponsePayload::ok(json!({"freed_mb": 512.0})),
            WorkerCommand::Shutdown => {
                return Ok((ResponsePayload::ok(json!({})), Flow::Exit));
            }
        };
        Ok((payload, Flow::Continue))
    }

    fn generate(
        &self,
        payload: &InferencePayload,
        request: &Envelope,
        out: &mut impl Write,
    ) -> io::Result<ResponsePayload> {
        let Some(ref model_id) = self.model else {
            return Ok(ResponsePayload::failure("no model loaded"));
        };
        let started = Instant::now();
        if let InferencePayload::Enhanced(_) = payload {
            let mut event = Envelope::event(request, json!({"progress": 0.5}));
            if self.knobs.no_ids {
                event.id = None;
            }
            write_envelope(out, &event)?;
        }
        if !self.knobs.delay.is_zero() {
            thread::sleep(self.knobs.delay);
        }

        let params = payload.parameters();
        let seed = params.seed.unwrap_or(42);
        let duration_ms = elapsed_ms(started);
        let metrics = ResponseMetrics {
            duration_ms: Some(duration_ms),
            memory_used_mb: Some(self.memory_used()),
            ..ResponseMetrics::default()
        };

        let data = match payload {
            InferencePayload::Legacy(_) => to_value(&LegacyInferenceResult {
                images: (0..params.num_images).map(|_| MOCK_IMAGE.to_string()).collect(),
                format: Some(params.output_format),
                seed: Some(seed),
                generation_time: Some(duration_ms / 1000.0),
                memory_mb: Some(self.memory_used()),
            }),
            InferencePayload::Enhanced(enhanced) => {
                let features = &enhanced.features;
                let features_used = BTreeMap::from([
                    ("high_res_fix".to_string(), features.high_res_fix),
                    ("upscale".to_string(), features.upscale_factor.is_some()),
                    ("lora".to_string(), !features.lora.is_empty()),
                    ("safety_checker".to_string(), features.safety_checker),
                ]);
                let scale = features.upscale_factor.unwrap_or(1);
                to_value(&EnhancedInferenceResult {
                    images: (0..params.num_images)
                        .map(|i| GeneratedImage {
                            data: MOCK_IMAGE.to_string(),
                            format: params.output_format,
                            width: Some(params.width * scale),
                            height: Some(params.height * scale),
                            seed: Some(seed + u64::from(i)),
                        })
                        .collect(),
                    metrics: Some(StageMetrics {
                        preprocess_ms: Some(1.0),
                        inference_ms: Some(duration_ms),
                        postprocess_ms: Some(1.0),
                        memory_used_mb: Some(self.memory_used()),
                        peak_memory_mb: Some(self.memory_used() + 512.0),
                    }),
                    features_used,
                    model_id: Some(model_id.clone()),
                })
            }
        };
        Ok(ResponsePayload::ok(data).with_metrics(metrics))
    }

    fn memory_used(&self) -> f64 {
        if self.model.is_some() {
            MODEL_MEMORY_MB
        } else {
            0.0
        }
    }
}

fn write_envelope(out: &mut impl Write, envelope: &Envelope) -> io::Result<()> {
    let line = serde_json::to_string(envelope)?;
    writeln!(out, "{line}")?;
    out.flush()
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
