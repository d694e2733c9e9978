//! Command line front end: start a pool, run work against it, print JSON.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use gpu_orchestrator::bridge::applied_features;
use gpu_orchestrator::config::OrchestratorConfig;
use gpu_orchestrator::logging::setup_logging;
use gpu_orchestrator::types::InferenceRequest;
use gpu_orchestrator::Orchestrator;
use log::{info, warn};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "gpu_orchestrator", version, about = "Run inference on a pool of accelerator workers")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Worker program, overriding the configuration
    #[arg(long, global = true)]
    worker: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration
    Config,
    /// Start a worker and print pool status
    Status,
    /// Load a model and run one inference request
    Infer(InferArgs),
    /// Start a worker, ask it to free cached memory, and print the outcome
    Cleanup,
}

#[derive(Args)]
struct InferArgs {
    /// Model file to load
    #[arg(long)]
    model: PathBuf,

    #[arg(long, default_value = "sd15")]
    model_type: String,

    #[arg(long)]
    model_id: Option<String>,

    /// Prompt text, required unless --request is given
    #[arg(long)]
    prompt: Option<String>,

    /// Full inference request as a JSON file
    #[arg(long)]
    request: Option<PathBuf>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    #[arg(long)]
    steps: Option<u32>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    num_images: Option<u32>,
}

impl InferArgs {
    fn build_request(&self) -> Result<InferenceRequest> {
        let mut request = match (&self.request, &self.prompt) {
            (Some(path), _) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            (None, Some(prompt)) => InferenceRequest::new(prompt.clone()),
            (None, None) => bail!("either --prompt or --request is required"),
        };
        if let Some(width) = self.width {
            request.width = width;
        }
        if let Some(height) = self.height {
            request.height = height;
        }
        if let Some(steps) = self.steps {
            request.steps = steps;
        }
        if let Some(seed) = self.seed {
            request.seed = Some(seed);
        }
        if let Some(num_images) = self.num_images {
            request.num_images = num_images;
        }
        request.client.get_or_insert_with(|| "cli".to_string());
        Ok(request)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = OrchestratorConfig::load(cli.config.as_deref())?;
    if let Some(worker) = cli.worker {
        config.worker.program = worker;
    }

    if let Err(e) = setup_logging(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
    }
    info!("[MAIN] gpu_orchestrator {}", env!("CARGO_PKG_VERSION"));

    if let Commands::Config = cli.command {
        return print_json(&config);
    }

    let orchestrator = Orchestrator::start(config).await?;
    let outcome = run(&orchestrator, &cli.command).await;
    orchestrator.shutdown().await;
    outcome
}

async fn run(orchestrator: &Orchestrator, command: &Commands) -> Result<()> {
    match command {
        Commands::Config => Ok(()),
        Commands::Status => {
            let worker = orchestrator.initialize_worker().await;
            if let Some(ref error) = worker.error {
                warn!("[MAIN] Worker did not start: {error}");
            }
            print_json(&orchestrator.status())
        }
        Commands::Cleanup => {
            let initialized = orchestrator.initialize_worker().await;
            if !initialized.success {
                bail!("no worker available: {}", initialized.error.unwrap_or_default());
            }
            print_json(&orchestrator.cleanup().await)
        }
        Commands::Infer(args) => {
            let mut request = args.build_request()?;
            let model_path = args.model.to_string_lossy();
            let loaded = orchestrator
                .load_model(&model_path, &args.model_type, args.model_id.as_deref())
                .await;
            let Some(model) = loaded.data else {
                bail!("model load failed: {}", loaded.error.unwrap_or_default());
            };
            request.model_id = Some(model.model_id);

            let response = orchestrator.run_inference(&request).await;
            print_json(&response)?;
            if !response.success {
                bail!("inference failed: {}", response.error.unwrap_or_default());
            }
            info!(
                "[MAIN] {} image(s), features: {:?}",
                response.images.len(),
                applied_features(&response)
            );
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
