use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use redecor_contracts::catalog::{normalize, SceneAnalysis};
use redecor_contracts::events::now_utc_iso;
use redecor_contracts::plan::{compile_plan, EditPlan, Preferences};
use redecor_contracts::runs::{write_receipt, JobReceipt};
use redecor_engine::backends::{encode_png, StaticDetector};
use redecor_engine::config::EngineConfig;
use redecor_engine::progress::JsonlProgressSink;
use redecor_engine::scheduler::{JobOutcome, JobWork};
use redecor_engine::storage::{FileStore, ObjectStore};
use redecor_engine::EditService;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "redecor", version, about = "Prompt-driven room photo editing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compile a prompt against saved detections and print the plan.
    Plan(PlanArgs),
    /// Detect, plan and edit one photo through the GPU scheduler.
    Run(RunArgs),
    /// Print the configured queue limits and backends.
    Status,
}

#[derive(Debug, Parser)]
struct PlanArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    detections: PathBuf,
    #[arg(long)]
    room_type: Option<String>,
    #[arg(long = "color")]
    colors: Vec<String>,
    #[arg(long = "material")]
    materials: Vec<String>,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    out: PathBuf,
    /// Replay a saved scene analysis instead of calling the detector.
    #[arg(long)]
    detections: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long = "color")]
    colors: Vec<String>,
    #[arg(long = "material")]
    materials: Vec<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("redecor error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing();
    match cli.command {
        Command::Plan(args) => run_plan(args),
        Command::Run(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start the async runtime")?;
            runtime.block_on(run_edit(args))
        }
        Command::Status => run_status(),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Ignored when a subscriber is already installed.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn preferences(colors: Vec<String>, materials: Vec<String>) -> Option<Preferences> {
    let preferences = Preferences {
        preferred_colors: colors,
        preferred_materials: materials,
    };
    (!preferences.is_empty()).then_some(preferences)
}

fn read_analysis(path: &Path) -> Result<SceneAnalysis> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not a scene analysis", path.display()))
}

fn plan_from_args(args: &PlanArgs) -> Result<EditPlan> {
    let analysis = read_analysis(&args.detections)?;
    let room_type = args
        .room_type
        .clone()
        .unwrap_or_else(|| analysis.room_type.clone());
    let preferences = preferences(args.colors.clone(), args.materials.clone());
    let catalog = normalize(&analysis.objects);
    Ok(compile_plan(
        &args.prompt,
        &catalog,
        &room_type,
        preferences.as_ref(),
    ))
}

fn run_plan(args: PlanArgs) -> Result<i32> {
    let plan = plan_from_args(&args)?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(if plan.is_valid() { 0 } else { 2 })
}

fn status_payload(config: &EngineConfig) -> Value {
    json!({
        "max_concurrent": config.scheduler.max_concurrent,
        "max_queue_depth": config.scheduler.max_queue_depth,
        "completion_grace_ms": config.scheduler.completion_grace.as_millis() as u64,
        "detector": if config.detector_url.is_some() { "http" } else { "none" },
        "inference": if config.inference_url.is_some() { "http" } else { "dryrun" },
        "storage_dir": config.storage_dir.to_string_lossy(),
    })
}

fn run_status() -> Result<i32> {
    let config = EngineConfig::from_env()?;
    println!("{}", serde_json::to_string_pretty(&status_payload(&config))?);
    Ok(0)
}

async fn run_edit(args: RunArgs) -> Result<i32> {
    let config = EngineConfig::from_env()?;
    let image_bytes =
        fs::read(&args.image).with_context(|| format!("failed reading {}", args.image.display()))?;
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed creating {}", args.out.display()))?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let sink = Arc::new(JsonlProgressSink::new(events_path));

    let service = match &args.detections {
        Some(path) => {
            EditService::with_detector(&config, Arc::new(StaticDetector::from_path(path)?), sink)
        }
        None => EditService::from_config(&config, sink),
    };

    let started_at = now_utc_iso();
    let started = Instant::now();
    let target_id = args
        .image
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    let ticket = service
        .submit_job(JobWork::PromptEdit {
            prompt: args.prompt.clone(),
            image_bytes,
            preferences: preferences(args.colors.clone(), args.materials.clone()),
            target_id,
        })
        .await?;
    let job_id = ticket.id.clone();
    info!(job_id = %job_id, "submitted edit job");

    let outcome = ticket.wait().await;
    let status = outcome.status();
    let mut receipt = JobReceipt {
        job_id,
        prompt: args.prompt.clone(),
        room_type: "unknown".to_string(),
        plan: None,
        status: status.to_string(),
        output_url: None,
        started_at,
        finished_at: String::new(),
        processing_seconds: 0.0,
        warnings: Vec::new(),
        error: None,
    };

    let code = match outcome {
        JobOutcome::Completed { image, plan } => {
            let png = encode_png(&image)?;
            let store = FileStore::new(&config.storage_dir);
            let url = store.store(&png, "image/png").await?;
            let output_path = args.out.join("edited.png");
            fs::write(&output_path, &png)
                .with_context(|| format!("failed writing {}", output_path.display()))?;
            println!("{}", output_path.display());

            receipt.room_type = plan.room_type.clone();
            receipt.warnings = plan.validation.warnings.clone();
            receipt.plan = Some(plan);
            receipt.output_url = Some(url);
            0
        }
        JobOutcome::Failed(message) => {
            eprintln!("edit failed: {message}");
            receipt.error = Some(message);
            1
        }
        JobOutcome::Cancelled => {
            eprintln!("edit was cancelled");
            1
        }
    };

    receipt.finished_at = now_utc_iso();
    receipt.processing_seconds = started.elapsed().as_secs_f64();
    write_receipt(&args.out.join("receipt.json"), &receipt)?;
    service.shutdown();
    Ok(code)
}
