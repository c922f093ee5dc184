use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use matrixeval::{
    config::OrchestratorConfig,
    evaluator::FfmpegQualityEvaluator,
    executor::{EncodeExecutor, HttpEncodeExecutor, LocalEncodeExecutor},
    notify::WebhookNotifier,
    orchestrator::Orchestrator,
    task::{EncoderFamily, NvencCodec, TaskConfig, TaskStatus},
};

/// Encoder parameter matrix evaluation orchestrator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a matrix task and drain the queue until it finishes
    Run(RunArgs),
    /// List the persisted task history, newest first
    History,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Source video to encode from
    #[arg(short, long)]
    source: PathBuf,

    /// Encode backend address ("host:port"), or "local" for in-process ffmpeg
    #[arg(short, long)]
    target: String,

    #[arg(long, value_enum)]
    encoder: Option<EncoderArg>,

    #[arg(long, value_enum)]
    nvenc_codec: Option<NvencCodecArg>,

    /// Comma-delimited preset list, e.g. "p4,p5,p6"
    #[arg(long, default_value = "")]
    presets: String,

    /// Comma-delimited bitrate list, e.g. "4000k,8M"
    #[arg(long, default_value = "")]
    bitrates: String,

    #[arg(long, default_value = "")]
    maxrates: String,

    #[arg(long, default_value = "")]
    bufsizes: String,

    /// Rate-control mode ("vbr", "cbr", "constqp", ...)
    #[arg(long, default_value = "")]
    rc_mode: String,

    #[arg(long, default_value = "")]
    cq_values: String,

    #[arg(long, default_value = "")]
    qp_values: String,

    #[arg(long, default_value = "")]
    lookaheads: String,

    #[arg(long, default_value = "")]
    minrate: String,

    #[arg(long)]
    temporal_aq: bool,

    #[arg(long)]
    spatial_aq: bool,

    #[arg(long, default_value = "")]
    profile: String,

    #[arg(long, default_value = "")]
    tune: String,

    #[arg(long, default_value = "")]
    multipass: String,

    /// Evaluation batch size; 0 uses the configured default
    #[arg(long, default_value_t = 0)]
    eval_concurrency: usize,

    /// Webhook URL for the best-effort completion notification
    #[arg(long)]
    webhook_url: Option<String>,

    /// Source duration in seconds, used for the speed sub-score
    #[arg(long)]
    input_duration: Option<f64>,

    /// Skip the VMAF metric and evaluate with PSNR/SSIM only
    #[arg(long)]
    skip_vmaf: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum EncoderArg {
    X264,
    X265,
    Nvenc,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum NvencCodecArg {
    H264,
    Hevc,
}

impl From<EncoderArg> for EncoderFamily {
    fn from(value: EncoderArg) -> Self {
        match value {
            EncoderArg::X264 => EncoderFamily::X264,
            EncoderArg::X265 => EncoderFamily::X265,
            EncoderArg::Nvenc => EncoderFamily::Nvenc,
        }
    }
}

impl From<NvencCodecArg> for NvencCodec {
    fn from(value: NvencCodecArg) -> Self {
        match value {
            NvencCodecArg::H264 => NvencCodec::H264,
            NvencCodecArg::Hevc => NvencCodec::Hevc,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger - use RUST_LOG env var or default to info level
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .init();

    let args = Args::parse();

    let cfg = OrchestratorConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    info!("Matrix evaluation orchestrator starting");
    info!("  State file: {}", cfg.state_file.display());
    info!("  Output dir: {}", cfg.output_dir.display());
    info!("  Task retention: {}", cfg.task_retention);
    info!("  Lock timeout: {}s", cfg.lock_timeout_secs);

    match args.command {
        Command::Run(run) => run_task(cfg, run).await,
        Command::History => show_history(cfg).await,
    }
}

async fn run_task(cfg: OrchestratorConfig, run: RunArgs) -> Result<()> {
    let executor: Arc<dyn EncodeExecutor> = if run.target == "local" {
        Arc::new(LocalEncodeExecutor::new(cfg.output_dir.clone(), cfg.public_base_url.clone()))
    } else {
        Arc::new(HttpEncodeExecutor::new(cfg.output_dir.clone()))
    };
    let evaluator = Arc::new(FfmpegQualityEvaluator::new(
        cfg.ffmpeg_bin.clone(),
        cfg.ffprobe_bin.clone(),
        cfg.output_dir.join("metrics"),
    ));
    let notifier = Arc::new(WebhookNotifier::new());

    let orchestrator = Orchestrator::new(cfg, executor, evaluator, notifier)?;

    let task_config = TaskConfig {
        encode_target: run.target,
        encoder: run.encoder.map(Into::into),
        nvenc_codec: run.nvenc_codec.map(Into::into),
        presets: run.presets,
        bitrates: run.bitrates,
        maxrates: run.maxrates,
        bufsizes: run.bufsizes,
        rc_mode: run.rc_mode,
        cq_values: run.cq_values,
        qp_values: run.qp_values,
        lookaheads: run.lookaheads,
        minrate: run.minrate,
        temporal_aq: run.temporal_aq,
        spatial_aq: run.spatial_aq,
        profile: run.profile,
        tune: run.tune,
        multipass: run.multipass,
        eval_concurrency: run.eval_concurrency,
        webhook_url: run.webhook_url,
        input_duration: run.input_duration,
        skip_vmaf: run.skip_vmaf,
    };

    let receipt = orchestrator
        .submit(run.source, task_config)
        .await
        .context("Task submission rejected")?;
    info!("Task {} queued at position {}", receipt.task_id, receipt.queue_position);

    // Poll until the pipeline reaches a terminal state
    let mut last_progress = (0, 0, 0);
    let task = loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let Some(task) = orchestrator.task(&receipt.task_id).await else {
            anyhow::bail!("task {} disappeared from the store", receipt.task_id);
        };
        let progress = (task.progress.total, task.progress.exported, task.progress.evaluated);
        if progress != last_progress {
            info!(
                "Progress: {} job(s), {} exported, {} evaluated",
                progress.0, progress.1, progress.2
            );
            last_progress = progress;
        }
        if task.status.is_terminal() {
            break task;
        }
    };

    match task.status {
        TaskStatus::Completed => {
            println!("Task {} completed", task.id);
            if let Some(url) = &task.csv_url {
                println!("Report: {url}");
            }
            let mut scored: Vec<_> = task
                .results
                .iter()
                .filter_map(|r| r.eval.as_ref().map(|e| (e.final_score, r)))
                .collect();
            scored.sort_by(|a, b| b.0.total_cmp(&a.0));
            for (score, result) in scored.iter().take(5) {
                println!("  {score:.4}  {}", result.output_filename);
            }
            Ok(())
        }
        status => {
            anyhow::bail!(
                "task {} ended as {status:?}: {}",
                task.id,
                task.error.as_deref().unwrap_or("no error recorded")
            )
        }
    }
}

async fn show_history(cfg: OrchestratorConfig) -> Result<()> {
    let store = matrixeval::store::TaskStore::new(cfg.state_file.clone(), cfg.task_retention);
    let mut tasks = store.load()?;
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    if tasks.is_empty() {
        println!("No task history at {}", cfg.state_file.display());
        return Ok(());
    }
    for task in tasks {
        println!(
            "{}  {:<9}  {:>3}/{:>3}/{:>3}  {}  {}",
            task.created_at.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", task.status).to_lowercase(),
            task.progress.total,
            task.progress.exported,
            task.progress.evaluated,
            task.task_type,
            task.id,
        );
        if let Some(error) = &task.error {
            println!("    error: {error}");
        }
        if let Some(url) = &task.csv_url {
            println!("    report: {url}");
        }
    }
    Ok(())
}
