use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use uptile_core::backend::{InferenceBackend, ModelShape, ResampleBackend};
use uptile_core::baseline::{BaselineResampler, BicubicResampler, NearestResampler};
use uptile_core::config::{config_path, data_dir, initialize_data_dir, EngineConfig};
use uptile_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use uptile_core::orchestrator::{FrameOrchestrator, RunOutcome, RunSummary};

mod io;

pub use io::{RawFrameSink, RawFrameSource};

#[derive(Parser)]
#[command(name = "uptile", about = "Tiled neural video upscaler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    Upscale(UpscaleArgs),
}

#[derive(Args)]
struct UpscaleArgs {
    #[arg(help = "Raw RGB24 input file (headerless, e.g. from ffmpeg -f rawvideo)")]
    input: PathBuf,
    #[arg(help = "Raw RGB24 output file")]
    output: PathBuf,
    #[arg(long, help = "Input frame width in pixels")]
    width: usize,
    #[arg(long, help = "Input frame height in pixels")]
    height: usize,
    #[arg(long, help = "Frame rate used to assign output timestamps")]
    fps: Option<f64>,
    #[arg(
        short = 's',
        long,
        allow_negative_numbers = true,
        help = "Override the configured scale factor"
    )]
    scale: Option<f64>,
    #[arg(long, help = "Override the configured tile overlap, in input pixels")]
    overlap: Option<usize>,
    #[arg(long, default_value_t = 512, help = "Model tile edge length in pixels")]
    tile_size: usize,
    #[arg(long, default_value_t = 2, help = "Upscale factor native to the model")]
    native_scale: usize,
    #[arg(
        long,
        value_enum,
        default_value = "bicubic",
        help = "Resampler used for the baseline image and the stand-in model"
    )]
    resampler: ResamplerChoice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ResamplerChoice {
    Bicubic,
    Nearest,
}

impl ResamplerChoice {
    fn build(self) -> Box<dyn BaselineResampler> {
        match self {
            Self::Bicubic => Box::new(BicubicResampler),
            Self::Nearest => Box::new(NearestResampler),
        }
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(Some(resolved_data_dir.as_path()));

    match cli.command {
        Commands::Upscale(args) => run_upscale(args, resolved_data_dir).await,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let filter = init_plan.filters.combined_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: Option<&Path>) {
    let pid = std::process::id();
    if let Some(data_dir) = data_dir {
        let cfg_path = config_path(data_dir);
        info!(
            pid,
            data_dir = %data_dir.display(),
            config_path = %cfg_path.display(),
            "Runtime startup metadata"
        );
    } else {
        info!(pid, "Runtime startup metadata");
    }
}

fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let cfg_path = config_path(data_dir);
    match EngineConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            EngineConfig::default()
        }
    }
}

fn apply_overrides(config: &mut EngineConfig, args: &UpscaleArgs) -> Result<()> {
    if let Some(scale) = args.scale {
        if !scale.is_finite() || scale <= 0.0 {
            bail!("scale factor {scale} must be positive and finite");
        }
        config.scaling.user_scale_factor = scale;
    }
    if let Some(overlap) = args.overlap {
        config.tiling.overlap = overlap;
    }
    Ok(())
}

async fn run_upscale(args: UpscaleArgs, data_dir: PathBuf) -> Result<()> {
    if !args.input.exists() {
        bail!("Input file does not exist: {}", args.input.display());
    }
    if args.tile_size == 0 || args.native_scale == 0 {
        bail!("tile size and native scale must be positive");
    }

    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let mut config = load_engine_config(&data_dir);
    apply_overrides(&mut config, &args)?;

    let shape = ModelShape {
        channels: 3,
        tile_width: args.tile_size,
        tile_height: args.tile_size,
        native_scale: args.native_scale,
    };
    let backend: Box<dyn InferenceBackend> = match args.resampler {
        ResamplerChoice::Bicubic => Box::new(ResampleBackend::new(BicubicResampler, shape)),
        ResamplerChoice::Nearest => Box::new(ResampleBackend::new(NearestResampler, shape)),
    };
    let post_filter = config
        .post_filter
        .build_pipeline()
        .context("invalid post filter configuration")?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling run");
            signal_cancel.cancel();
        }
    });

    let mut orchestrator = FrameOrchestrator::new(
        config,
        backend,
        args.resampler.build(),
        post_filter,
        cancel,
    )
    .context("invalid engine configuration")?;

    let source = RawFrameSource::open(&args.input, args.width, args.height, args.fps)?;
    let sink = RawFrameSink::create(&args.output)?;

    info!(
        input = %args.input.display(),
        output = %args.output.display(),
        width = args.width,
        height = args.height,
        tile_size = args.tile_size,
        "Starting upscale run"
    );

    let started = Instant::now();
    let outcome = tokio::task::spawn_blocking(move || orchestrator.run(source, sink))
        .await
        .context("upscale task panicked")??;

    let elapsed = started.elapsed();
    match outcome {
        RunOutcome::Completed(summary) => {
            log_run_totals(&summary, elapsed.as_secs_f64());
            Ok(())
        }
        RunOutcome::Cancelled(summary) => {
            log_run_totals(&summary, elapsed.as_secs_f64());
            bail!("run cancelled after {} frames", summary.frames_emitted)
        }
    }
}

fn log_run_totals(summary: &RunSummary, elapsed_secs: f64) {
    let fps = if elapsed_secs > 0.0 {
        summary.frames_emitted as f64 / elapsed_secs
    } else {
        0.0
    };
    info!(
        frames_in = summary.frames_in,
        frames_emitted = summary.frames_emitted,
        tiles_processed = summary.tiles_processed,
        tiles_failed = summary.tiles_failed,
        tiles_guarded = summary.tiles_guarded,
        elapsed_secs = format!("{elapsed_secs:.2}"),
        throughput_fps = format!("{fps:.2}"),
        "Upscale run finished"
    );
}
