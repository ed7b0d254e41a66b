use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tilerestore_core::config::{config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig};
use tilerestore_core::logging::{self, LogFilters, DEFAULT_LOG_FILTER};
use tilerestore_core::{ImageProcessor, ProcessingState, ProcessorConfig};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(
    name = "tilerestore",
    about = "Tiled ONNX image restoration (denoising, JPEG artifact removal)"
)]
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
    /// Restore one image and write it as PNG
    Restore(RestoreArgs),
    /// Print what the pipeline detects about a model, as JSON
    Inspect(InspectArgs),
}

#[derive(Args)]
struct RestoreArgs {
    #[arg(help = "Path to the input image")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Path of the PNG to write")]
    output: PathBuf,
    #[arg(
        short = 'm',
        long,
        help = "ONNX model file (relative names are also looked up in the models dir)"
    )]
    model: PathBuf,
    #[arg(
        short = 's',
        long,
        help = "Restoration strength in [0, 1] (default from config)"
    )]
    strength: Option<f32>,
}

#[derive(Args)]
struct InspectArgs {
    #[arg(short = 'm', long)]
    model: PathBuf,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let ort_library = tilerestore_core::runtime::locate_ort_library();
    init_logging(&resolved_data_dir, cli.verbose, cli.log_filter.as_deref());
    ort_library.log();

    initialize_data_dir(&resolved_data_dir)?;
    let cfg_path = config_path(&resolved_data_dir);
    let config = AppConfig::load_from_path(&cfg_path)?;
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );

    match cli.command {
        Commands::Restore(args) => run_restore(args, &config, &resolved_data_dir),
        Commands::Inspect(args) => run_inspect(args, &config, &resolved_data_dir),
    }
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filters = LogFilters::select(cli_log_filter, verbose, rust_log.as_deref());

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));
    let (file_layer, file_error) = match logging::open_log_file(data_dir) {
        Ok(appender) => (
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender)
                    .with_filter(parse_env_filter_with_fallback(&filters.file, "file")),
            ),
            None,
        ),
        Err(error) => (None, Some(error)),
    };

    let subscriber = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
        return;
    }

    if let Some(error) = file_error {
        warn!(
            log_dir = %logging::log_dir(data_dir).display(),
            reason = %format!("{error:#}"),
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> EnvFilter {
    EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

/// Use `model` as given when it exists, else look it up in the models dir.
fn resolve_model_path(model: &Path, data_dir: &Path, config: &AppConfig) -> PathBuf {
    if model.is_absolute() || model.exists() {
        return model.to_path_buf();
    }
    let models_dir = resolve_relative_to(data_dir, &config.paths.models_dir);
    models_dir.join(model)
}

fn load_processor(model: &Path, config: &AppConfig, data_dir: &Path) -> Result<ImageProcessor> {
    let model_path = resolve_model_path(model, data_dir, config);
    let processor = ImageProcessor::new(ProcessorConfig::from_app_config(config, data_dir));
    processor
        .load_model(&model_path)
        .with_context(|| format!("cannot use model {}", model_path.display()))?;
    Ok(processor)
}

fn run_restore(args: RestoreArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let processor = load_processor(&args.model, config, data_dir)?;
    let input = fs::read(&args.input)
        .with_context(|| format!("failed to read input image: {}", args.input.display()))?;
    let strength = args
        .strength
        .unwrap_or(config.processing.default_strength);

    let started = Instant::now();
    let mut on_progress = |state: ProcessingState| {
        eprint!("\r{}    ", render_progress(&state, started.elapsed().as_secs_f64()));
    };
    let result = processor.process_image(&input, strength, Some(&mut on_progress));
    eprintln!();
    let png = result.with_context(|| format!("failed to restore {}", args.input.display()))?;

    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory: {}", parent.display()))?;
    }
    fs::write(&args.output, &png)
        .with_context(|| format!("failed to write output image: {}", args.output.display()))?;

    info!(
        input = %args.input.display(),
        output = %args.output.display(),
        strength,
        elapsed = %format_duration(started.elapsed().as_secs_f64()),
        "Restore finished"
    );
    Ok(())
}

fn run_inspect(args: InspectArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let processor = load_processor(&args.model, config, data_dir)?;
    let info = processor
        .model_info()
        .context("model loaded but no model info is available")?;
    let json = serde_json::to_string_pretty(&info).context("failed to serialize model info")?;
    println!("{json}");
    Ok(())
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn render_progress(state: &ProcessingState, elapsed: f64) -> String {
    let fraction = state.progress() as f64;
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);

    format!(
        "[{}] {:5.1}% | Tile {}/{} | Elapsed: {}",
        bar,
        fraction * 100.0,
        state.completed_tiles,
        state.total_tiles,
        format_duration(elapsed),
    )
}
