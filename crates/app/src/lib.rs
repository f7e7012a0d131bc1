use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use visionnova_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use visionnova_core::image_io::{load_image, save_image};
use visionnova_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER,
};
use visionnova_core::model_registry::{ModelCache, ModelRegistry};
use visionnova_core::pipeline::Pipeline;
use visionnova_core::server::{app_router, AppState};
use visionnova_core::strategy::EnhancementStrategy;

#[derive(Parser)]
#[command(
    name = "visionnova",
    about = "Tiled image enhancement server and CLI",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

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

    #[arg(long, global = true, help = "Data directory holding config.toml and logs")]
    data_dir: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enhance one image file and write the result to disk.
    Enhance(EnhanceArgs),
    /// List the models found in the models directory.
    Models(ModelsArgs),
}

#[derive(Args)]
struct EnhanceArgs {
    #[arg(help = "Input image path")]
    input: PathBuf,
    #[arg(
        short = 'o',
        long,
        help = "Output image path (default: enhanced_<input name> next to the input)"
    )]
    output: Option<PathBuf>,
    #[arg(
        short = 'e',
        long,
        help = "Enhancement selector, e.g. pillow_sharpness or keras_<model>"
    )]
    enhancement: String,
    #[arg(
        short = 'f',
        long,
        default_value_t = 1,
        allow_negative_numbers = true,
        help = "Intensity: filter strength percentage or model pass count"
    )]
    factor: i64,
}

#[derive(Args)]
struct ModelsArgs {
    #[arg(long, help = "Print the catalog as JSON")]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Server,
    Cli,
}

impl RunMode {
    fn name(self) -> &'static str {
        match self {
            RunMode::Server => "server",
            RunMode::Cli => "cli",
        }
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RunMode::Cli
    } else {
        RunMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    visionnova_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    visionnova_core::runtime::log_runtime_lib_status();
    log_startup_metadata(mode, &resolved_data_dir);

    let config = load_config(&resolved_data_dir);

    match cli.command {
        Some(Commands::Enhance(args)) => run_enhance(args, config, &resolved_data_dir).await,
        Some(Commands::Models(args)) => list_models(args, &config, &resolved_data_dir),
        None => run_server(cli.port, cli.host, config, &resolved_data_dir).await,
    }
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        data_dir: None,
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        default_log_filter: DEFAULT_LOG_FILTER.to_string(),
        noise_filter: noise_base.to_string(),
        retention_files: logging::DEFAULT_LOG_RETENTION_FILES,
    };

    logging::compose_logging_filters(&options).effective_filter
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = &panic_hook_plan
    {
        let attempted_crash_dir = attempted_crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: panic crash artifact hook unavailable (path: {attempted_crash_dir}; reason: {reason}). Panics will not be persisted to crash logs."
        );
    }

    let options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filter = logging::compose_logging_filters(&options).effective_filter;

    match logging::build_file_sink_plan(&options) {
        FileSinkPlan::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(parse_env_filter_with_fallback(&filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&filter, "console")),
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

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
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

fn log_startup_metadata(mode: RunMode, data_dir: &Path) {
    info!(
        mode = mode.name(),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn build_model_cache(config: &AppConfig, data_dir: &Path) -> Result<ModelCache> {
    let models_dir = resolve_relative_to(data_dir, &config.paths.models_dir);
    let registry = ModelRegistry::discovered(models_dir)?;
    info!(
        models_dir = %registry.models_dir().display(),
        count = registry.list().len(),
        "Model registry loaded"
    );

    let trt_cache_dir = resolve_relative_to(data_dir, &config.paths.trt_cache_dir);
    Ok(ModelCache::new(registry, config.inference.backend).with_trt_cache_dir(trt_cache_dir))
}

fn build_pipeline(config: &AppConfig) -> Result<Pipeline> {
    Pipeline::new(config.tiling, config.inference.batch_size)
        .context("invalid tiling configuration")
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    config: AppConfig,
    data_dir: &Path,
) -> Result<()> {
    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let pipeline = build_pipeline(&config)?;
    let models = Arc::new(build_model_cache(&config, data_dir)?);
    let state = AppState::new(pipeline, models, &config.server);
    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting visionnova server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// `enhanced_<file name>` in the input's directory.
fn default_output_path(input: &Path) -> PathBuf {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image.png".to_string());
    input.with_file_name(format!("enhanced_{name}"))
}

async fn run_enhance(args: EnhanceArgs, config: AppConfig, data_dir: &Path) -> Result<()> {
    let strategy = EnhancementStrategy::parse(&args.enhancement, args.factor)?;
    let pipeline = build_pipeline(&config)?;
    let models = build_model_cache(&config, data_dir)?;
    let output = args
        .output
        .unwrap_or_else(|| default_output_path(&args.input));
    let input = args.input;

    info!(
        input = %input.display(),
        output = %output.display(),
        enhancement = %strategy.label(),
        "Enhancing image"
    );

    let started = Instant::now();
    let written = output.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let image = load_image(&input, pipeline.tile_config())
            .with_context(|| format!("failed to load {}", input.display()))?;
        let enhanced = pipeline.enhance(&image, &strategy, &models)?;
        save_image(&enhanced, &output)
            .with_context(|| format!("failed to write {}", output.display()))?;
        Ok(())
    })
    .await
    .context("enhancement task panicked")??;

    info!(
        output = %written.display(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Enhancement finished"
    );
    println!("{}", written.display());
    Ok(())
}

fn list_models(args: ModelsArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let models_dir = resolve_relative_to(data_dir, &config.paths.models_dir);
    let registry = ModelRegistry::discovered(models_dir)?;

    if args.json {
        println!("{}", registry.to_json()?);
        return Ok(());
    }

    if registry.list().is_empty() {
        println!("No models found in {}", registry.models_dir().display());
        return Ok(());
    }
    for entry in registry.list() {
        println!("{}\t{}\t{}", entry.selector(), entry.filename, entry.description);
    }
    Ok(())
}
