use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use upscaler_core::codec::{self, OutputFormat};
use upscaler_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use upscaler_core::inference::InferenceBackend;
use upscaler_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, RedactingMakeWriter,
    RuntimeLogMode, DEFAULT_LOG_FILTER,
};
use upscaler_core::model_registry::DEFAULT_MODEL;
use upscaler_core::pipeline::{UpscaleRequest, Upscaler, DEFAULT_SCALE};
use upscaler_core::runtime;
use upscaler_core::server::{app_router, AppState};

const BACKEND_ENV: &str = "UPSCALER_BACKEND";

#[derive(Parser)]
#[command(
    name = "upscaler",
    about = "Real-ESRGAN image upscaling service",
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

    #[arg(long, global = true, help = "Data directory holding config.toml, models and logs")]
    data_dir: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upscale a single image file without starting the server
    Upscale(UpscaleArgs),
    /// Download model weights into the models directory
    FetchModels(FetchModelsArgs),
    /// List the model catalog and which weights are present
    Models,
}

#[derive(Args)]
struct UpscaleArgs {
    #[arg(help = "Input image path")]
    input: PathBuf,
    #[arg(
        short = 'o',
        long,
        help = "Output path; the extension picks PNG or JPEG (default: <input>_x<scale>.png)"
    )]
    output: Option<PathBuf>,
    #[arg(short, long, default_value = DEFAULT_MODEL)]
    model: String,
    #[arg(short, long, default_value_t = DEFAULT_SCALE)]
    scale: u32,
}

#[derive(Args)]
struct FetchModelsArgs {
    #[arg(help = "Models to download (default: every model with a known URL)")]
    names: Vec<String>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Cli
    } else {
        RuntimeLogMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_report = runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    runtime::log_runtime_lib_status(&runtime_report);
    log_startup_metadata(mode, &resolved_data_dir);

    let config = load_config(&resolved_data_dir);
    match cli.command {
        Some(Commands::Upscale(args)) => upscale_file(args, config, resolved_data_dir).await,
        Some(Commands::FetchModels(args)) => {
            fetch_models(args.names, config, resolved_data_dir).await
        }
        Some(Commands::Models) => {
            list_models(&config, &resolved_data_dir);
            Ok(())
        }
        None => run_server(cli.port, cli.host, config, resolved_data_dir).await,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = &panic_hook_plan
    {
        eprintln!(
            "Warning: panic crash artifacts disabled (path: {}; reason: {reason}).",
            display_or_none(attempted_crash_dir.as_deref())
        );
    }

    let options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = logging::compose_logging_filters(&options);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console_filter, "console"));

    let (installed, file_fallback) = match logging::build_file_sink_plan(&options) {
        FileSinkPlan::Ready { appender, .. } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(RedactingMakeWriter::new(appender))
                .with_filter(parse_env_filter_with_fallback(&filters.file_filter, "file"));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            (tracing::subscriber::set_global_default(subscriber), None)
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            (
                tracing::subscriber::set_global_default(subscriber),
                Some((attempted_log_dir, reason)),
            )
        }
    };

    if let Err(error) = installed {
        eprintln!("Failed to initialize tracing subscriber: {error}. Continuing without structured tracing.");
        return;
    }

    if let Some((attempted_log_dir, reason)) = file_fallback {
        warn!(
            attempted_log_dir = %display_or_none(attempted_log_dir.as_deref()),
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
    if let PanicHookInstallPlan::Fallback { reason, .. } = panic_hook_plan {
        warn!(reason = %reason, "Panic crash artifacts disabled");
    }
}

fn display_or_none(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "<none>".to_string())
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: &Path) {
    info!(
        mode = mode.as_str(),
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// Load `config.toml`, creating the data directory on first run. Any failure
/// falls back to defaults so the service can still start.
fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let mut config = match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    apply_backend_override(&mut config, std::env::var(BACKEND_ENV).ok().as_deref());
    config
}

fn apply_backend_override(config: &mut AppConfig, value: Option<&str>) {
    if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
        let backend = InferenceBackend::from_str_lossy(value.trim());
        info!(%backend, "Inference backend overridden by {BACKEND_ENV}");
        config.inference.backend = backend;
    }
}

fn resolve_port(cli_port: Option<u16>, env_port: Option<&str>, config: &AppConfig) -> u16 {
    cli_port
        .or_else(|| env_port.and_then(|v| v.trim().parse().ok()))
        .unwrap_or(config.server.port)
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    config: AppConfig,
    data_dir: PathBuf,
) -> Result<()> {
    let port = resolve_port(port_override, std::env::var("PORT").ok().as_deref(), &config);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let state = AppState::from_config(&config, &data_dir);
    let registry = state.upscaler().registry();
    info!(
        models_dir = %registry.models_dir().display(),
        backend = %config.inference.backend,
        models = ?registry.supported_names(),
        "Model registry ready; models load on first request"
    );
    for descriptor in registry.catalog() {
        if !registry.is_downloaded(&descriptor.name) {
            warn!(
                model = %descriptor.name,
                file = %descriptor.filename,
                "Model weights missing; run `upscaler fetch-models` or place the file manually"
            );
        }
    }

    let app = app_router(state);
    let addr = format!("{host}:{port}");
    info!(%addr, "Starting upscaler server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn default_output_path(input: &Path, scale: u32) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input.with_file_name(format!("{stem}_x{scale}.png"))
}

fn output_format_for(path: &Path) -> OutputFormat {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(OutputFormat::from_extension)
        .unwrap_or_default()
}

async fn upscale_file(args: UpscaleArgs, config: AppConfig, data_dir: PathBuf) -> Result<()> {
    let UpscaleArgs {
        input,
        output,
        model,
        scale,
    } = args;
    let output = output.unwrap_or_else(|| default_output_path(&input, scale));
    let format = output_format_for(&output);
    let jpeg_quality = config.output.jpeg_quality;

    let bytes = tokio::fs::read(&input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;

    let (result, encoded) = tokio::task::spawn_blocking(move || -> Result<_> {
        let image = codec::decode_image(&bytes, &config.limits)?;
        let upscaler = Upscaler::from_config(&config, &data_dir);
        let result = upscaler.upscale(UpscaleRequest {
            image,
            model,
            scale,
        })?;
        let encoded = codec::encode_image(&result.image, format, jpeg_quality)?;
        Ok((result, encoded))
    })
    .await
    .context("Upscale task panicked")??;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(&output, &encoded)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    let (in_w, in_h) = result.input_dimensions;
    let (out_w, out_h) = result.output_dimensions;
    println!(
        "{} ({in_w}x{in_h}) -> {} ({out_w}x{out_h}) using {} x{} in {:.2}s",
        input.display(),
        output.display(),
        result.model,
        result.scale,
        result.elapsed.as_secs_f64()
    );
    Ok(())
}

/// Names to fetch: the explicit list, or every catalog entry with a URL.
fn select_downloads(requested: &[String], upscaler: &Upscaler) -> Result<Vec<String>> {
    let registry = upscaler.registry();
    if requested.is_empty() {
        return Ok(registry
            .catalog()
            .iter()
            .filter(|d| d.url.is_some())
            .map(|d| d.name.clone())
            .collect());
    }
    for name in requested {
        registry.validate_model_name(name)?;
    }
    Ok(requested.to_vec())
}

async fn fetch_models(names: Vec<String>, config: AppConfig, data_dir: PathBuf) -> Result<()> {
    // The downloader uses reqwest's blocking client.
    tokio::task::spawn_blocking(move || -> Result<()> {
        let upscaler = Upscaler::from_config(&config, &data_dir);
        let registry = upscaler.registry();
        let selected = select_downloads(&names, &upscaler)?;
        if selected.is_empty() {
            warn!("No catalog model has a download URL; place the weights manually");
        }

        let mut failed = Vec::new();
        for name in &selected {
            if registry.is_downloaded(name) {
                info!(model = %name, "Weights already present, skipping");
                continue;
            }
            match registry.download(name) {
                Ok(path) => println!("{name}: {}", path.display()),
                Err(e) => {
                    warn!(model = %name, error = %format!("{e:#}"), "Model download failed");
                    failed.push(name.clone());
                }
            }
        }

        if !failed.is_empty() {
            bail!("Failed to download: {}", failed.join(", "));
        }
        Ok(())
    })
    .await
    .context("Download task panicked")?
}

fn list_models(config: &AppConfig, data_dir: &Path) {
    let upscaler = Upscaler::from_config(config, data_dir);
    let registry = upscaler.registry();
    println!("models directory: {}", registry.models_dir().display());
    for descriptor in registry.catalog() {
        let status = if registry.is_downloaded(&descriptor.name) {
            "present"
        } else {
            "missing"
        };
        let default_marker = if descriptor.name == DEFAULT_MODEL {
            " (default)"
        } else {
            ""
        };
        println!(
            "  {:<26} x{}  {:<8} {}{default_marker}",
            descriptor.name, descriptor.native_scale, status, descriptor.description
        );
    }
}
