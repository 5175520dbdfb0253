use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use vidgen_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use vidgen_core::enhance::{EnhanceOutcome, PromptEnhancer};
use vidgen_core::generator::GenerationRequest;
use vidgen_core::housekeeping::{spawn_housekeeping, sweep_once};
use vidgen_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use vidgen_core::server::{app_router, AppState};
use vidgen_core::service::{GenerationPhase, GenerationProgress, GenerationService, ProgressSink};

#[derive(Parser)]
#[command(
    name = "vidgen",
    about = "Text-to-video generation server",
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

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate one video and exit.
    Generate(GenerateArgs),
    /// Print the enhanced form of a prompt.
    Enhance(EnhanceArgs),
    /// Run a single housekeeping pass over the output directory.
    Sweep,
}

#[derive(Args)]
struct GenerateArgs {
    #[arg(long, help = "Text prompt describing the video")]
    prompt: String,
    #[arg(long, help = "Number of inference steps (default from config)")]
    steps: Option<u32>,
    #[arg(long, help = "Classifier-free guidance scale (default from config)")]
    guidance: Option<f32>,
    #[arg(long, help = "Rewrite the prompt through the chat-completion API first")]
    enhance: bool,
}

#[derive(Args)]
struct EnhanceArgs {
    #[arg(help = "Prompt to enhance")]
    prompt: String,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() { "cli" } else { "server" };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    vidgen_core::runtime::setup_runtime_libs();
    init_logging(
        &resolved_data_dir,
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    vidgen_core::runtime::log_runtime_lib_status();
    log_startup_metadata(mode, &resolved_data_dir);

    let config = load_config(&resolved_data_dir)?;

    match cli.command {
        Some(Commands::Generate(args)) => run_generate(config, args).await,
        Some(Commands::Enhance(args)) => run_enhance(config, args).await,
        Some(Commands::Sweep) => run_sweep(config),
        None => run_server(config, cli.port, cli.host).await,
    }
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: Some(data_dir.to_path_buf()),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::RedactingMakeWriter::new(appender))
                        .with_filter(file_env_filter),
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

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
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

fn log_startup_metadata(mode: &'static str, data_dir: &Path) {
    info!(
        mode,
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// File values first, then deployment variables on top.
fn load_config(data_dir: &Path) -> Result<AppConfig> {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    let mut config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.apply_process_env()?;
    Ok(config)
}

async fn load_service(config: &AppConfig) -> Result<Arc<GenerationService>> {
    match vidgen_core::runtime::ffmpeg_version() {
        Ok(version) => info!(%version, "ffmpeg available"),
        Err(err) => warn!(error = %format!("{err:#}"), "ffmpeg unavailable; exports will fail"),
    }

    let config = config.clone();
    let service = tokio::task::spawn_blocking(move || GenerationService::from_config(&config))
        .await
        .context("model loading task panicked")??;
    Ok(Arc::new(service))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn run_server(
    config: AppConfig,
    port_override: Option<u16>,
    host_override: Option<String>,
) -> Result<()> {
    let port = port_override.unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let service = load_service(&config).await?;
    let housekeeping = spawn_housekeeping(
        &config.housekeeping,
        config.paths.output_dir.clone(),
        CancellationToken::new(),
    );

    let state = AppState::new(Arc::clone(&service), config);
    let app = app_router(state.clone());

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "Starting vidgen server");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let cancelled = state.cancel_all_jobs();
    if cancelled > 0 {
        info!(cancelled, "Cancelled in-flight jobs");
    }
    housekeeping.shutdown().await;
    service.shutdown();

    served.context("server error")
}

async fn run_generate(config: AppConfig, args: GenerateArgs) -> Result<()> {
    let request = GenerationRequest::new(
        args.prompt,
        args.steps.unwrap_or(config.generation.default_steps),
        args.guidance.unwrap_or(config.generation.default_guidance),
    );
    request.validate()?;

    let service = load_service(&config).await?;

    let cancel = CancellationToken::new();
    let ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let result = service
        .generate(request, args.enhance, cancel, terminal_progress())
        .await;
    eprintln!();
    ctrl_c.abort();
    service.shutdown();

    let output = result?;
    if let Some(outcome) = &output.enhancement {
        info!(outcome = outcome.label(), prompt = %output.prompt, "Prompt used");
    }
    println!("{}", output.video.mp4.display());
    println!("{}", output.video.gif.display());
    info!(
        elapsed = %format_duration(output.elapsed_ms as f64 / 1000.0),
        upscaled = output.upscaled,
        "Generation finished"
    );
    Ok(())
}

async fn run_enhance(config: AppConfig, args: EnhanceArgs) -> Result<()> {
    let enhancer = PromptEnhancer::new(&config.enhance)?;
    let outcome = enhancer.enhance(&args.prompt).await;
    match &outcome {
        EnhanceOutcome::Rewritten(_) => {}
        EnhanceOutcome::Exhausted {
            attempts,
            last_error,
        } => warn!(attempts, error = %last_error, "Enhancement failed; printing original prompt"),
        other => info!(outcome = other.label(), "Prompt left unchanged"),
    }
    println!("{}", outcome.resolve(&args.prompt));
    Ok(())
}

fn run_sweep(config: AppConfig) -> Result<()> {
    let report = sweep_once(
        &config.paths.output_dir,
        config.housekeeping.retention(),
        SystemTime::now(),
    )?;
    for path in &report.deleted {
        println!("{}", path.display());
    }
    info!(
        deleted = report.deleted.len(),
        kept = report.kept,
        failed = report.failed,
        "Sweep finished"
    );
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

fn phase_label(phase: GenerationPhase) -> &'static str {
    match phase {
        GenerationPhase::Generating => "Generating",
        GenerationPhase::Upscaling => "Upscaling",
        GenerationPhase::Encoding => "Encoding",
    }
}

/// One terminal line; `phase_elapsed` is time spent in the current phase.
fn render_progress(progress: &GenerationProgress, phase_elapsed: f64) -> String {
    let fraction = if progress.total > 0 {
        (progress.current as f64 / progress.total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);

    let eta = if progress.current > 0 && progress.current < progress.total {
        let remaining = (progress.total - progress.current) as f64;
        let per_unit = phase_elapsed / progress.current as f64;
        format!(" | ETA: {}", format_duration(remaining * per_unit))
    } else {
        String::new()
    };

    format!(
        "\r{:<10} [{}] {:5.1}% | {}/{} | Elapsed: {}{}    ",
        phase_label(progress.phase),
        bar,
        fraction * 100.0,
        progress.current,
        progress.total,
        format_duration(phase_elapsed),
        eta,
    )
}

fn terminal_progress() -> ProgressSink {
    let phase_start: Mutex<Option<(GenerationPhase, Instant)>> = Mutex::new(None);
    Arc::new(move |progress: GenerationProgress| {
        let elapsed = {
            let mut guard = match phase_start.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match *guard {
                Some((phase, started)) if phase == progress.phase => {
                    started.elapsed().as_secs_f64()
                }
                _ => {
                    if guard.is_some() {
                        eprintln!();
                    }
                    *guard = Some((progress.phase, Instant::now()));
                    0.0
                }
            }
        };
        eprint!("{}", render_progress(&progress, elapsed));
    })
}


#[cfg(test)]
mod progress_line_tests {
    use super::*;

    fn progress(phase: GenerationPhase, current: u64, total: u64) -> GenerationProgress {
        GenerationProgress {
            phase,
            current,
            total,
        }
    }

    #[test]
    fn half_done_shows_eta() {
        let line = render_progress(&progress(GenerationPhase::Upscaling, 6, 12), 30.0);
        assert!(line.starts_with("\rUpscaling "));
        assert!(line.contains(" 50.0% | 6/12"));
        assert!(line.contains("ETA: 00:00:30"));
    }

    #[test]
    fn start_and_end_have_no_eta() {
        let start = render_progress(&progress(GenerationPhase::Generating, 0, 1), 0.0);
        assert!(!start.contains("ETA"));
        assert!(start.contains("  0.0%"));

        let done = render_progress(&progress(GenerationPhase::Encoding, 1, 1), 4.0);
        assert!(!done.contains("ETA"));
        assert!(done.contains("100.0%"));
    }

    #[test]
    fn zero_total_does_not_divide() {
        let line = render_progress(&progress(GenerationPhase::Upscaling, 0, 0), 1.0);
        assert!(line.contains("  0.0%"));
    }
}
