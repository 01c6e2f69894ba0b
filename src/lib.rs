use clap::ValueEnum;
use cli::Cli;
use recognizer::HttpPlateRecognizer;
use server::run_server;
use startup_coordinator::spawn_detector_initialization;
use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info};
pub mod api;
pub mod batch;
pub mod cli;
pub mod detector;
pub mod download_models;
pub mod fusion;
pub mod image;
pub mod pipeline;
pub mod recognizer;
pub mod region;
pub mod server;
pub mod startup_coordinator;
pub mod worker;

/// Result of the service future, the detector worker thread handle if one was started
pub type ServiceResult = anyhow::Result<Option<std::thread::JoinHandle<()>>>;

/// Builds the HTTP service. The detector is initialized in the background, the
/// returned future serves requests until the token is cancelled.
pub fn plate_fusion_service(
    args: Cli,
) -> anyhow::Result<(impl Future<Output = ServiceResult>, CancellationToken)> {
    let recognizer = Arc::new(HttpPlateRecognizer::new(
        &args.recognizer_url,
        Duration::from_secs(args.recognizer_timeout),
    )?);

    let detector_init_receiver =
        spawn_detector_initialization(args.detector_config(), args.worker_queue_size);

    let cancel_token = CancellationToken::new();
    let server_future = run_server(
        args.server_config(),
        recognizer,
        cancel_token.clone(),
        detector_init_receiver,
    );

    Ok((server_future, cancel_token))
}

use std::sync::OnceLock;

static LOG_RELOAD_HANDLE: OnceLock<
    tracing_subscriber::reload::Handle<tracing_subscriber::EnvFilter, tracing_subscriber::Registry>,
> = OnceLock::new();

pub fn init_logging(
    log_level: LogLevel,
    log_path: &mut Option<PathBuf>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, reload};

    setup_ansi_support();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(log_level)));

    let (env_filter, reload_handle) = reload::Layer::new(env_filter);

    LOG_RELOAD_HANDLE
        .set(reload_handle)
        .map_err(|_| anyhow::anyhow!("Failed to set log reload handle"))?;

    let guard = if let Some(path) = log_path.clone() {
        // Relative to the binary, not the working directory
        let log_directory = if path.starts_with(".") {
            let stripped = path.strip_prefix(".").unwrap_or(&path).to_path_buf();
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|p| p.join(stripped.clone())))
                .unwrap_or(stripped)
        } else {
            path
        };

        *log_path = Some(log_directory.clone());

        let log_file = log_directory.join("plate_fusion.log");
        println!("Starting Plate Fusion, logging into: {}", log_file.display());

        let file_appender = tracing_appender::rolling::daily(&log_directory, "plate_fusion.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .try_init()
            .map_err(|_| anyhow::anyhow!("Logging already initialized"))?;

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|_| anyhow::anyhow!("Logging already initialized"))?;

        None
    };

    info!(
        ?log_level,
        "Logging initialized with dynamic filtering support"
    );
    Ok(guard)
}

pub fn update_log_level(new_log_level: LogLevel) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let reload_handle = LOG_RELOAD_HANDLE
        .get()
        .ok_or_else(|| anyhow::anyhow!("Log reload handle not available"))?;
    reload_handle
        .reload(EnvFilter::new(level_to_filter_string(new_log_level)))
        .map_err(|e| anyhow::anyhow!("Failed to reload log filter: {}", e))?;

    info!(?new_log_level, "Log level updated dynamically");
    Ok(())
}

fn level_to_filter_string(log_level: LogLevel) -> String {
    match log_level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
    .to_string()
}

fn setup_ansi_support() {
    #[cfg(target_os = "windows")]
    if let Err(e) = ansi_term::enable_ansi_support() {
        eprintln!("Failed to enable ANSI support: {e}");
    }
}

#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    ValueEnum,
    Debug,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}
