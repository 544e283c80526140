use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tiered_scheduler::background_jobs::jobs::register_builtin_handlers;
use tiered_scheduler::config::{AppConfig, CliConfig, FileConfig};
use tiered_scheduler::server::{self, ServerConfig};
use tiered_scheduler::{
    create_scheduler, run_metrics_server, run_server, HandlerRegistry, JobStore,
    RequestsLoggingLevel, SqliteJobStore,
};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Its values override the CLI ones.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the scheduler database.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3010)]
    pub port: u16,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9092)]
    pub metrics_port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let cli_config = CliConfig {
        db_dir: cli_args.db_dir.clone(),
        port: cli_args.port,
        metrics_port: cli_args.metrics_port,
    };
    let app_config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Initializing metrics...");
    server::metrics::init_metrics();

    let db_path = app_config.scheduler_db_path();
    info!("Opening job store at {:?}...", db_path);
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(&db_path)?);

    let mut registry = HandlerRegistry::new();
    register_builtin_handlers(&mut registry, Arc::clone(&store));
    info!("Registered handlers: {}", registry.names().join(", "));

    let shutdown_token = CancellationToken::new();
    let (mut scheduler, admin) = create_scheduler(
        store,
        Arc::new(registry),
        app_config.tiers.clone(),
        app_config.scheduler.clone(),
        shutdown_token.clone(),
    );

    let now = Utc::now();
    for definition in &app_config.jobs {
        scheduler
            .register_job(definition, now)
            .with_context(|| format!("Failed to register job {}", definition.id))?;
    }
    info!("{} jobs configured", app_config.jobs.len());

    let scheduler_task = tokio::spawn(async move { scheduler.run().await });

    let metrics_task = tokio::spawn(run_metrics_server(
        app_config.metrics_port,
        shutdown_token.clone(),
    ));

    let server_config = ServerConfig {
        requests_logging_level: cli_args.logging_level,
        port: app_config.port,
        metrics_port: app_config.metrics_port,
    };
    let mut server_task = tokio::spawn(run_server(server_config, admin, shutdown_token.clone()));

    let stopped_early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
            None
        }
        joined = &mut server_task => {
            let result = flatten_join(joined, "Server");
            if let Err(e) = &result {
                error!("Server stopped: {:#}", e);
            }
            Some(result)
        }
    };

    shutdown_token.cancel();

    if let Err(e) = scheduler_task.await {
        error!("Scheduler task failed: {}", e);
    }
    if let Err(e) = flatten_join(metrics_task.await, "Metrics server") {
        error!("{:#}", e);
    }
    match stopped_early {
        Some(result) => result,
        None => flatten_join(server_task.await, "Server"),
    }
}

fn flatten_join(
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
    what: &str,
) -> Result<()> {
    match joined {
        Ok(result) => result.with_context(|| format!("{} failed", what)),
        Err(e) => Err(anyhow::anyhow!("{} task failed: {}", what, e)),
    }
}
