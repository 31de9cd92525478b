//! pullr build worker.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use pullr_builder::{BuilderRegistry, ClonerRegistry};
use pullr_config::WorkerConfig;
use pullr_core::{BuildStore, Error};
use pullr_queue::{QueueRegistry, connect_with_retry};
use pullr_worker::{BuildHandler, BuildListener, PgBuildStore, Pipeline};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pullr-worker")]
#[command(about = "Builds and pushes container images for queued build jobs", long_about = None)]
struct Cli {
    /// Configuration file (KDL)
    #[arg(short, long, env = "PULLR_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, env = "PULLR_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume build jobs until interrupted (default)
    Run,
    /// Validate the configuration and print the selected backends
    Check,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config =
        pullr_config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Check => check(&config),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn check(config: &WorkerConfig) -> anyhow::Result<()> {
    let queues = QueueRegistry::default();
    if !queues.contains(&config.queue.driver) {
        anyhow::bail!(
            "Unknown queue driver '{}' (available: {})",
            config.queue.driver,
            queues.names().join(", ")
        );
    }
    let factory = BuilderRegistry::default()
        .create(&config.builder)
        .context("Invalid builder configuration")?;

    println!("queue:    {} ({})", config.queue.driver, config.queue.name);
    println!("builder:  {}", factory.name());
    println!("registry: {}", config.pipeline.registry.host());
    println!(
        "cloners:  {}",
        ClonerRegistry::from_config(&config.pipeline)
            .providers()
            .join(", ")
    );
    println!("git:      {}", config.pipeline.git_bin);
    println!(
        "store:    {}",
        if config.store.is_some() { "postgres" } else { "none" }
    );
    Ok(())
}

async fn run(config: WorkerConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let factory = BuilderRegistry::default()
        .create(&config.builder)
        .context("Invalid builder configuration")?;

    let queues = QueueRegistry::default();
    let settings = &config.listener;
    info!(driver = %config.queue.driver, "Connecting to queue...");
    let queue = match connect_with_retry(
        &cancel,
        settings.connect_interval,
        settings.connect_timeout,
        || queues.connect(&config.queue),
    )
    .await
    {
        Ok(queue) => queue,
        Err(Error::Cancelled) => {
            info!("Interrupted while connecting");
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to connect to queue"),
    };
    info!("Queue connected");

    let store: Option<Arc<dyn BuildStore>> = match &config.store {
        Some(store) => {
            info!("Connecting to build store...");
            match connect_with_retry(
                &cancel,
                settings.connect_interval,
                settings.connect_timeout,
                || PgBuildStore::connect(&store.url),
            )
            .await
            {
                Ok(pg) => Some(Arc::new(pg) as Arc<dyn BuildStore>),
                Err(Error::Cancelled) => {
                    info!("Interrupted while connecting");
                    return Ok(());
                }
                Err(e) => return Err(e).context("Failed to connect to build store"),
            }
        }
        None => {
            warn!("No build store configured, build history is not recorded");
            None
        }
    };

    let pipeline = Pipeline::new(
        ClonerRegistry::from_config(&config.pipeline),
        factory,
        config.pipeline.clone(),
    );
    info!(
        builder = %pipeline.builder_name(),
        registry = %config.pipeline.registry.host(),
        clone_dir = %config.pipeline.clone_dir.display(),
        "Pipeline ready"
    );
    let handler = BuildHandler::new(Arc::new(pipeline), store);

    let listener = BuildListener::new(
        queue.clone(),
        config.queue.name.clone(),
        config.listener.clone(),
        Arc::new(handler),
    );
    let result = listener.listen(&cancel).await;

    if let Err(e) = queue.close().await {
        warn!(error = %e, "Failed to close queue connection");
    }
    result.context("Build listener stopped")?;

    info!("Worker stopped");
    Ok(())
}

/// Cancel `cancel` on SIGINT or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
    cancel.cancel();
}
