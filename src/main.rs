use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use microblog_core::config::Config;
use microblog_core::db::Database;
use microblog_core::store::SqliteStore;
use microblog_core::thread::ThreadAssembler;
use microblog_core::worker::{SqliteSubscriptions, SubscriberError, TreeUpdateWorker};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    // Initialize logging
    init_tracing()?;

    info!("Starting microblog-core tree update daemon");

    // Load and validate configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(
        subscription = %config.subscription_name,
        batch_size = config.worker_batch_size,
        "Configuration loaded"
    );

    if let Some(parent) = config.database_path.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create database directory: {}", parent.display())
        })?;
    }

    // Initialize database
    let db = Database::new(&config.database_path)
        .await
        .context("Failed to initialize database")?;

    info!("Database initialized");

    let store = Arc::new(SqliteStore::new(db.clone()));
    let assembler = Arc::new(ThreadAssembler::new(store.clone(), store));
    let subscriptions = Arc::new(SqliteSubscriptions::new(db, config.consumer_lease));

    let worker = TreeUpdateWorker::new(subscriptions, assembler, &config);
    let cancel = CancellationToken::new();

    let worker_cancel = cancel.clone();
    let mut worker_handle = tokio::spawn(async move { worker.run(worker_cancel).await });
    info!("Tree update worker started");

    // The worker is this process's sole job. Exit as soon as it terminates
    // on its own (fatal errors require external supervision to restart us)
    // instead of lingering until a signal arrives.
    tokio::select! {
        () = shutdown_signal() => {
            info!("Shutting down...");
            cancel.cancel();
            worker_outcome(worker_handle.await)?;
            info!("Shutdown complete");
        }
        result = &mut worker_handle => {
            worker_outcome(result)?;
            info!("Tree update worker stopped, exiting");
        }
    }

    Ok(())
}

fn worker_outcome(
    result: Result<Result<(), SubscriberError>, tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e).context("Tree update worker terminated with a fatal error"),
        Err(e) => Err(e).context("Tree update worker task panicked"),
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,microblog_core=debug"));

    // Check if JSON logging is requested
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        // Structured JSON logging for production
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        // Pretty-printed logging for development
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
