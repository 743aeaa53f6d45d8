use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use proofread_relay::{
    config::{Config, LogFormat},
    events::InMemoryEventBus,
    server::{router, AppState},
    storage::{SqliteStorage, StreamMetaSink},
    stream_meta::{MetaFlusher, StreamMetaTracker},
    summary::{SummaryQuery, SummaryService},
};

const FLUSH_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Streams proofreading run progress and serves catch-up state.
#[derive(Debug, Parser)]
#[command(name = "proofread-relay", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP server (default).
    Serve,
    /// Print the reconstructed summary of a run as JSON.
    Summary(RunArgs),
    /// Print one page of a run's result buckets as JSON.
    Items {
        #[command(flatten)]
        run: RunArgs,
        /// Offset returned as `nextCursor` by the previous page.
        #[arg(long)]
        cursor: Option<String>,
        /// Buckets per page (1-10).
        #[arg(long)]
        limit: Option<String>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Owning project.
    #[arg(long)]
    project: String,
    /// Run id or analysis alias.
    #[arg(long)]
    run: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    // Initialize storage
    let storage = match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(e.into());
        }
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, storage).await,
        Command::Summary(args) => {
            let service = offline_summaries(&storage);
            let query = SummaryQuery::new(args.project).with_run_id(args.run.clone());
            match service.get_run_summary(&query).await {
                Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
                None => anyhow::bail!("run not found: {}", args.run),
            }
            Ok(())
        }
        Command::Items { run, cursor, limit } => {
            let service = offline_summaries(&storage);
            let query = SummaryQuery::new(run.project).with_run_id(run.run.clone());
            match service
                .get_items_slice(&query, cursor.as_deref(), limit.as_deref())
                .await
            {
                Some(page) => println!("{}", serde_json::to_string_pretty(&page)?),
                None => anyhow::bail!("run not found: {}", run.run),
            }
            Ok(())
        }
    }
}

async fn serve(config: Config, storage: SqliteStorage) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Proofread relay starting..."
    );

    let sink: Arc<dyn StreamMetaSink> = Arc::new(storage.clone());
    let (flusher, flusher_handle) = MetaFlusher::spawn(sink, config.streaming.meta_flush_queue);
    let tracker = Arc::new(StreamMetaTracker::with_flusher(flusher));
    let sweeper = Arc::clone(&tracker).spawn_sweeper(config.streaming.meta_idle_ttl());
    let bus = Arc::new(InMemoryEventBus::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bind_addr = config.server.bind_addr.clone();
    let state = AppState::new(config, storage, bus, tracker).with_shutdown(shutdown_rx);
    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "Failed to bind");
            return Err(e.into());
        }
    };

    info!(addr = %bind_addr, "Server ready, accepting connections");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open streams keep their responses alive until told to end.
            let _ = shutdown_tx.send(true);
        })
        .await
    {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    sweeper.abort();
    let _ = sweeper.await;

    // The writer exits once the last tracker handle is gone.
    match tokio::time::timeout(FLUSH_DRAIN_TIMEOUT, flusher_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Stream meta flusher panicked"),
        Err(_) => warn!("Stream meta flusher still busy at shutdown, abandoning"),
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Summary service over the database without live stream diagnostics.
fn offline_summaries(storage: &SqliteStorage) -> SummaryService {
    let store = Arc::new(storage.clone());
    SummaryService::new(store.clone(), store.clone(), Arc::new(StreamMetaTracker::new()))
        .with_workflows(store)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
