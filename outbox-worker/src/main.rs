//! # Outbox
//!
//! Runs the outbox worker with its localhost HTTP bridge, or inspects and
//! drains the durable queue from the command line.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use outbox_core::{ConnectionStatus, QueueStatus, QueueStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use outbox_worker::metrics;
use outbox_worker::server;
use outbox_worker::{
    AppState, ConnectivityMonitor, FlushController, HttpTransport, Notifier, OutboxArgs,
    OutboxConfig, Worker,
};

#[derive(Debug, Parser)]
#[command(name = "outbox")]
#[command(about = "Offline-resilient request outbox")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    args: OutboxArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the worker and its HTTP bridge
    Serve,
    /// Print lane status as JSON
    Status {
        /// Only this lane (all known lanes if omitted)
        #[arg(long)]
        tag: Option<String>,
    },
    /// Drain queued requests once and exit
    ///
    /// Do not run this while `serve` is using the same data directory: the
    /// running worker must be the only process removing queued requests.
    Flush {
        /// Only this lane (all known lanes if omitted)
        #[arg(long)]
        tag: Option<String>,
    },
    /// Drop every queued request (stop `serve` first)
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

/// Initialize tracing with optional JSON format.
///
/// Set `RUST_LOG_FORMAT=json` for structured JSON logs (production).
/// Default is human-readable format (development).
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,outbox_worker=debug,tower_http=debug"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = OutboxConfig::try_from(cli.args)?;
    let store: Arc<dyn QueueStore> = Arc::new(
        config
            .open_store()
            .with_context(|| format!("opening queue at {}", config.queue_dir().display()))?,
    );

    match cli.command {
        Command::Serve => serve(&config, store).await,
        Command::Status { tag } => status(&config, store.as_ref(), tag),
        Command::Flush { tag } => flush(&config, store, tag).await,
        Command::Clear { yes } => clear(store.as_ref(), yes),
    }
}

async fn serve(config: &OutboxConfig, store: Arc<dyn QueueStore>) -> anyhow::Result<()> {
    let metrics_handle = metrics::init_metrics()
        .map_err(|e| anyhow::anyhow!("Failed to initialize Prometheus metrics: {}", e))?;
    tracing::info!("Prometheus metrics initialized");

    let transport = HttpTransport::new(config.api_base.clone(), config.request_timeout)?;
    let connectivity = ConnectivityMonitor::new(ConnectionStatus::Online);
    let worker = Worker::spawn(
        config,
        Arc::clone(&store),
        Arc::new(transport),
        connectivity.clone(),
    );

    let pending = store.count()?;
    tracing::info!(
        pending,
        api_base = %config.api_base,
        data_dir = %config.data_dir.display(),
        "Outbox worker ready"
    );

    let state = AppState::new(worker.clone(), store, connectivity);
    server::serve(state, Some(metrics_handle), config.port, shutdown_signal()).await?;

    worker.shutdown();
    worker.stopped().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    tracing::info!("Shutdown signal received");
}

/// Configured lanes plus any lane that currently holds items.
fn known_tags(config: &OutboxConfig, store: &dyn QueueStore) -> anyhow::Result<BTreeSet<String>> {
    let mut tags: BTreeSet<String> = config.tags.iter().cloned().collect();
    tags.extend(store.list_all()?.into_iter().map(|item| item.tag));
    Ok(tags)
}

fn status(config: &OutboxConfig, store: &dyn QueueStore, tag: Option<String>) -> anyhow::Result<()> {
    let items = store.list_all()?;
    let tags = match tag {
        Some(tag) => BTreeSet::from([tag]),
        None => known_tags(config, store)?,
    };
    let lanes: Vec<QueueStatus> = tags
        .into_iter()
        .map(|tag| QueueStatus::from_items(&tag, &items))
        .collect();
    println!("{}", serde_json::to_string_pretty(&lanes)?);
    Ok(())
}

async fn flush(
    config: &OutboxConfig,
    store: Arc<dyn QueueStore>,
    tag: Option<String>,
) -> anyhow::Result<()> {
    let tags = match tag {
        Some(tag) => BTreeSet::from([tag]),
        None => known_tags(config, store.as_ref())?,
    };
    let transport = HttpTransport::new(config.api_base.clone(), config.request_timeout)?;
    let controller = FlushController::new(
        store,
        Arc::new(transport),
        Notifier::default(),
        config.retention,
    );

    let mut reports = Vec::with_capacity(tags.len());
    for tag in tags {
        if let Some(report) = controller.flush(&tag).await {
            reports.push(report);
        }
    }
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

fn clear(store: &dyn QueueStore, yes: bool) -> anyhow::Result<()> {
    let count = store.count()?;
    if !yes {
        anyhow::bail!("refusing to drop {count} queued requests without --yes");
    }
    store.clear()?;
    tracing::info!(count, "Queue cleared");
    Ok(())
}
