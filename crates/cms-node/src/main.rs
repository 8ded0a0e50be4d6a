//! # cms-node -- Binary Entry Point
//!
//! `run` (the default) starts both schedulers and the HTTP surface. The
//! other subcommands perform one unit of work and exit.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cms_chain_client::{ChainClientConfig, ChainHttpClient};
use cms_core::{ConsignmentId, SystemClock};
use cms_node::{LogFormat, Node, NodeConfig};
use cms_publisher::{
    ConsignmentStore, InMemoryConsignmentStore, PublisherConfig, TracingEventSink,
    WatchdogOutcome,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Publishes consignments to the ledger and reconciles their status.
#[derive(Parser, Debug)]
#[command(name = "cms-node", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the dispatcher and watchdog schedulers and the HTTP surface.
    Run,

    /// Run one dispatcher cycle and exit.
    DispatchOnce,

    /// Run one watchdog reconciliation and exit.
    WatchdogOnce,

    /// Make a ROLLBACKED consignment dispatchable again.
    Requeue {
        /// 64-character hex consignment id.
        consignment_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let node_config = NodeConfig::from_env().context("invalid node configuration")?;
    init_tracing(node_config.log_format);

    let publisher_config = PublisherConfig::from_env().map_err(|e| {
        tracing::error!("Publisher configuration rejected: {e}");
        e
    })?;
    let chain_config = ChainClientConfig::from_env().map_err(|e| {
        tracing::error!("Chain client configuration rejected: {e}");
        e
    })?;
    tracing::debug!(?chain_config, "chain client configured");

    let chain = Arc::new(ChainHttpClient::new(chain_config)?);

    let pool = cms_node::db::init_pool(node_config.database.as_ref())
        .await
        .map_err(|e| {
            tracing::error!("Database initialization failed: {e}");
            e
        })?;
    let store: Arc<dyn ConsignmentStore> = match pool {
        Some(pool) => Arc::new(cms_node::db::PgConsignmentStore::new(pool)),
        None => Arc::new(InMemoryConsignmentStore::new()),
    };

    let node = Node::assemble(
        publisher_config,
        node_config.organisations.clone(),
        store,
        chain.clone(),
        chain,
        Arc::new(TracingEventSink),
        Arc::new(SystemClock),
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(node, node_config.http_port).await,
        Command::DispatchOnce => {
            let report = node.dispatcher.run_once().await?;
            tracing::info!(?report, "dispatch cycle finished");
            Ok(())
        }
        Command::WatchdogOnce => {
            match node.watchdog.run_once().await? {
                WatchdogOutcome::NotSynced { tip } => {
                    tracing::info!(tip, "chain reader not synced, nothing reconciled");
                }
                WatchdogOutcome::Reconciled(report) => {
                    tracing::info!(?report, "watchdog run finished");
                }
            }
            Ok(())
        }
        Command::Requeue { consignment_id } => {
            let id = ConsignmentId::from_hex(consignment_id).context("invalid consignment id")?;
            let record = node.dispatcher.requeue(&id).await?;
            tracing::info!(
                consignment_id = %record.id(),
                status = %record.publish_status().as_str(),
                "consignment requeued"
            );
            Ok(())
        }
    }
}

async fn run(node: Node, port: u16) -> anyhow::Result<()> {
    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let jobs = node.start(shutdown_rx.clone());

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {e}");
            return;
        }
        tracing::info!("Shutdown requested, finishing in-flight runs");
        let _ = shutdown_tx.send(true);
    });

    let app = cms_node::app(node.app_state(Some(metrics)));
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("cms-node listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    for job in jobs {
        if let Err(e) = job.await {
            tracing::error!("Scheduled job task failed: {e}");
        }
    }
    tracing::info!("cms-node stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}
