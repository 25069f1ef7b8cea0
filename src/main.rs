use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use voting_cluster::config::StoreArgs;
use voting_cluster::storage::handlers::{StoreNode, router};
use voting_cluster::storage::replication::{DurableSubstrate, normalize_url};
use voting_cluster::storage::{CounterStore, InMemorySubstrate, ReplicationSubstrate};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = StoreArgs::parse();
    let primary_addr = args.primary_addr().map(normalize_url);

    tracing::info!("Starting store node on {} as {:?}", args.bind, args.role);
    if let Some(primary) = &primary_addr {
        tracing::info!("Primary: {}", primary);
    }

    // 1. Replication substrate:
    let substrate: Arc<dyn ReplicationSubstrate> = match &args.data_dir {
        Some(dir) => {
            tracing::info!("Commit logs in {}", dir.display());
            if !args.backups.is_empty() {
                tracing::info!("Backups: {:?}", args.backups);
            }
            Arc::new(DurableSubstrate::new(
                dir.clone(),
                args.role,
                primary_addr,
                args.backups.clone(),
            )?)
        }
        None => {
            tracing::warn!("No data directory configured; votes are kept in memory only");
            Arc::new(InMemorySubstrate::new(args.role, primary_addr))
        }
    };

    // 2. Counter store (replays recovered commits):
    let store = Arc::new(CounterStore::open(substrate).await?);

    // 3. HTTP Router:
    let shutdown = CancellationToken::new();
    let node = Arc::new(StoreNode::new(store, shutdown.clone(), args.conflict_retries));
    let app = router(node);

    // 4. Start HTTP server:
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!("HTTP server listening on {}", listener.local_addr()?);
    tracing::info!("Press Ctrl+C to shutdown");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
