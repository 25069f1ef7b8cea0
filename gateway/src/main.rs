use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use voting_cluster::config::GatewayArgs;
use voting_cluster::gateway::handlers::{GatewayState, router};
use voting_cluster::gateway::{
    PartitionGateway, PartitionResolver, Partitioner, ReplicaSetResolver, StaticResolver,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = GatewayArgs::parse();

    let resolver: Arc<dyn PartitionResolver> = match args.replicas.as_slice() {
        [] => anyhow::bail!("at least one replica address is required"),
        [single] => {
            tracing::info!("Routing every partition to {}", single);
            Arc::new(StaticResolver::new(single.clone()))
        }
        many => {
            tracing::info!("Probing {} replicas for primaries", many.len());
            Arc::new(ReplicaSetResolver::new(many.to_vec()))
        }
    };

    let gateway = PartitionGateway::new(Partitioner::new(args.partitions), resolver)
        .with_timeout(Duration::from_millis(args.timeout_ms));

    let state = GatewayState {
        gateway: Arc::new(gateway),
        static_dir: args.static_dir.clone(),
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!("Gateway listening on {}", listener.local_addr()?);
    tracing::info!("Serving static files from {}", args.static_dir.display());

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
