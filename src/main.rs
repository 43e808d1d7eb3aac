use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use clap::Parser;
use grid_cache::config::{CacheConfig, DEFAULT_BACKUPS, DEFAULT_PARTITIONS};
use grid_cache::membership::discovery::bridge_gossip;
use grid_cache::membership::service::MembershipService;
use grid_cache::messaging::protocol::ENDPOINT_MESSAGE;
use grid_cache::messaging::transport::HttpTransport;
use grid_cache::node::handlers::{
    handle_get, handle_message, handle_put, handle_remove, handle_stats, handle_tx,
};
use grid_cache::node::node::CacheNode;
use grid_cache::txn::store::{CacheStore, InMemoryStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "grid-cache-node", about = "Partitioned transactional cache node")]
struct Args {
    /// Gossip (UDP) address; the HTTP endpoint listens on port + 1000.
    #[arg(long)]
    bind: SocketAddr,

    /// Gossip address of an existing member. Repeatable.
    #[arg(long)]
    seed: Vec<SocketAddr>,

    #[arg(long, default_value_t = DEFAULT_PARTITIONS)]
    partitions: u32,

    #[arg(long, default_value_t = DEFAULT_BACKUPS)]
    backups: usize,

    /// Transaction timeout in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    tx_timeout_ms: u64,

    /// Skip preloading; MOVING partitions are owned right after an exchange.
    #[arg(long)]
    no_preload: bool,

    /// Back the cache with an in-memory store (write-through and read-through).
    #[arg(long)]
    with_store: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let http_addr = SocketAddr::new(args.bind.ip(), args.bind.port() + 1000);
    tracing::info!("Starting node on {} (http {})", args.bind, http_addr);
    if args.seed.is_empty() {
        tracing::info!("Starting as seed node (founder)");
    } else {
        tracing::info!("Seed nodes: {:?}", args.seed);
    }

    // 1. Membership (UDP gossip):
    let membership = MembershipService::new(args.bind, http_addr, args.seed.clone()).await?;
    tracing::info!("Node ID: {}", membership.local_node.id);

    // 2. Cache node:
    let config = CacheConfig::default()
        .with_partitions(args.partitions)
        .with_backups(args.backups)
        .with_tx_timeout(Duration::from_millis(args.tx_timeout_ms))
        .with_preload(!args.no_preload);
    config.validate()?;

    let transport = Arc::new(HttpTransport::new(config.network_timeout));
    let store: Option<Arc<dyn CacheStore>> = if args.with_store {
        Some(Arc::new(InMemoryStore::new()))
    } else {
        None
    };
    let node = CacheNode::new(
        config,
        membership.local_node.cluster_node(),
        transport,
        store,
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    node.start(events_rx);

    // 3. HTTP Router:
    let app = Router::new()
        .route(ENDPOINT_MESSAGE, post(handle_message))
        .route("/put", post(handle_put))
        .route("/get/:key", get(handle_get))
        .route("/remove/:key", post(handle_remove))
        .route("/tx", post(handle_tx))
        .route("/stats", get(handle_stats))
        .layer(Extension(node.clone()));

    // 4. Spawn membership service and feed its events to the cache:
    let service = membership.clone();
    tokio::spawn(async move {
        service.start().await;
    });
    bridge_gossip(membership.clone(), events_tx);

    // 5. Spawn stats reporter:
    let stats_node = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let stats = stats_node.stats();
            tracing::info!(
                "Cache stats: topology v{} (ready v{}), {} owning / {} moving / {} renting, {} entries, {} near, txs {:?}",
                stats.topology_version,
                stats.ready_version,
                stats.owning,
                stats.moving,
                stats.renting,
                stats.entries,
                stats.near_entries,
                stats.transactions
            );
        }
    });

    // 6. Start HTTP server:
    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            membership.leave().await;
        })
        .await?;

    node.stop();
    Ok(())
}
