use clap::Parser;
use dotenv::dotenv;
use std::sync::Arc;
use tokio::signal;

mod api;
mod cli;
mod config;
mod error;
mod geo;
mod gossip;
mod models;
mod node_cache;
mod store;

use cli::Cli;
use config::{Config, GeoBackendKind};
use error::AppError;
use geo::{FileBackend, GeoBackend, GeoResolver, IpApiBackend};
use gossip::GossipCommandSource;
use models::AppState;
use node_cache::NodeCache;
use store::{KvStore, MemoryStore, RedisStore};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize environment
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Parse command-line arguments
    let cli = Cli::parse();
    let config = Config::from_cli(&cli).map_err(into_io_error)?;

    tracing::info!(
        "Cache configured with refresh interval {}s, geo TTL {}s",
        config.refresh_interval.as_secs(),
        config.geo_ttl.as_secs()
    );

    // Setup the cache store, falling back to memory if Redis is down
    let store: Arc<dyn KvStore> = match &cli.redis_url {
        Some(url) => match RedisStore::new(url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::warn!("Failed to initialize Redis cache: {}", e);
                tracing::info!("Continuing with in-memory cache");
                Arc::new(MemoryStore::new())
            }
        },
        None => {
            tracing::info!("No REDIS_URL provided, using in-memory cache");
            Arc::new(MemoryStore::new())
        }
    };

    // Geo backend is chosen once at startup; the resolver itself is
    // backend-agnostic.
    let backend: Arc<dyn GeoBackend> = match &config.geo_backend {
        GeoBackendKind::File(path) => Arc::new(FileBackend::load(path).map_err(into_io_error)?),
        GeoBackendKind::IpApi => {
            Arc::new(IpApiBackend::new(config.geo_timeout).map_err(into_io_error)?)
        }
    };

    let resolver = GeoResolver::new(
        backend,
        store.clone(),
        config.geo_ttl,
        config.geo_timeout,
        config.geo_spacing,
    );

    let source = Arc::new(GossipCommandSource::new(
        config.gossip_command.clone(),
        config.command_timeout,
    ));

    let cache = Arc::new(NodeCache::new(
        source,
        resolver,
        store,
        config.refresh_interval,
        config.geo_concurrency,
    ));
    cache.warm().await;

    // Start the web server
    let app = api::router(AppState { cache });
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Server started at http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!("Error handling shutdown signal: {}", e);
        return;
    }
    tracing::info!("Received shutdown signal, beginning graceful shutdown...");
}

fn into_io_error(err: AppError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
}
