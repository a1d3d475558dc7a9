//! Courier API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use courier_common::config::AppConfig;
use courier_common::redis_pool::create_redis_pool;
use courier_queue::{Broker, BrokerConfig, RedisBroker};
use courier_store::{RedisStore, Store};

use courier_api::routes::create_router;
use courier_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("courier_api=info,courier_store=info,courier_queue=info,tower_http=info")
        }))
        .json()
        .init();

    tracing::info!("Starting Courier API server...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect store and broker
    let store: Arc<dyn Store> = Arc::new(RedisStore::new(create_redis_pool(&config.redis_url).await?));
    tracing::info!("Store connection established");

    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::new(
        create_redis_pool(&config.broker_url).await?,
        BrokerConfig::from_config(&config),
    ));
    tracing::info!("Broker connection established");

    // Build application state
    let port = config.port;
    let state = AppState::new(store, broker.clone(), config);

    // Build router
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    broker.close();
    tracing::info!("Courier API server stopped.");
    Ok(())
}
