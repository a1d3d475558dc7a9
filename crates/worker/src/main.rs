use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use courier_common::config::AppConfig;
use courier_common::redis_pool::create_redis_pool;
use courier_notifier::{DeliveryChannel, LogChannel, WebhookChannel};
use courier_queue::{Broker, BrokerConfig, ConsumeOptions, RedisBroker};
use courier_store::{RedisStore, Store};
use courier_worker::{Processor, Reconciler, RetryPolicy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_worker=info,courier_queue=info,courier_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect store and broker
    let store: Arc<dyn Store> = Arc::new(RedisStore::new(create_redis_pool(&config.redis_url).await?));
    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::new(
        create_redis_pool(&config.broker_url).await?,
        BrokerConfig::from_config(&config),
    ));

    let channel: Arc<dyn DeliveryChannel> = match &config.webhook_url {
        Some(url) => Arc::new(WebhookChannel::new(url.clone())?),
        None => Arc::new(LogChannel),
    };
    tracing::info!(channel = channel.name(), "Delivery channel selected");

    let shutdown = CancellationToken::new();

    let reconciler = Arc::new(Reconciler::from_config(store.clone(), broker.clone(), &config));
    let reconciler_task = reconciler.spawn(shutdown.clone());

    let processor = Arc::new(Processor::new(
        store,
        broker.clone(),
        channel,
        RetryPolicy::from_config(&config),
    ));
    processor
        .start(
            ConsumeOptions {
                workers: config.worker_count,
                prefetch: config.worker_prefetch,
            },
            shutdown.clone(),
        )
        .await?;

    tracing::info!(consumer_tag = %config.consumer_tag, "Worker started successfully");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");

    reconciler.stop();
    if let Err(e) = reconciler_task.await {
        tracing::error!(error = %e, "Reconciler task panicked");
    }
    processor.stop().await;
    shutdown.cancel();
    broker.close();

    tracing::info!("Courier worker stopped.");
    Ok(())
}
