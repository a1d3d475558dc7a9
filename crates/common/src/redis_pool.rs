use redis::Client;
use redis::aio::ConnectionManager;

use crate::retry::{RetryStrategy, retry};

/// Create a Redis connection manager for async operations.
///
/// The first connection is retried with backoff so the service can start before Redis does.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let manager = retry(RetryStrategy::CONNECT, || ConnectionManager::new(client.clone())).await?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}
