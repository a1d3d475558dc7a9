//! Integration tests for the Redis broker.
//!
//! Requires a running Redis; these tests share the channel keys, so use a
//! throwaway database and run them one at a time:
//!
//! ```bash
//! REDIS_URL="redis://localhost:6379/15" \
//!   cargo test -p courier-queue --test redis_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use courier_common::redis_pool::create_redis_pool;
use courier_common::types::Notification;
use courier_queue::{
    Broker, BrokerConfig, ConsumeOptions, DELAYED_CHANNEL, Delivery, DeliveryHandler, Placement,
    READY_CHANNEL, RedisBroker,
};

async fn connect() -> (RedisBroker, redis::aio::ConnectionManager) {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/15".to_string());
    let mut conn = create_redis_pool(&url).await.unwrap();
    let _: () = redis::cmd("DEL")
        .arg(READY_CHANNEL)
        .arg(DELAYED_CHANNEL)
        .query_async(&mut conn)
        .await
        .unwrap();
    let config = BrokerConfig {
        consumer_tag: format!("test-{}", uuid::Uuid::new_v4()),
        ..BrokerConfig::default()
    };
    (RedisBroker::new(conn.clone(), config), conn)
}

#[derive(Default)]
struct Collect {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl DeliveryHandler for Collect {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        let n: Notification = serde_json::from_slice(&delivery.body)?;
        self.seen.lock().await.push(n.id);
        Ok(())
    }
}

#[tokio::test]
#[ignore]
async fn test_delayed_message_is_redirected_after_expiry() {
    let (broker, mut conn) = connect().await;
    let n = Notification::new(
        "delayed",
        Utc::now() + chrono::Duration::milliseconds(300),
        3,
    );

    assert!(matches!(
        broker.publish_delayed(&n).await.unwrap(),
        Placement::Delayed(_)
    ));
    assert_eq!(broker.promote_expired().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(broker.promote_expired().await.unwrap(), 1);

    let ready: usize = redis::cmd("LLEN")
        .arg(READY_CHANNEL)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(ready, 1);
}

#[tokio::test]
#[ignore]
async fn test_beyond_horizon_publishes_nothing() {
    let (broker, mut conn) = connect().await;
    let n = Notification::new("later", Utc::now() + chrono::Duration::seconds(120), 3);
    assert_eq!(broker.publish_delayed(&n).await.unwrap(), Placement::Deferred);

    let delayed: usize = redis::cmd("ZCARD")
        .arg(DELAYED_CHANNEL)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(delayed, 0);
}

#[tokio::test]
#[ignore]
async fn test_consumer_receives_immediate_publish() {
    let (broker, _conn) = connect().await;
    let handler = Arc::new(Collect::default());
    let consumer = broker
        .consume(handler.clone(), ConsumeOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    let n = Notification::new("now", Utc::now(), 3);
    broker.publish_immediate(&n).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while handler.seen.lock().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    consumer.shutdown().await;
    broker.close();
    assert_eq!(handler.seen.lock().await[0], n.id);
}
