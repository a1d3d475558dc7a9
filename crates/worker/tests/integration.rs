//! End-to-end flows through the in-memory store and broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use courier_common::types::{Notification, Status};
use courier_notifier::{DeliveryChannel, DeliveryError};
use courier_queue::{Broker, BrokerConfig, ConsumeOptions, InMemoryBroker, Placement};
use courier_store::{MemoryStore, Store, mutator};
use courier_worker::{Processor, Reconciler, RetryPolicy};

/// Fails the first `fail_first` attempts, then succeeds.
struct FlakyChannel {
    fail_first: u32,
    calls: AtomicU32,
}

impl FlakyChannel {
    fn new(fail_first: u32) -> Self {
        Self {
            fail_first,
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryChannel for FlakyChannel {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn attempt(&self, _notification: &Notification) -> Result<(), DeliveryError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(DeliveryError::Transient("connection reset".into()));
        }
        Ok(())
    }
}

const POLICY: RetryPolicy = RetryPolicy {
    inner_base: Duration::from_millis(5),
    inner_factor: 2,
    outer_unit: Duration::from_millis(50),
};

struct Service {
    store: Arc<MemoryStore>,
    broker: Arc<InMemoryBroker>,
    channel: Arc<FlakyChannel>,
    processor: Arc<Processor>,
    shutdown: CancellationToken,
}

async fn start(channel: FlakyChannel, horizon: Duration) -> Service {
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(InMemoryBroker::new(BrokerConfig {
        horizon,
        ..BrokerConfig::default()
    }));
    let channel = Arc::new(channel);
    let processor = Arc::new(Processor::new(
        store.clone(),
        broker.clone(),
        channel.clone(),
        POLICY,
    ));
    let shutdown = CancellationToken::new();
    processor
        .start(ConsumeOptions::default(), shutdown.clone())
        .await
        .unwrap();
    Service {
        store,
        broker,
        channel,
        processor,
        shutdown,
    }
}

async fn wait_for_status(store: &MemoryStore, id: &str, status: Status) -> Notification {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let record = store.get_by_id(id).await.unwrap().unwrap();
            if record.status == status {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_delayed_notification_is_sent_once_due() {
    let svc = start(FlakyChannel::new(0), Duration::from_secs(60)).await;
    let n = Notification::new("hi", Utc::now() + chrono::Duration::milliseconds(300), 3);
    svc.store.create(&n).await.unwrap();

    let placement = svc.broker.publish_delayed(&n).await.unwrap();
    assert!(matches!(placement, Placement::Delayed(_)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(svc.channel.calls(), 0);

    let record = wait_for_status(&svc.store, &n.id, Status::Sent).await;
    assert_eq!(record.attempts, 1);
    assert_eq!(record.next_retry, None);
    assert!(Utc::now() >= n.send_at);

    svc.processor.stop().await;
    svc.shutdown.cancel();
}

#[tokio::test]
async fn test_cancelled_in_flight_notification_is_not_delivered() {
    let svc = start(FlakyChannel::new(0), Duration::from_secs(60)).await;
    let n = Notification::new("hi", Utc::now() + chrono::Duration::milliseconds(150), 3);
    svc.store.create(&n).await.unwrap();
    svc.broker.publish_delayed(&n).await.unwrap();

    svc.store
        .update(&n.id, mutator(|n| n.status = Status::Cancelled))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while svc.broker.delayed_len().await > 0 || svc.broker.ready_len().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    svc.processor.stop().await;

    assert_eq!(svc.channel.calls(), 0);
    let record = svc.store.get_by_id(&n.id).await.unwrap().unwrap();
    assert_eq!(record.status, Status::Cancelled);
    assert_eq!(record.attempts, 0);
}

#[tokio::test]
async fn test_failed_cycle_is_retried_through_delay_queue() {
    // max_retries 2: the first cycle makes two tries, both fail.
    let svc = start(FlakyChannel::new(2), Duration::from_secs(60)).await;
    let n = Notification::new("hi", Utc::now(), 2);
    svc.store.create(&n).await.unwrap();
    svc.broker.publish_delayed(&n).await.unwrap();

    let record = wait_for_status(&svc.store, &n.id, Status::Sent).await;
    assert_eq!(record.attempts, 2);
    assert_eq!(svc.channel.calls(), 3);

    svc.processor.stop().await;
    assert_eq!(svc.processor.reschedule_counts().published, 1);
    assert_eq!(svc.processor.reschedule_counts().failed, 0);
}

#[tokio::test]
async fn test_record_beyond_horizon_is_promoted_by_reconciler() {
    let svc = start(FlakyChannel::new(0), Duration::from_millis(100)).await;
    let n = Notification::new("later", Utc::now() + chrono::Duration::milliseconds(400), 3);
    svc.store.create(&n).await.unwrap();

    assert_eq!(
        svc.broker.publish_delayed(&n).await.unwrap(),
        Placement::Deferred
    );

    let reconciler = Arc::new(Reconciler::new(
        svc.store.clone(),
        svc.broker.clone(),
        Duration::from_millis(50),
        Duration::from_secs(24 * 60 * 60),
    ));
    let task = reconciler.spawn(svc.shutdown.clone());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        svc.store.get_by_id(&n.id).await.unwrap().unwrap().status,
        Status::Pending
    );

    let record = wait_for_status(&svc.store, &n.id, Status::Sent).await;
    assert_eq!(record.attempts, 1);
    assert_eq!(svc.channel.calls(), 1);

    reconciler.stop();
    task.await.unwrap();
    svc.processor.stop().await;
}
