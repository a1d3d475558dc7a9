//! Delivery processor.
//!
//! Consumes the ready channel and runs one delivery cycle per message:
//! 1. Decode the snapshot and requeue it if it is not due yet
//! 2. Re-read the authoritative record; drop it if gone or no longer deliverable
//! 3. Attempt delivery up to `max_retries - attempts` times with local backoff
//! 4. Count the cycle as one attempt, then finalize or schedule the next cycle

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use courier_common::config::AppConfig;
use courier_common::retry::{RetryStrategy, retry};
use courier_common::types::{Notification, Status};
use courier_notifier::DeliveryChannel;
use courier_queue::{
    Broker, ConsumeOptions, ConsumerHandle, Delivery, DeliveryHandler, Placement,
};
use courier_store::{Store, StoreError, mutator};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("notification {id} is not due until {send_at}")]
    NotYetDue { id: String, send_at: DateTime<Utc> },

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Backoff schedule for both retry layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sleep after the first failed try inside a cycle.
    pub inner_base: Duration,
    /// Multiplier applied to the inner sleep after each failed try.
    pub inner_factor: u32,
    /// Unit of the between-cycle backoff: a cycle leaving `attempts = n` waits `2^n` units.
    pub outer_unit: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            inner_base: config.retry_base_delay(),
            ..Self::default()
        }
    }

    /// Inner schedule for a cycle with `tries` delivery tries.
    fn inner(&self, tries: u32) -> RetryStrategy {
        RetryStrategy {
            attempts: tries,
            delay: self.inner_base,
            backoff: self.inner_factor,
        }
    }

    /// Delay before the next cycle once `attempts` cycles have failed.
    pub fn outer_backoff(&self, attempts: u32) -> Duration {
        self.outer_unit
            .saturating_mul(2u32.saturating_pow(attempts))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            inner_base: Duration::from_secs(1),
            inner_factor: 2,
            outer_unit: Duration::from_secs(1),
        }
    }
}

/// Why a message was acknowledged without a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Payload did not decode into a notification.
    Malformed,
    /// The record was deleted.
    Missing,
    /// The record already reached a terminal status.
    Terminal(Status),
}

/// Result of handling one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Dropped(DropReason),
    Sent,
    Failed,
    Rescheduled {
        attempts: u32,
        next_retry: DateTime<Utc>,
    },
}

/// How the inner delivery loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleResult {
    Delivered,
    /// Every try failed transiently.
    Exhausted,
    /// The channel reported a permanent failure.
    Aborted,
}

/// Apply a finished cycle to the stored record.
fn conclude_cycle(
    n: &mut Notification,
    result: CycleResult,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) {
    n.attempts += 1;
    match result {
        CycleResult::Delivered => {
            n.status = Status::Sent;
            n.next_retry = None;
        }
        CycleResult::Exhausted if n.attempts < n.max_retries => {
            let next_retry = chrono::Duration::from_std(policy.outer_backoff(n.attempts))
                .ok()
                .and_then(|delay| now.checked_add_signed(delay));
            match next_retry {
                Some(next_retry) => {
                    n.status = Status::Retrying;
                    n.next_retry = Some(next_retry);
                    n.send_at = next_retry;
                }
                None => {
                    n.status = Status::Failed;
                    n.next_retry = None;
                }
            }
        }
        CycleResult::Exhausted | CycleResult::Aborted => {
            n.status = Status::Failed;
            n.next_retry = None;
        }
    }
}

/// Reschedule publish results since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RescheduleCounts {
    pub published: u64,
    /// Published as a no-op: the retry lies beyond the delay horizon.
    pub deferred: u64,
    pub failed: u64,
}

#[derive(Default)]
struct RescheduleStats {
    published: AtomicU64,
    deferred: AtomicU64,
    failed: AtomicU64,
}

/// Consumer and retry engine for scheduled notifications.
pub struct Processor {
    store: Arc<dyn Store>,
    broker: Arc<dyn Broker>,
    channel: Arc<dyn DeliveryChannel>,
    policy: RetryPolicy,
    reschedules: Mutex<JoinSet<()>>,
    stats: Arc<RescheduleStats>,
    consumer: Mutex<Option<ConsumerHandle>>,
}

impl Processor {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn Broker>,
        channel: Arc<dyn DeliveryChannel>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            broker,
            channel,
            policy,
            reschedules: Mutex::new(JoinSet::new()),
            stats: Arc::new(RescheduleStats::default()),
            consumer: Mutex::new(None),
        }
    }

    /// Start consuming the ready channel.
    pub async fn start(
        self: &Arc<Self>,
        options: ConsumeOptions,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            anyhow::bail!("processor is already running");
        }

        let handler: Arc<dyn DeliveryHandler> = self.clone();
        let handle = self
            .broker
            .consume(handler, options, shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start consumer: {}", e))?;
        *consumer = Some(handle);

        tracing::info!(
            channel = self.channel.name(),
            workers = options.workers,
            prefetch = options.prefetch,
            "Processor started"
        );
        Ok(())
    }

    /// Stop accepting deliveries, let in-flight ones finish, and wait for
    /// outstanding reschedule publishes. Safe to call more than once.
    pub async fn stop(&self) {
        let consumer = self.consumer.lock().await.take();
        match consumer {
            Some(consumer) => consumer.shutdown().await,
            None => tracing::debug!("Processor consumer not running"),
        }

        let mut tasks = std::mem::take(&mut *self.reschedules.lock().await);
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Reschedule task panicked");
            }
        }

        let counts = self.reschedule_counts();
        tracing::info!(
            rescheduled = counts.published,
            deferred = counts.deferred,
            reschedule_failures = counts.failed,
            "Processor stopped"
        );
    }

    pub fn reschedule_counts(&self) -> RescheduleCounts {
        RescheduleCounts {
            published: self.stats.published.load(Ordering::Relaxed),
            deferred: self.stats.deferred.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    /// Run one delivery cycle for a consumed message.
    ///
    /// `Err` means the message should be requeued.
    pub async fn process(&self, delivery: &Delivery) -> Result<Outcome, ProcessError> {
        let snapshot: Notification = match serde_json::from_slice(&delivery.body) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "Dropping undecodable notification payload");
                return Ok(Outcome::Dropped(DropReason::Malformed));
            }
        };

        if snapshot.send_at > Utc::now() {
            tracing::debug!(
                notification_id = %snapshot.id,
                send_at = %snapshot.send_at,
                "Notification not due yet, requeueing"
            );
            return Err(ProcessError::NotYetDue {
                id: snapshot.id,
                send_at: snapshot.send_at,
            });
        }

        let Some(record) = self.store.get_by_id(&snapshot.id).await? else {
            tracing::info!(notification_id = %snapshot.id, "Notification no longer exists, dropping");
            return Ok(Outcome::Dropped(DropReason::Missing));
        };

        if record.status.is_terminal() {
            tracing::info!(
                notification_id = %record.id,
                status = %record.status,
                "Notification already finalized, dropping"
            );
            return Ok(Outcome::Dropped(DropReason::Terminal(record.status)));
        }

        if record.remaining_attempts() == 0 {
            self.store
                .update(
                    &record.id,
                    mutator(|n| {
                        n.status = Status::Failed;
                        n.next_retry = None;
                    }),
                )
                .await?;
            tracing::warn!(
                notification_id = %record.id,
                attempts = record.attempts,
                "Retry budget already spent, marking failed"
            );
            return Ok(Outcome::Failed);
        }

        if record.attempts > 0 {
            if let Err(e) = self
                .store
                .update(&record.id, mutator(|n| n.status = Status::Retrying))
                .await
            {
                tracing::warn!(notification_id = %record.id, error = %e, "Failed to mark notification in flight");
            }
        }

        let result = self.deliver(&record).await;

        let policy = self.policy;
        let updated = self
            .store
            .update(
                &record.id,
                mutator(move |n| conclude_cycle(n, result, &policy, Utc::now())),
            )
            .await?;

        match (updated.status, updated.next_retry) {
            (Status::Sent, _) => {
                tracing::info!(notification_id = %updated.id, attempts = updated.attempts, "Notification sent");
                Ok(Outcome::Sent)
            }
            (Status::Retrying, Some(next_retry)) => {
                tracing::info!(
                    notification_id = %updated.id,
                    attempts = updated.attempts,
                    next_retry = %next_retry,
                    "Delivery failed, retry scheduled"
                );
                let attempts = updated.attempts;
                self.schedule_retry(updated).await;
                Ok(Outcome::Rescheduled {
                    attempts,
                    next_retry,
                })
            }
            _ => {
                tracing::warn!(
                    notification_id = %updated.id,
                    attempts = updated.attempts,
                    status = %updated.status,
                    "Notification failed"
                );
                Ok(Outcome::Failed)
            }
        }
    }

    /// Inner loop: up to `remaining_attempts` tries with local backoff sleeps.
    async fn deliver(&self, record: &Notification) -> CycleResult {
        let tries = record.remaining_attempts();
        let schedule = self.policy.inner(tries);

        for attempt in 1..=tries {
            match self.channel.attempt(record).await {
                Ok(()) => return CycleResult::Delivered,
                Err(e) if e.is_permanent() => {
                    tracing::warn!(
                        notification_id = %record.id,
                        attempt,
                        error = %e,
                        "Delivery rejected permanently"
                    );
                    return CycleResult::Aborted;
                }
                Err(e) => {
                    tracing::debug!(
                        notification_id = %record.id,
                        attempt,
                        tries,
                        error = %e,
                        "Delivery attempt failed"
                    );
                    if attempt < tries {
                        tokio::time::sleep(schedule.delay_after(attempt)).await;
                    }
                }
            }
        }
        CycleResult::Exhausted
    }

    /// Publish the rescheduled record on a tracked background task.
    async fn schedule_retry(&self, record: Notification) {
        let broker = self.broker.clone();
        let stats = self.stats.clone();

        let mut tasks = self.reschedules.lock().await;
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            match retry(RetryStrategy::OPERATION, || broker.publish_delayed(&record)).await {
                Ok(Placement::Deferred) => {
                    stats.deferred.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        notification_id = %record.id,
                        next_retry = %record.send_at,
                        "Retry lies beyond the delay horizon and was not queued"
                    );
                }
                Ok(placement) => {
                    stats.published.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(notification_id = %record.id, placement = ?placement, "Retry queued");
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        notification_id = %record.id,
                        error = %e,
                        "Failed to queue retry"
                    );
                }
            }
        });
    }
}

#[async_trait]
impl DeliveryHandler for Processor {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        self.process(delivery).await?;
        Ok(())
    }
}
