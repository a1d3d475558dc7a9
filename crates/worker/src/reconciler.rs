//! Reconciler: promotes overdue Pending records the delay queue never carried.
//!
//! Records scheduled beyond the broker's horizon are not published at creation.
//! Each tick reads the due-index and publishes overdue Pending records straight
//! to the ready channel, marking them Retrying (here meaning "in flight").

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use courier_common::config::AppConfig;
use courier_common::retry::{RetryStrategy, retry_until};
use courier_common::types::Status;
use courier_queue::Broker;
use courier_store::{Store, StoreResult, mutator};

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub promoted: usize,
    /// Overdue by more than the lookback window; left alone.
    pub stale: usize,
    /// Publish or status update failed; retried next tick.
    pub failed: usize,
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    broker: Arc<dyn Broker>,
    tick: Duration,
    lookback: Duration,
    stop: CancellationToken,
    stopped: AtomicBool,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn Broker>,
        tick: Duration,
        lookback: Duration,
    ) -> Self {
        Self {
            store,
            broker,
            tick,
            lookback,
            stop: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn from_config(store: Arc<dyn Store>, broker: Arc<dyn Broker>, config: &AppConfig) -> Self {
        Self::new(
            store,
            broker,
            config.reconciler_tick(),
            config.reconciler_lookback(),
        )
    }

    /// Run the tick loop on its own task.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let reconciler = self.clone();
        tokio::spawn(async move { reconciler.run(shutdown).await })
    }

    /// Tick every interval until stopped or `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let period = self.tick.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            tick_secs = self.tick.as_secs_f64(),
            lookback_secs = self.lookback.as_secs(),
            "Reconciler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.stop.cancelled() => break,
                _ = shutdown.cancelled() => break,
            }

            match self.tick().await {
                Ok(report) if report == TickReport::default() => {}
                Ok(report) => tracing::info!(
                    promoted = report.promoted,
                    stale = report.stale,
                    failed = report.failed,
                    "Reconciler tick complete"
                ),
                Err(e) => tracing::warn!(error = %e, "Reconciler tick failed"),
            }
        }
        tracing::info!("Reconciler loop exited");
    }

    /// Stop the tick loop. Only the first call has an effect.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            tracing::warn!("Reconciler stop called more than once");
            return;
        }
        self.stop.cancel();
        tracing::info!("Reconciler stopped");
    }

    pub async fn tick(&self) -> StoreResult<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// One pass over the due-index as of `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> StoreResult<TickReport> {
        let cutoff = chrono::Duration::from_std(self.lookback)
            .ok()
            .and_then(|lookback| now.checked_sub_signed(lookback))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut report = TickReport::default();
        let due = self.store.get_due(now).await?;

        for record in due
            .into_iter()
            .filter(|n| n.status == Status::Pending && n.send_at <= now)
        {
            if record.send_at < cutoff {
                tracing::warn!(
                    notification_id = %record.id,
                    send_at = %record.send_at,
                    "Skipping notification overdue beyond lookback window"
                );
                report.stale += 1;
                continue;
            }

            let published = retry_until(RetryStrategy::OPERATION, &self.stop, || {
                self.broker.publish_immediate(&record)
            })
            .await;
            if let Err(e) = published {
                tracing::warn!(notification_id = %record.id, error = %e, "Failed to promote notification");
                report.failed += 1;
                continue;
            }

            let marked = self
                .store
                .update(
                    &record.id,
                    mutator(|n| {
                        if n.status == Status::Pending {
                            n.status = Status::Retrying;
                        }
                    }),
                )
                .await;
            match marked {
                Ok(_) => {
                    tracing::info!(notification_id = %record.id, "Promoted overdue notification");
                    report.promoted += 1;
                }
                Err(e) => {
                    tracing::warn!(notification_id = %record.id, error = %e, "Published but failed to mark in flight");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
