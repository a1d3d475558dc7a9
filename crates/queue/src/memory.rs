//! In-process broker with the same channel semantics as the Redis broker.
//!
//! Delayed messages sit in a min-heap keyed by expiry instant and are moved to
//! the ready queue whenever the ready queue is read.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use courier_common::types::Notification;

use crate::consumer::{ReadySource, spawn_consumer};
use crate::{
    Broker, BrokerConfig, ConsumeOptions, ConsumerHandle, DeliveryHandler, Envelope, Placement,
    QueueError, QueueResult, linked_token, placement,
};

#[derive(Default)]
struct Channels {
    ready: VecDeque<String>,
    /// (expires_at, publish sequence, raw)
    delayed: BinaryHeap<Reverse<(Instant, u64, String)>>,
    seq: u64,
}

impl Channels {
    /// Redirect every expired delayed message to the ready queue.
    fn promote_expired(&mut self, now: Instant) {
        while let Some(Reverse((expires_at, _, _))) = self.delayed.peek() {
            if *expires_at > now {
                break;
            }
            if let Some(Reverse((_, _, raw))) = self.delayed.pop() {
                self.ready.push_back(raw);
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse((at, _, _))| *at)
    }
}

struct Shared {
    channels: Mutex<Channels>,
    notify: Notify,
}

#[async_trait]
impl ReadySource for Shared {
    async fn fetch(&self) -> QueueResult<Option<String>> {
        let mut channels = self.channels.lock().await;
        channels.promote_expired(Instant::now());
        Ok(channels.ready.pop_front())
    }

    async fn wait(&self, idle: Duration) {
        let deadline = {
            let channels = self.channels.lock().await;
            let idle_deadline = Instant::now() + idle;
            channels
                .next_expiry()
                .map_or(idle_deadline, |at| at.min(idle_deadline))
        };
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }

    async fn ack(&self, _raw: &str) -> QueueResult<()> {
        Ok(())
    }

    async fn requeue(&self, raw: &str) -> QueueResult<()> {
        self.channels.lock().await.ready.push_front(raw.to_string());
        self.notify.notify_one();
        Ok(())
    }
}

/// Broker living entirely inside the process.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
    config: BrokerConfig,
    closed: CancellationToken,
}

impl InMemoryBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                channels: Mutex::new(Channels::default()),
                notify: Notify::new(),
            }),
            config,
            closed: CancellationToken::new(),
        }
    }

    /// Messages currently consumable from the ready channel.
    pub async fn ready_len(&self) -> usize {
        let mut channels = self.shared.channels.lock().await;
        channels.promote_expired(Instant::now());
        channels.ready.len()
    }

    /// Messages still waiting in the delayed channel.
    pub async fn delayed_len(&self) -> usize {
        let mut channels = self.shared.channels.lock().await;
        channels.promote_expired(Instant::now());
        channels.delayed.len()
    }

    /// Take the next ready message's notification snapshot without a consumer.
    pub async fn pop_ready(&self) -> QueueResult<Option<Notification>> {
        let Some(raw) = self.shared.fetch().await? else {
            return Ok(None);
        };
        let envelope: Envelope = serde_json::from_str(&raw)?;
        Ok(Some(serde_json::from_str(&envelope.body)?))
    }

    async fn push_ready(&self, raw: String) {
        self.shared.channels.lock().await.ready.push_back(raw);
        self.shared.notify.notify_one();
    }

    async fn push_delayed(&self, raw: String, expiry: Option<Duration>) {
        let expires_at = Instant::now() + self.config.effective_expiry(expiry);
        let mut channels = self.shared.channels.lock().await;
        channels.seq += 1;
        let seq = channels.seq;
        channels.delayed.push(Reverse((expires_at, seq, raw)));
        drop(channels);
        // Wake the fetcher so it re-arms its sleep for an earlier expiry.
        self.shared.notify.notify_one();
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }
        Ok(())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish_delayed(&self, notification: &Notification) -> QueueResult<Placement> {
        self.ensure_open()?;
        let placed = placement(notification.send_at, Utc::now(), self.config.max_delay());
        match placed {
            Placement::Deferred => {
                tracing::debug!(
                    notification_id = %notification.id,
                    "Beyond delay horizon, left to reconciler"
                );
            }
            Placement::Ready => self.push_ready(Envelope::seal(notification)?).await,
            Placement::Delayed(delay) => {
                self.push_delayed(Envelope::seal(notification)?, Some(delay))
                    .await
            }
        }
        Ok(placed)
    }

    async fn publish_immediate(&self, notification: &Notification) -> QueueResult<()> {
        self.ensure_open()?;
        self.push_ready(Envelope::seal(notification)?).await;
        Ok(())
    }

    async fn consume(
        &self,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumeOptions,
        shutdown: CancellationToken,
    ) -> QueueResult<ConsumerHandle> {
        self.ensure_open()?;
        let stop = linked_token(&shutdown, &self.closed);
        let source: Arc<dyn ReadySource> = self.shared.clone();
        let tasks = spawn_consumer(source, handler, options, stop.clone());
        Ok(ConsumerHandle::new(stop, tasks))
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
