//! Delay-queue broker.
//!
//! Two channels: `notifications.ready`, consumed by the processor, and
//! `notifications.delayed`, whose messages are redirected into the ready channel
//! once their expiry elapses. A record due further out than the horizon, or than
//! the delayed channel's TTL, is not published at all; the reconciler promotes
//! it when it becomes due.

pub mod consumer;
pub mod memory;
pub mod redis_broker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use courier_common::config::AppConfig;
use courier_common::error::AppError;
use courier_common::types::Notification;

pub use consumer::ConsumerHandle;
pub use memory::InMemoryBroker;
pub use redis_broker::RedisBroker;

pub const READY_CHANNEL: &str = "notifications.ready";
pub const DELAYED_CHANNEL: &str = "notifications.delayed";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker is closed")]
    Closed,
}

pub type QueueResult<T> = Result<T, QueueError>;

impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        AppError::Broker(e.to_string())
    }
}

/// Broker settings shared by every implementation.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Longest delay expressed through the delayed channel.
    pub horizon: Duration,
    /// Expiry the delayed channel applies when a message carries none; also an upper cap.
    pub delayed_ttl: Duration,
    /// Identifies this consumer's unacked list.
    pub consumer_tag: String,
}

impl BrokerConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            horizon: config.delay_horizon(),
            delayed_ttl: config.delayed_queue_ttl(),
            consumer_tag: config.consumer_tag.clone(),
        }
    }

    /// Longest delay the delayed channel can hold without redirecting early.
    pub fn max_delay(&self) -> Duration {
        self.horizon.min(self.delayed_ttl)
    }

    /// Expiry actually applied to a delayed message: the smaller of its own and the channel's.
    pub fn effective_expiry(&self, per_message: Option<Duration>) -> Duration {
        match per_message {
            Some(expiry) => expiry.min(self.delayed_ttl),
            None => self.delayed_ttl,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            horizon: Duration::from_secs(60),
            delayed_ttl: Duration::from_secs(60),
            consumer_tag: "notifications-consumer".to_string(),
        }
    }
}

/// Where `publish_delayed` put a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Already due: published straight to the ready channel.
    Ready,
    /// Published to the delayed channel with this expiry.
    Delayed(Duration),
    /// Beyond the horizon: nothing published, left to the reconciler.
    Deferred,
}

/// Decide the placement of a record due at `send_at`.
pub fn placement(send_at: DateTime<Utc>, now: DateTime<Utc>, horizon: Duration) -> Placement {
    let delay = send_at - now;
    match delay.to_std() {
        // Negative: already overdue.
        Err(_) => Placement::Ready,
        Ok(delay) if delay.is_zero() => Placement::Ready,
        Ok(delay) if delay > horizon => Placement::Deferred,
        Ok(delay) => Placement::Delayed(delay),
    }
}

/// Wire format of a queued message.
///
/// `id` keeps two publishes of the same record distinct inside the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub id: String,
    pub body: String,
}

impl Envelope {
    pub fn seal(notification: &Notification) -> QueueResult<String> {
        let envelope = Envelope {
            id: uuid::Uuid::new_v4().to_string(),
            body: serde_json::to_string(notification)?,
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

/// A message handed to a [`DeliveryHandler`].
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Serialized notification snapshot taken at publish time.
    pub body: Vec<u8>,
}

impl Delivery {
    pub fn from_notification(notification: &Notification) -> QueueResult<Self> {
        Ok(Self {
            body: serde_json::to_vec(notification)?,
        })
    }
}

/// Consumer callback. `Ok` acknowledges the message; `Err` requeues it immediately.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()>;
}

/// Worker pool sizing for [`Broker::consume`].
#[derive(Debug, Clone, Copy)]
pub struct ConsumeOptions {
    pub workers: usize,
    pub prefetch: usize,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            workers: 3,
            prefetch: 10,
        }
    }
}

/// Delay-queue broker capability.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Schedule a record for delivery at its `send_at`, within the horizon.
    async fn publish_delayed(&self, notification: &Notification) -> QueueResult<Placement>;

    /// Publish straight to the ready channel, ignoring `send_at`.
    async fn publish_immediate(&self, notification: &Notification) -> QueueResult<()>;

    /// Start consuming the ready channel with a fixed worker pool.
    ///
    /// Consumption ends when `shutdown` is cancelled, the returned handle is
    /// stopped, or the broker is closed.
    async fn consume(
        &self,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumeOptions,
        shutdown: CancellationToken,
    ) -> QueueResult<ConsumerHandle>;

    /// Close the broker. Later publishes fail with [`QueueError::Closed`]. Idempotent.
    fn close(&self);
}

/// Token cancelled when either `shutdown` or `closed` is.
pub(crate) fn linked_token(
    shutdown: &CancellationToken,
    closed: &CancellationToken,
) -> CancellationToken {
    let token = closed.child_token();
    let shutdown = shutdown.clone();
    let linked = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => linked.cancel(),
            _ = linked.cancelled() => {}
        }
    });
    token
}
