//! Delivery channels, the last hop of a notification.
//!
//! A channel makes exactly one delivery attempt per call and reports the outcome.
//! Retry and backoff policy belongs to the processor, never to a channel.

pub mod log_channel;
pub mod webhook;

use async_trait::async_trait;
use thiserror::Error;

use courier_common::types::Notification;

pub use log_channel::LogChannel;
pub use webhook::WebhookChannel;

/// Why a delivery attempt did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Worth another attempt (timeouts, 5xx, rate limiting).
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// The receiver rejected the notification; further attempts will not help.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::Permanent(_))
    }
}

/// Capability that attempts to hand a notification to its recipient.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Short channel name for logs.
    fn name(&self) -> &'static str;

    /// Make one delivery attempt.
    async fn attempt(&self, notification: &Notification) -> Result<(), DeliveryError>;
}
