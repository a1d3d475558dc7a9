//! HTTP webhook delivery channel.
//!
//! POSTs a JSON payload to a configured endpoint. Status codes are mapped onto
//! [`DeliveryError`] so the processor knows whether another attempt is worthwhile.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;

use courier_common::types::Notification;

use crate::{DeliveryChannel, DeliveryError};

/// Per-request timeout; a hung receiver counts as a transient failure.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Body sent to the webhook endpoint.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    id: &'a str,
    message: &'a str,
    send_at: chrono::DateTime<chrono::Utc>,
    attempt: u32,
}

/// Delivery channel backed by an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Map a non-success response status to a delivery error.
    ///
    /// 408, 429 and 5xx are transient. Any other 4xx is permanent.
    fn classify_status(status: StatusCode) -> Result<(), DeliveryError> {
        if status.is_success() {
            return Ok(());
        }
        let reason = format!("webhook responded with {}", status);
        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            Err(DeliveryError::Transient(reason))
        } else if status.is_client_error() {
            Err(DeliveryError::Permanent(reason))
        } else {
            Err(DeliveryError::Transient(reason))
        }
    }
}

#[async_trait]
impl DeliveryChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn attempt(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let payload = WebhookPayload {
            id: &notification.id,
            message: &notification.message,
            send_at: notification.send_at,
            attempt: notification.attempts + 1,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("webhook request failed: {}", e)))?;

        let status = response.status();
        Self::classify_status(status)?;

        tracing::debug!(
            notification_id = %notification.id,
            status = status.as_u16(),
            "Webhook accepted notification"
        );
        Ok(())
    }
}
