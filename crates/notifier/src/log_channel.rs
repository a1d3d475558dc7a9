use async_trait::async_trait;

use courier_common::types::Notification;

use crate::{DeliveryChannel, DeliveryError};

/// Channel that "delivers" by writing the notification to the log.
///
/// Used when no outbound endpoint is configured.
#[derive(Debug, Default, Clone)]
pub struct LogChannel;

#[async_trait]
impl DeliveryChannel for LogChannel {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn attempt(&self, notification: &Notification) -> Result<(), DeliveryError> {
        tracing::info!(
            notification_id = %notification.id,
            attempts = notification.attempts,
            message = %notification.message,
            "Notification delivered"
        );
        Ok(())
    }
}
