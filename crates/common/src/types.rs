use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a scheduled notification.
///
/// `Retrying` carries two meanings: the reconciler uses it for "promoted and in flight",
/// the processor uses it for "a cycle failed and a retry is scheduled".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Retrying,
    Sent,
    Failed,
    Cancelled,
}

impl Status {
    /// Statuses that keep a record in the due-index.
    pub fn is_schedulable(self) -> bool {
        matches!(self, Status::Pending | Status::Retrying)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Sent | Status::Failed | Status::Cancelled)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Pending => write!(f, "pending"),
            Status::Retrying => write!(f, "retrying"),
            Status::Sent => write!(f, "sent"),
            Status::Failed => write!(f, "failed"),
            Status::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A notification scheduled for delivery at `send_at`.
///
/// This is the persisted shape: every store writes it as JSON, and queued messages carry a
/// copy of it. A queued copy is only a snapshot; the store holds the authoritative record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub message: String,
    pub send_at: DateTime<Utc>,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry: Option<DateTime<Utc>>,
}

impl Notification {
    /// Build a fresh pending record with a time-ordered id.
    pub fn new(message: impl Into<String>, send_at: DateTime<Utc>, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: new_notification_id(),
            message: message.into(),
            send_at,
            status: Status::Pending,
            created_at: now,
            updated_at: now,
            attempts: 0,
            max_retries,
            next_retry: None,
        }
    }

    /// Timestamp at which the record becomes actionable, i.e. its due-index key.
    pub fn due_at(&self) -> DateTime<Utc> {
        match (self.status, self.next_retry) {
            (Status::Retrying, Some(next_retry)) => next_retry,
            _ => self.send_at,
        }
    }

    /// Delivery cycles left before the record must be failed.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_retries.saturating_sub(self.attempts)
    }
}

/// Generate a notification id. UUIDv7 strings sort lexically by creation time.
pub fn new_notification_id() -> String {
    Uuid::now_v7().to_string()
}

/// Record counts per status, as reported by the metrics endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub retrying: usize,
    pub sent: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn tally<'a>(records: impl IntoIterator<Item = &'a Notification>) -> Self {
        let mut counts = Self::default();
        for record in records {
            counts.total += 1;
            match record.status {
                Status::Pending => counts.pending += 1,
                Status::Retrying => counts.retrying += 1,
                Status::Sent => counts.sent += 1,
                Status::Failed => counts.failed += 1,
                Status::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }
}
