//! Notification store: durable records plus a time-ordered due-index.
//!
//! The due-index holds exactly the records whose status is Pending or Retrying,
//! keyed by [`Notification::due_at`]. Both implementations keep that invariant
//! on every write.

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use courier_common::error::AppError;
use courier_common::types::Notification;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Closure applied to a record by [`Store::update`].
pub type Mutator = Box<dyn FnOnce(&mut Notification) + Send>;

/// Box a closure as a [`Mutator`].
pub fn mutator(f: impl FnOnce(&mut Notification) + Send + 'static) -> Mutator {
    Box::new(f)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("notification {0} not found")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => AppError::NotFound(format!("Notification {} not found", id)),
            other => AppError::Store(other.to_string()),
        }
    }
}

/// Storage capability shared by the API, the reconciler and the processor.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a record and index it.
    async fn create(&self, notification: &Notification) -> StoreResult<()>;

    /// Fetch a record. A missing id is `Ok(None)`, not an error.
    async fn get_by_id(&self, id: &str) -> StoreResult<Option<Notification>>;

    /// Read-modify-write a record, stamping `updated_at` and re-indexing it.
    ///
    /// Not guaranteed to be atomic: two concurrent updates of the same id may
    /// race, and the later write wins.
    async fn update(&self, id: &str, mutator: Mutator) -> StoreResult<Notification>;

    /// Remove a record and all of its index entries.
    async fn delete(&self, id: &str) -> StoreResult<()>;

    /// All records, in no particular order.
    async fn get_all(&self) -> StoreResult<Vec<Notification>>;

    /// Records whose due-index key is at or before `now`.
    async fn get_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Notification>>;
}

/// Whether an update moved the record within (or in or out of) the due-index.
pub(crate) fn needs_reindex(before: &Notification, after: &Notification) -> bool {
    before.status != after.status
        || (after.status.is_schedulable() && before.due_at() != after.due_at())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::types::Status;

    #[test]
    fn test_needs_reindex_on_status_change() {
        let before = Notification::new("a", Utc::now(), 3);
        let mut after = before.clone();
        after.status = Status::Retrying;
        assert!(needs_reindex(&before, &after));
    }

    #[test]
    fn test_needs_reindex_when_retry_time_moves() {
        let mut before = Notification::new("a", Utc::now(), 3);
        before.status = Status::Retrying;
        let mut after = before.clone();
        after.next_retry = Some(before.send_at + chrono::Duration::seconds(4));
        assert!(needs_reindex(&before, &after));

        let mut terminal = before.clone();
        terminal.status = Status::Sent;
        let mut later = terminal.clone();
        later.attempts += 1;
        assert!(!needs_reindex(&terminal, &later));
    }
}
