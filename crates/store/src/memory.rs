//! In-memory store for tests and single-process runs.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use courier_common::types::Notification;

use crate::{Mutator, Store, StoreError, StoreResult, needs_reindex};

#[derive(Default)]
struct Inner {
    records: HashMap<String, Notification>,
    /// (due_at, id), ordered by time.
    due: BTreeSet<(DateTime<Utc>, String)>,
}

impl Inner {
    fn index(&mut self, notification: &Notification) {
        if notification.status.is_schedulable() {
            self.due
                .insert((notification.due_at(), notification.id.clone()));
        }
    }

    fn unindex(&mut self, notification: &Notification) {
        self.due.remove(&(notification.due_at(), notification.id.clone()));
    }
}

/// Store backed by a `HashMap` and a `BTreeSet` due-index behind one lock.
///
/// Updates run under the write lock, so unlike [`crate::RedisStore`] they never race.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in the due-index.
    pub async fn due_len(&self) -> usize {
        self.inner.read().await.due.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create(&self, notification: &Notification) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(previous) = inner.records.remove(&notification.id) {
            inner.unindex(&previous);
        }
        inner.index(notification);
        inner
            .records
            .insert(notification.id.clone(), notification.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> StoreResult<Option<Notification>> {
        Ok(self.inner.read().await.records.get(id).cloned())
    }

    async fn update(&self, id: &str, mutator: Mutator) -> StoreResult<Notification> {
        let mut inner = self.inner.write().await;
        let before = inner
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let mut after = before.clone();
        mutator(&mut after);
        after.updated_at = Utc::now();

        if needs_reindex(&before, &after) {
            inner.unindex(&before);
            inner.index(&after);
        }
        inner.records.insert(id.to_string(), after.clone());
        Ok(after)
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(previous) = inner.records.remove(id) {
            inner.unindex(&previous);
        }
        Ok(())
    }

    async fn get_all(&self) -> StoreResult<Vec<Notification>> {
        Ok(self.inner.read().await.records.values().cloned().collect())
    }

    async fn get_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Notification>> {
        let inner = self.inner.read().await;
        Ok(inner
            .due
            .iter()
            .take_while(|(due_at, _)| *due_at <= now)
            .filter_map(|(_, id)| inner.records.get(id).cloned())
            .collect())
    }
}
