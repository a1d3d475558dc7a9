//! Redis-backed notification store.
//!
//! Layout:
//! - `notification:{id}` — the record as JSON
//! - `notifications:all` — set of every id
//! - `notifications:pending` — sorted set of schedulable ids, scored by due time (unix ms)
//!
//! Every command goes through the bounded retry in `courier_common::retry`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Cmd, FromRedisValue, Pipeline};

use courier_common::retry::{RetryStrategy, retry};
use courier_common::types::Notification;

use crate::{Mutator, Store, StoreError, StoreResult, needs_reindex};

const ALL_KEY: &str = "notifications:all";
const DUE_KEY: &str = "notifications:pending";

fn record_key(id: &str) -> String {
    format!("notification:{}", id)
}

fn due_score(notification: &Notification) -> i64 {
    notification.due_at().timestamp_millis()
}

/// Notification store on top of a shared Redis connection manager.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> StoreResult<T> {
        let result = retry(RetryStrategy::OPERATION, || {
            let mut conn = self.conn.clone();
            async move { cmd.query_async(&mut conn).await }
        })
        .await?;
        Ok(result)
    }

    async fn query_pipe<T: FromRedisValue>(&self, pipe: &Pipeline) -> StoreResult<T> {
        let result = retry(RetryStrategy::OPERATION, || {
            let mut conn = self.conn.clone();
            async move { pipe.query_async(&mut conn).await }
        })
        .await?;
        Ok(result)
    }

    /// Load many records in one round trip, skipping ids whose record vanished
    /// or no longer parses.
    async fn load_many(&self, ids: &[String]) -> StoreResult<Vec<Notification>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| record_key(id)).collect();
        let raw: Vec<Option<String>> = self.query(redis::cmd("MGET").arg(&keys)).await?;

        let mut notifications = Vec::with_capacity(raw.len());
        for (id, data) in ids.iter().zip(raw) {
            let Some(data) = data else {
                continue;
            };
            match serde_json::from_str::<Notification>(&data) {
                Ok(notification) => notifications.push(notification),
                Err(e) => {
                    tracing::warn!(notification_id = %id, error = %e, "Skipping unreadable notification");
                }
            }
        }
        Ok(notifications)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn create(&self, notification: &Notification) -> StoreResult<()> {
        let data = serde_json::to_string(notification)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(record_key(&notification.id))
            .arg(&data)
            .ignore()
            .cmd("SADD")
            .arg(ALL_KEY)
            .arg(&notification.id)
            .ignore();
        if notification.status.is_schedulable() {
            pipe.cmd("ZADD")
                .arg(DUE_KEY)
                .arg(due_score(notification))
                .arg(&notification.id)
                .ignore();
        }

        self.query_pipe::<()>(&pipe).await?;

        tracing::debug!(notification_id = %notification.id, "Notification stored");
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> StoreResult<Option<Notification>> {
        let data: Option<String> = self.query(redis::cmd("GET").arg(record_key(id))).await?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, id: &str, mutator: Mutator) -> StoreResult<Notification> {
        // Read, mutate, write back. No WATCH or version check: a concurrent
        // update of the same id between the GET and the SET is overwritten.
        let before = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let mut after = before.clone();
        mutator(&mut after);
        after.updated_at = Utc::now();

        let data = serde_json::to_string(&after)?;
        self.query::<()>(redis::cmd("SET").arg(record_key(id)).arg(&data))
            .await?;

        if needs_reindex(&before, &after) {
            let mut pipe = redis::pipe();
            pipe.atomic().cmd("ZREM").arg(DUE_KEY).arg(id).ignore();
            if after.status.is_schedulable() {
                pipe.cmd("ZADD")
                    .arg(DUE_KEY)
                    .arg(due_score(&after))
                    .arg(id)
                    .ignore();
            }
            self.query_pipe::<()>(&pipe).await?;
        }

        Ok(after)
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("DEL")
            .arg(record_key(id))
            .ignore()
            .cmd("SREM")
            .arg(ALL_KEY)
            .arg(id)
            .ignore()
            .cmd("ZREM")
            .arg(DUE_KEY)
            .arg(id)
            .ignore();
        self.query_pipe::<()>(&pipe).await?;

        tracing::debug!(notification_id = %id, "Notification deleted");
        Ok(())
    }

    async fn get_all(&self) -> StoreResult<Vec<Notification>> {
        let ids: Vec<String> = self.query(redis::cmd("SMEMBERS").arg(ALL_KEY)).await?;
        self.load_many(&ids).await
    }

    async fn get_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Notification>> {
        let ids: Vec<String> = self
            .query(
                redis::cmd("ZRANGEBYSCORE")
                    .arg(DUE_KEY)
                    .arg("-inf")
                    .arg(now.timestamp_millis()),
            )
            .await?;
        self.load_many(&ids).await
    }
}
