//! Redis implementation of the delay-queue broker.
//!
//! - `notifications.ready` is a list: producers `LPUSH`, consumers take from the right.
//! - `notifications.delayed` is a sorted set scored by expiry (unix ms). A promoter
//!   task moves expired members into the ready list with one Lua script, so the
//!   redirect is atomic even with several workers promoting at once.
//! - Consumption `LMOVE`s each message into a per-consumer unacked list. Ack removes
//!   it from there; a reject moves it back to the right end of the ready list.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{Cmd, FromRedisValue, Script};
use tokio_util::sync::CancellationToken;

use courier_common::retry::{RetryStrategy, retry};
use courier_common::types::Notification;

use crate::consumer::{ReadySource, spawn_consumer};
use crate::{
    Broker, BrokerConfig, ConsumeOptions, ConsumerHandle, DELAYED_CHANNEL, DeliveryHandler,
    Envelope, Placement, QueueError, QueueResult, READY_CHANNEL, linked_token, placement,
};

/// How often expired delayed messages are redirected.
const PROMOTE_INTERVAL: Duration = Duration::from_millis(250);

/// Upper bound on messages redirected per promoter pass.
const PROMOTE_BATCH: usize = 500;

const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, message in ipairs(due) do
    redis.call('ZREM', KEYS[1], message)
    redis.call('LPUSH', KEYS[2], message)
end
return #due
"#;

const RECOVER_SCRIPT: &str = r#"
local moved = 0
while true do
    local message = redis.call('RPOP', KEYS[1])
    if not message then
        break
    end
    redis.call('RPUSH', KEYS[2], message)
    moved = moved + 1
end
return moved
"#;

fn unacked_key(consumer_tag: &str) -> String {
    format!("{}.unacked:{}", READY_CHANNEL, consumer_tag)
}

async fn query<T: FromRedisValue>(conn: &ConnectionManager, cmd: &Cmd) -> QueueResult<T> {
    let result = retry(RetryStrategy::OPERATION, || {
        let mut conn = conn.clone();
        async move { cmd.query_async(&mut conn).await }
    })
    .await?;
    Ok(result)
}

/// Delay-queue broker on Redis lists and sorted sets.
pub struct RedisBroker {
    conn: ConnectionManager,
    config: BrokerConfig,
    closed: CancellationToken,
}

impl RedisBroker {
    pub fn new(conn: ConnectionManager, config: BrokerConfig) -> Self {
        tracing::info!(
            ready = READY_CHANNEL,
            delayed = DELAYED_CHANNEL,
            horizon_secs = config.horizon.as_secs(),
            "Redis broker initialized"
        );
        Self {
            conn,
            config,
            closed: CancellationToken::new(),
        }
    }

    /// Redirect expired delayed messages into the ready channel. Returns how many moved.
    pub async fn promote_expired(&self) -> QueueResult<usize> {
        promote_expired(&self.conn).await
    }

    async fn publish_ready(&self, raw: &str) -> QueueResult<()> {
        query::<()>(&self.conn, redis::cmd("LPUSH").arg(READY_CHANNEL).arg(raw)).await
    }

    async fn publish_to_delayed(&self, raw: &str, expiry: Option<Duration>) -> QueueResult<()> {
        let expiry = self.config.effective_expiry(expiry);
        let expires_at = Utc::now().timestamp_millis() + expiry.as_millis() as i64;
        query::<()>(
            &self.conn,
            redis::cmd("ZADD")
                .arg(DELAYED_CHANNEL)
                .arg(expires_at)
                .arg(raw),
        )
        .await
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }
        Ok(())
    }
}

async fn promote_expired(conn: &ConnectionManager) -> QueueResult<usize> {
    let mut conn = conn.clone();
    let moved: usize = Script::new(PROMOTE_SCRIPT)
        .key(DELAYED_CHANNEL)
        .key(READY_CHANNEL)
        .arg(Utc::now().timestamp_millis())
        .arg(PROMOTE_BATCH)
        .invoke_async(&mut conn)
        .await?;
    Ok(moved)
}

async fn promote_loop(conn: ConnectionManager, stop: CancellationToken) {
    let mut interval = tokio::time::interval(PROMOTE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.cancelled() => break,
        }
        match promote_expired(&conn).await {
            Ok(0) => {}
            Ok(moved) => tracing::debug!(moved, "Redirected expired delayed messages"),
            Err(e) => tracing::warn!(error = %e, "Failed to redirect delayed messages"),
        }
    }
    tracing::debug!("Delayed-channel promoter stopped");
}

struct RedisReadySource {
    conn: ConnectionManager,
    unacked: String,
}

impl RedisReadySource {
    /// Put back anything a previous run of this consumer fetched but never acked.
    async fn recover(&self) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let moved: usize = Script::new(RECOVER_SCRIPT)
            .key(&self.unacked)
            .key(READY_CHANNEL)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }
}

#[async_trait]
impl ReadySource for RedisReadySource {
    async fn fetch(&self) -> QueueResult<Option<String>> {
        query(
            &self.conn,
            redis::cmd("LMOVE")
                .arg(READY_CHANNEL)
                .arg(&self.unacked)
                .arg("RIGHT")
                .arg("LEFT"),
        )
        .await
    }

    async fn wait(&self, idle: Duration) {
        tokio::time::sleep(idle).await;
    }

    async fn ack(&self, raw: &str) -> QueueResult<()> {
        query::<()>(
            &self.conn,
            redis::cmd("LREM").arg(&self.unacked).arg(1).arg(raw),
        )
        .await
    }

    async fn requeue(&self, raw: &str) -> QueueResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(&self.unacked)
            .arg(1)
            .arg(raw)
            .ignore()
            .cmd("RPUSH")
            .arg(READY_CHANNEL)
            .arg(raw)
            .ignore();
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish_delayed(&self, notification: &Notification) -> QueueResult<Placement> {
        self.ensure_open()?;
        let placed = placement(notification.send_at, Utc::now(), self.config.max_delay());

        match placed {
            Placement::Deferred => {
                tracing::info!(
                    notification_id = %notification.id,
                    send_at = %notification.send_at,
                    "Beyond delay horizon, will be handled by reconciler"
                );
                return Ok(placed);
            }
            Placement::Ready => self.publish_ready(&Envelope::seal(notification)?).await?,
            Placement::Delayed(delay) => {
                self.publish_to_delayed(&Envelope::seal(notification)?, Some(delay))
                    .await?
            }
        }

        tracing::info!(
            notification_id = %notification.id,
            placement = ?placed,
            "Published notification"
        );
        Ok(placed)
    }

    async fn publish_immediate(&self, notification: &Notification) -> QueueResult<()> {
        self.ensure_open()?;
        self.publish_ready(&Envelope::seal(notification)?).await?;
        tracing::info!(notification_id = %notification.id, "Published immediate notification");
        Ok(())
    }

    async fn consume(
        &self,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumeOptions,
        shutdown: CancellationToken,
    ) -> QueueResult<ConsumerHandle> {
        self.ensure_open()?;

        let source = RedisReadySource {
            conn: self.conn.clone(),
            unacked: unacked_key(&self.config.consumer_tag),
        };
        let recovered = source.recover().await?;
        if recovered > 0 {
            tracing::warn!(recovered, "Requeued unacked messages from a previous run");
        }

        let stop = linked_token(&shutdown, &self.closed);
        let promoter = tokio::spawn(promote_loop(self.conn.clone(), stop.clone()));

        let source: Arc<dyn ReadySource> = Arc::new(source);
        let mut tasks = spawn_consumer(source, handler, options, stop.clone());
        tasks.push(promoter);

        tracing::info!(
            queue = READY_CHANNEL,
            consumer_tag = %self.config.consumer_tag,
            "Consumer started successfully"
        );
        Ok(ConsumerHandle::new(stop, tasks))
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            tracing::info!("Redis broker closed");
        }
    }
}
