//! Worker pool shared by every broker implementation.
//!
//! One fetcher pulls messages from the ready channel into a bounded buffer
//! (the prefetch window); `workers` tasks take messages from it, run the
//! handler, and ack or requeue. Stopping halts the fetcher, lets in-flight
//! handlers finish, and requeues buffered messages that never started.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{ConsumeOptions, Delivery, DeliveryHandler, Envelope, QueueResult};

/// Sleep after a failed fetch before trying again.
const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Longest idle wait before the fetcher polls the ready channel again.
pub(crate) const IDLE_POLL: Duration = Duration::from_millis(200);

/// A message taken off the ready channel but not yet acknowledged.
#[derive(Debug, Clone)]
pub(crate) struct Message {
    /// Stored form, used to ack or requeue.
    pub raw: String,
    pub delivery: Delivery,
}

impl Message {
    pub fn decode(raw: String) -> QueueResult<Self> {
        let envelope: Envelope = serde_json::from_str(&raw)?;
        Ok(Self {
            delivery: Delivery {
                body: envelope.body.into_bytes(),
            },
            raw,
        })
    }
}

/// Ready-channel operations a broker exposes to the worker pool.
#[async_trait]
pub(crate) trait ReadySource: Send + Sync + 'static {
    /// Take the next message without blocking.
    async fn fetch(&self) -> QueueResult<Option<String>>;

    /// Wait until a message may be available, at most `idle`.
    async fn wait(&self, idle: Duration);

    async fn ack(&self, raw: &str) -> QueueResult<()>;

    /// Put a message back so it is the next one fetched.
    async fn requeue(&self, raw: &str) -> QueueResult<()>;
}

/// Handle to a running consumer.
pub struct ConsumerHandle {
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ConsumerHandle {
    pub(crate) fn new(stop: CancellationToken, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { stop, tasks }
    }

    /// Stop fetching new messages. Safe to call more than once.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Wait for the fetcher and every worker to exit.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Consumer task panicked");
            }
        }
    }

    /// Stop, then wait for in-flight deliveries to finish.
    pub async fn shutdown(self) {
        self.stop();
        self.join().await;
    }
}

/// Spawn the fetcher and worker tasks. They run until `stop` is cancelled.
pub(crate) fn spawn_consumer(
    source: Arc<dyn ReadySource>,
    handler: Arc<dyn DeliveryHandler>,
    options: ConsumeOptions,
    stop: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let (tx, rx) = mpsc::channel::<String>(options.prefetch.max(1));
    let rx = Arc::new(Mutex::new(rx));

    let mut tasks = Vec::with_capacity(options.workers + 1);
    tasks.push(tokio::spawn(fetch_loop(source.clone(), tx, stop.clone())));

    for worker_id in 0..options.workers.max(1) {
        tasks.push(tokio::spawn(worker_loop(
            worker_id,
            source.clone(),
            handler.clone(),
            rx.clone(),
            stop.clone(),
        )));
    }

    tracing::info!(
        workers = options.workers.max(1),
        prefetch = options.prefetch.max(1),
        "Consumer started"
    );
    tasks
}

async fn fetch_loop(source: Arc<dyn ReadySource>, tx: mpsc::Sender<String>, stop: CancellationToken) {
    while !stop.is_cancelled() {
        let raw = match source.fetch().await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                tokio::select! {
                    _ = source.wait(IDLE_POLL) => {}
                    _ = stop.cancelled() => break,
                }
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch from ready channel");
                tokio::select! {
                    _ = tokio::time::sleep(FETCH_ERROR_BACKOFF) => {}
                    _ = stop.cancelled() => break,
                }
                continue;
            }
        };

        let permit = tokio::select! {
            permit = tx.reserve() => permit,
            _ = stop.cancelled() => {
                requeue_logged(source.as_ref(), &raw).await;
                break;
            }
        };
        match permit {
            Ok(permit) => permit.send(raw),
            Err(_) => {
                // Every worker is gone.
                requeue_logged(source.as_ref(), &raw).await;
                break;
            }
        }
    }
    tracing::debug!("Fetcher stopped");
}

async fn worker_loop(
    worker_id: usize,
    source: Arc<dyn ReadySource>,
    handler: Arc<dyn DeliveryHandler>,
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
    stop: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            let received = tokio::select! {
                raw = rx.recv() => Some(raw),
                _ = stop.cancelled() => None,
            };
            match received {
                Some(raw) => raw,
                // Once stopped, drain until the fetcher drops its sender.
                None => rx.recv().await,
            }
        };
        let Some(raw) = next else {
            break;
        };

        if stop.is_cancelled() {
            requeue_logged(source.as_ref(), &raw).await;
            continue;
        }

        let message = match Message::decode(raw.clone()) {
            Ok(message) => message,
            Err(e) => {
                // Undecodable envelopes can never succeed; drop them.
                tracing::error!(worker_id, error = %e, "Dropping malformed message");
                if let Err(e) = source.ack(&raw).await {
                    tracing::warn!(worker_id, error = %e, "Failed to ack malformed message");
                }
                continue;
            }
        };

        match handler.handle(&message.delivery).await {
            Ok(()) => {
                if let Err(e) = source.ack(&message.raw).await {
                    tracing::warn!(worker_id, error = %e, "Failed to ack message");
                }
            }
            Err(e) => {
                tracing::warn!(worker_id, error = %e, "Handler rejected message, requeueing");
                requeue_logged(source.as_ref(), &message.raw).await;
            }
        }
    }
    tracing::debug!(worker_id, "Worker stopped");
}

async fn requeue_logged(source: &dyn ReadySource, raw: &str) {
    if let Err(e) = source.requeue(raw).await {
        tracing::error!(error = %e, "Failed to requeue message");
    }
}
