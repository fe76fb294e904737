//! Background save queue.
//!
//! Writes are handed to a worker task and applied in order. Pending writes to
//! the same key coalesce to the newest value, failed writes are retried with
//! exponential backoff, and `flush` resolves once everything enqueued before
//! it has been applied or given up on.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sheetpilot_protocol::KeyValueStore;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 50,
        }
    }
}

enum Command {
    Save { key: String, value: Value },
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct QueueStats {
    written: AtomicU64,
    dropped: AtomicU64,
}

pub struct PersistQueue {
    sender: mpsc::UnboundedSender<Command>,
    stats: Arc<QueueStats>,
    worker: JoinHandle<()>,
}

impl std::fmt::Debug for PersistQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistQueue")
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl PersistQueue {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(store: Arc<dyn KeyValueStore>, config: QueueConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(QueueStats::default());
        let worker = tokio::spawn(run_worker(store, config, receiver, stats.clone()));
        Self {
            sender,
            stats,
            worker,
        }
    }

    pub fn enqueue(&self, key: impl Into<String>, value: Value) -> StoreResult<()> {
        self.sender
            .send(Command::Save {
                key: key.into(),
                value,
            })
            .map_err(|_| StoreError::WorkerStopped)
    }

    pub async fn flush(&self) -> StoreResult<()> {
        let (done, wait) = oneshot::channel();
        self.sender
            .send(Command::Flush(done))
            .map_err(|_| StoreError::WorkerStopped)?;
        wait.await.map_err(|_| StoreError::WorkerStopped)
    }

    /// Writes applied so far.
    pub fn written(&self) -> u64 {
        self.stats.written.load(Ordering::Relaxed)
    }

    /// Writes abandoned after exhausting retries.
    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    /// Drain outstanding writes and stop the worker.
    pub async fn shutdown(self) {
        let Self { sender, worker, .. } = self;
        drop(sender);
        if let Err(error) = worker.await {
            warn!(%error, "persist queue worker ended abnormally");
        }
    }
}

async fn run_worker(
    store: Arc<dyn KeyValueStore>,
    config: QueueConfig,
    mut receiver: mpsc::UnboundedReceiver<Command>,
    stats: Arc<QueueStats>,
) {
    while let Some(first) = receiver.recv().await {
        let mut pending: IndexMap<String, Value> = IndexMap::new();
        let mut waiters = Vec::new();

        let mut next = Some(first);
        while let Some(command) = next {
            match command {
                Command::Save { key, value } => {
                    // Re-inserting keeps the original position but takes the newest value.
                    if pending.insert(key, value).is_some() {
                        debug!("coalesced pending write");
                    }
                }
                Command::Flush(done) => waiters.push(done),
            }
            next = receiver.try_recv().ok();
        }

        for (key, value) in pending {
            if write_with_retry(store.as_ref(), &config, &key, value).await {
                stats.written.fetch_add(1, Ordering::Relaxed);
            } else {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        for done in waiters {
            let _ = done.send(());
        }
    }
    debug!("persist queue drained");
}

#[instrument(skip(store, config, value))]
async fn write_with_retry(
    store: &dyn KeyValueStore,
    config: &QueueConfig,
    key: &str,
    value: Value,
) -> bool {
    let mut backoff = Duration::from_millis(config.initial_backoff_ms);
    for attempt in 0..=config.max_retries {
        match store.set(key, value.clone()).await {
            Ok(()) => return true,
            Err(error) if attempt < config.max_retries => {
                warn!(attempt, %error, "persist failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(error) => {
                warn!(attempt, %error, "persist failed, giving up");
            }
        }
    }
    false
}
