//! Write-behind caching
//!
//! Updates land in the cache immediately and are queued for the store. A
//! periodic flush task drains the queue in batches, retrying each write a
//! bounded number of times. Writes that keep failing are logged and handed
//! to the caller through [`WriteBehind::take_failures`] rather than dropped.
//!
//! At most one flush runs at a time, whether it comes from the periodic
//! task, an explicit [`WriteBehind::flush`] or [`WriteBehind::stop`], so
//! writes to one key reach the store in the order they were made.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::error::{Result, WrenError};
use crate::settings::WriteBehindSettings;
use crate::task::{PeriodicJob, PeriodicTask};

use super::{BackingStore, Cache};

/// A queued write the store refused on every attempt
#[derive(Clone, Debug, PartialEq)]
pub struct WriteFailure<V> {
    pub key: String,
    pub value: V,
    pub error: WrenError,
    pub attempts: u32,
}

struct Flusher<V> {
    store: Arc<dyn BackingStore<V>>,
    queue: Mutex<VecDeque<(String, V)>>,
    // held for a whole flush, across store calls
    flushing: AsyncMutex<()>,
    settings: WriteBehindSettings,
    failures_tx: mpsc::UnboundedSender<WriteFailure<V>>,
}

impl<V: Clone + Send + Sync + 'static> Flusher<V> {
    fn enqueue(&self, key: &str, value: V) {
        self.queue.lock().push_back((key.to_string(), value));
    }

    fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    fn next_batch(&self, limit: usize) -> Vec<(String, V)> {
        let mut queue = self.queue.lock();
        let take = limit.min(self.settings.batch_size).min(queue.len());
        queue.drain(..take).collect()
    }

    /// Write everything queued when the flush started. Returns the number of
    /// writes the store accepted.
    ///
    /// Writes queued while flushing wait for the next flush, so a steady
    /// stream of updates cannot keep one flush going forever.
    async fn flush(&self) -> usize {
        let _flushing = self.flushing.lock().await;
        let mut remaining = self.pending();
        let mut written = 0;
        while remaining > 0 {
            let batch = self.next_batch(remaining);
            if batch.is_empty() {
                break;
            }
            remaining -= batch.len();
            debug!("[write-behind] Flushing batch of {}", batch.len());
            for (key, value) in batch {
                if self.write_with_retry(key, value).await {
                    written += 1;
                }
            }
        }
        written
    }

    async fn write_with_retry(&self, key: String, value: V) -> bool {
        let max_attempts = self.settings.max_attempts;
        let mut attempt = 1;
        loop {
            match self.store.set(&key, value.clone()).await {
                Ok(()) => return true,
                Err(err) if attempt < max_attempts => {
                    warn!(
                        "[write-behind] Write for {} failed (attempt {}/{}): {}",
                        key, attempt, max_attempts, err
                    );
                    tokio::time::sleep(self.settings.retry_backoff * attempt).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        "[write-behind] Giving up on write for {} after {} attempts: {}",
                        key, attempt, err
                    );
                    let failure = WriteFailure {
                        key,
                        value,
                        error: err,
                        attempts: attempt,
                    };
                    // The receiver lives as long as the WriteBehind
                    if self.failures_tx.send(failure).is_err() {
                        warn!("[write-behind] Failure channel closed");
                    }
                    return false;
                }
            }
        }
    }
}

struct FlushJob<V> {
    flusher: Arc<Flusher<V>>,
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> PeriodicJob for FlushJob<V> {
    async fn tick(&mut self) {
        self.flusher.flush().await;
    }

    async fn shutdown(&mut self) {
        let written = self.flusher.flush().await;
        info!("[write-behind] Final flush wrote {} entries", written);
    }
}

pub struct WriteBehind<V> {
    cache: Arc<dyn Cache<V>>,
    flusher: Arc<Flusher<V>>,
    failures_rx: Mutex<mpsc::UnboundedReceiver<WriteFailure<V>>>,
    flush_task: Mutex<Option<PeriodicTask>>,
    ttl: Option<Duration>,
}

impl<V: Clone + Send + Sync + 'static> WriteBehind<V> {
    /// Start the service and its flush task. Must be called from within a
    /// tokio runtime.
    pub fn new(
        cache: Arc<dyn Cache<V>>,
        store: Arc<dyn BackingStore<V>>,
        settings: WriteBehindSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let flush_interval = settings.flush_interval;
        let flusher = Arc::new(Flusher {
            store,
            queue: Mutex::new(VecDeque::new()),
            flushing: AsyncMutex::new(()),
            settings,
            failures_tx,
        });
        let job = FlushJob {
            flusher: flusher.clone(),
        };
        let flush_task = PeriodicTask::spawn("write-behind", flush_interval, job)?;
        Ok(Self {
            cache,
            flusher,
            failures_rx: Mutex::new(failures_rx),
            flush_task: Mutex::new(Some(flush_task)),
            ttl: None,
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.cache.get(key)
    }

    /// Cache `value` now and queue it for the store
    pub fn update(&self, key: &str, value: V) {
        self.cache.set(key, value.clone(), self.ttl);
        self.flusher.enqueue(key, value);
    }

    /// Writes waiting for the store
    pub fn pending(&self) -> usize {
        self.flusher.pending()
    }

    /// Flush now instead of waiting for the next tick
    pub async fn flush(&self) -> usize {
        self.flusher.flush().await
    }

    /// Writes that failed permanently since the last call
    pub fn take_failures(&self) -> Vec<WriteFailure<V>> {
        let mut failures_rx = self.failures_rx.lock();
        let mut failures = Vec::new();
        while let Ok(failure) = failures_rx.try_recv() {
            failures.push(failure);
        }
        failures
    }

    pub fn is_flushing(&self) -> bool {
        self.flush_task
            .lock()
            .as_ref()
            .map(|task| task.is_running())
            .unwrap_or(false)
    }

    /// Stop the flush task after one final flush.
    ///
    /// Updates that race with `stop` are flushed here as well. Updates made
    /// after `stop` returns are only written by an explicit [`flush`].
    ///
    /// [`flush`]: WriteBehind::flush
    pub async fn stop(&self) -> Result<()> {
        let task = self.flush_task.lock().take();
        if let Some(mut task) = task {
            task.stop().await?;
        }
        if self.flusher.pending() > 0 {
            self.flusher.flush().await;
        }
        Ok(())
    }
}
