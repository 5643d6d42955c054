//! Periodic background jobs with a graceful stop
//!
//! Leaking, write-behind flushing and idle-key sweeping all run as a
//! [`PeriodicTask`]: a tokio task that calls [`PeriodicJob::tick`] on a fixed
//! interval until it is told to stop, then runs [`PeriodicJob::shutdown`]
//! once before exiting.
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config_error;
use crate::error::{Result, WrenError};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait PeriodicJob: Send + 'static {
    /// Called once per interval
    async fn tick(&mut self);

    /// Called once after the stop signal, before the task exits
    async fn shutdown(&mut self) {}
}

/// Handle to a running periodic job.
///
/// Dropping the handle without calling [`PeriodicTask::stop`] also ends the
/// job (the stop signal's sender is dropped), but nothing waits for it.
pub struct PeriodicTask {
    name: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("stop_timeout", &self.stop_timeout)
            .finish()
    }
}

impl PeriodicTask {
    /// Spawn `job` on the current tokio runtime, ticking every `period`.
    ///
    /// The first tick happens one full `period` after spawning.
    pub fn spawn<J: PeriodicJob>(
        name: impl Into<String>,
        period: Duration,
        mut job: J,
    ) -> Result<Self> {
        let name = name.into();
        if period.is_zero() {
            return Err(config_error!("[{}] period must be greater than zero", name));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| config_error!("[{}] requires a running tokio runtime", name))?;

        let first_tick = time::Instant::now()
            .checked_add(period)
            .ok_or_else(|| config_error!("[{}] period {:?} is too long", name, period))?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let task_name = name.clone();
        let handle = runtime.spawn(async move {
            let mut interval = time::interval_at(first_tick, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "[{}] Periodic task started with {}ms interval",
                task_name,
                period.as_millis()
            );

            loop {
                tokio::select! {
                    biased;
                    // Either an explicit stop or a dropped handle
                    _ = &mut shutdown_rx => {
                        debug!("[{}] Stop signal received", task_name);
                        break;
                    }
                    _ = interval.tick() => {
                        job.tick().await;
                    }
                }
            }

            job.shutdown().await;
            info!("[{}] Periodic task stopped", task_name);
        });

        Ok(Self {
            name,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        })
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Signal the job to stop and wait for its shutdown hook to finish.
    ///
    /// Waits at most the stop timeout; on overrun the task is aborted and a
    /// `WrenError::Task` is returned. Calling `stop` twice is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            // The task may already be gone; that is fine
            let _ = shutdown_tx.send(());
        }
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };

        match time::timeout(self.stop_timeout, &mut handle).await {
            Ok(joined) => joined.map_err(WrenError::from),
            Err(_) => {
                handle.abort();
                error!(
                    "[{}] Periodic task did not stop within {}ms; aborted",
                    self.name,
                    self.stop_timeout.as_millis()
                );
                Err(WrenError::Task(format!(
                    "{} did not stop within {}ms",
                    self.name,
                    self.stop_timeout.as_millis()
                )))
            }
        }
    }
}
