//! Heartbeat scheduler
//!
//! Runs named periodic tasks at independent intervals. Each task pulses as
//! soon as it is registered and then once per interval until the shared
//! cancellation token fires. Handlers are blocking device code, so every
//! pulse runs on the blocking pool; a handler that fails or panics is logged
//! and counted, and the task carries on.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HeartbeatError {
    #[error("heartbeat '{0}' needs a positive interval")]
    ZeroInterval(String),
    #[error("heartbeat '{0}' is already registered")]
    Duplicate(String),
    #[error("scheduler is shut down")]
    ShutDown,
}

/// Snapshot of one task
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatTask {
    pub name: String,
    pub interval_ms: u64,
    /// Completed pulses, failed ones included
    pub pulses: u64,
    pub failures: u64,
}

#[derive(Default)]
struct TaskStats {
    pulses: AtomicU64,
    failures: AtomicU64,
}

struct TaskEntry {
    name: String,
    interval: Duration,
    stats: Arc<TaskStats>,
    handle: Option<JoinHandle<()>>,
}

pub struct HeartbeatScheduler {
    cancel: CancellationToken,
    tasks: Mutex<Vec<TaskEntry>>,
}

impl HeartbeatScheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start a periodic task. Must be called from within a tokio runtime.
    pub fn register<F>(&self, name: &str, every: Duration, handler: F) -> Result<(), HeartbeatError>
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if every.is_zero() {
            return Err(HeartbeatError::ZeroInterval(name.to_string()));
        }
        if self.cancel.is_cancelled() {
            return Err(HeartbeatError::ShutDown);
        }

        let mut tasks = self.tasks.lock();
        if tasks.iter().any(|t| t.name == name) {
            return Err(HeartbeatError::Duplicate(name.to_string()));
        }

        let stats = Arc::new(TaskStats::default());
        let handle = tokio::spawn(run_task(
            name.to_string(),
            every,
            Arc::new(handler),
            stats.clone(),
            self.cancel.clone(),
        ));

        info!(task = %name, interval_ms = every.as_millis() as u64, "Heartbeat registered");
        tasks.push(TaskEntry {
            name: name.to_string(),
            interval: every,
            stats,
            handle: Some(handle),
        });
        Ok(())
    }

    pub fn tasks(&self) -> Vec<HeartbeatTask> {
        self.tasks
            .lock()
            .iter()
            .map(|t| HeartbeatTask {
                name: t.name.clone(),
                interval_ms: t.interval.as_millis() as u64,
                pulses: t.stats.pulses.load(Ordering::Relaxed),
                failures: t.stats.failures.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Cancel every task and wait for them to finish.
    ///
    /// A pulse already running completes first; no pulse starts afterwards.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .iter_mut()
            .filter_map(|t| t.handle.take())
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Heartbeat task ended abnormally");
            }
        }
        info!("Heartbeats stopped");
    }
}

async fn run_task<F>(
    name: String,
    every: Duration,
    handler: Arc<F>,
    stats: Arc<TaskStats>,
    cancel: CancellationToken,
) where
    F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
{
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let pulse = handler.clone();
        let result = tokio::task::spawn_blocking(move || pulse()).await;
        stats.pulses.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!(task = %name, error = %e, "Heartbeat handler failed");
            }
            Err(e) if e.is_panic() => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                error!(task = %name, "Heartbeat handler panicked");
            }
            Err(e) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!(task = %name, error = %e, "Heartbeat handler cancelled");
            }
        }
    }

    debug!(task = %name, "Heartbeat stopped");
}
