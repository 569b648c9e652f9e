// executor.rs
// Bounded-parallel, timeout-wrapped runner for fetch/validate units.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, warn};

use crate::metrics::Metrics;

pub const DEFAULT_CONCURRENCY: usize = 20;
pub const DEFAULT_UNIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("unit `{label}` timed out after {timeout:?}")]
    TimedOut { label: String, timeout: Duration },
    #[error("unit `{label}` failed: {source:#}")]
    Failed {
        label: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("unit `{label}` was aborted before completing")]
    Aborted { label: String },
}

impl ExecError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::TimedOut { .. })
    }
}

/// Runs units of work under a global concurrency ceiling and a per-unit
/// wall-clock timeout.
///
/// Each unit is spawned as its own task and holds a semaphore permit for as
/// long as it actually runs. A timed-out caller stops waiting, but the task is
/// left to finish in the background and keeps its permit until then, so
/// abandoned units still count against the ceiling.
pub struct Executor {
    permits: Arc<Semaphore>,
    ceiling: usize,
    timeout: Duration,
    waiting: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    metrics: Option<Arc<Metrics>>,
}

impl Executor {
    pub fn new(ceiling: usize, timeout: Duration) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            permits: Arc::new(Semaphore::new(ceiling)),
            ceiling,
            timeout,
            waiting: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            metrics: None,
        }
    }

    pub fn from_config(cfg: &crate::config::Executor) -> Self {
        Self::new(cfg.concurrency, Duration::from_secs(cfg.timeout_secs))
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Units currently holding a permit, including abandoned ones.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    /// Units queued behind the ceiling.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    pub async fn run<T, F>(&self, label: &str, unit: F) -> Result<T, ExecError>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let permits = self.permits.clone();
        let waiting = self.waiting.clone();
        let running = self.running.clone();
        let metrics = self.metrics.clone();

        waiting.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(async move {
            let permit = permits.acquire_owned().await;
            waiting.fetch_sub(1, Ordering::Relaxed);
            let Ok(_permit) = permit else {
                return Err(anyhow::anyhow!("executor semaphore closed"));
            };
            running.fetch_add(1, Ordering::Relaxed);
            if let Some(m) = &metrics { m.executor_running.inc(); }
            let _ = started_tx.send(());
            let out = unit.await;
            running.fetch_sub(1, Ordering::Relaxed);
            if let Some(m) = &metrics { m.executor_running.dec(); }
            out
        });

        // The clock starts once the unit holds a permit, not while it queues.
        if started_rx.await.is_err() {
            return match handle.await {
                Ok(Err(source)) => Err(ExecError::Failed { label: label.to_string(), source }),
                _ => Err(ExecError::Aborted { label: label.to_string() }),
            };
        }

        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(source))) => {
                debug!(unit = label, "unit failed: {source:#}");
                Err(ExecError::Failed { label: label.to_string(), source })
            }
            Ok(Err(join_err)) => {
                warn!(unit = label, "unit task aborted: {join_err}");
                Err(ExecError::Aborted { label: label.to_string() })
            }
            Err(_) => {
                warn!(unit = label, timeout = ?self.timeout, "unit timed out; leaving it to finish in the background");
                if let Some(m) = &self.metrics { m.unit_timeouts.inc(); }
                Err(ExecError::TimedOut { label: label.to_string(), timeout: self.timeout })
            }
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY, DEFAULT_UNIT_TIMEOUT)
    }
}
