// dispatch.rs
// Bounded hand-off from the admission path to background fetch/pin work.

use std::sync::Arc;
use tokio::sync::broadcast::Receiver;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::pinning::PinEngine;

/// Sending side of the work queue. Cloned into every admission handler.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<String>,
    metrics: Option<Arc<Metrics>>,
}

impl DispatchQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, metrics: None }, rx)
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Queue `object_id` without waiting. Returns false if the queue was full
    /// or closed; the persisted record is still picked up by the next sweep.
    pub fn try_dispatch(&self, object_id: &str) -> bool {
        match self.tx.try_send(object_id.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(id)) => {
                warn!(object_id = %id, "dispatch queue full; leaving claim for the reconciliation sweep");
                if let Some(m) = &self.metrics {
                    m.dispatch_dropped.inc();
                }
                false
            }
            Err(TrySendError::Closed(id)) => {
                warn!(object_id = %id, "dispatcher stopped; leaving claim for the reconciliation sweep");
                false
            }
        }
    }
}

/// Consume the queue, running one fetch/pin unit per object id. At most
/// `workers` units are alive at once; while all are busy the queue fills and
/// further dispatches are dropped for the sweep to pick up.
pub fn spawn_dispatcher(
    engine: Arc<PinEngine>,
    mut rx: mpsc::Receiver<String>,
    mut shutdown_rx: Receiver<()>,
    workers: usize,
) -> JoinHandle<()> {
    let slots = Arc::new(Semaphore::new(workers.max(1)));
    task::spawn(async move {
        loop {
            let slot = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("dispatcher received shutdown signal");
                    break;
                }
                slot = slots.clone().acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("dispatcher received shutdown signal");
                    break;
                }
                next = rx.recv() => {
                    let Some(object_id) = next else { break };
                    let engine = engine.clone();
                    task::spawn(async move {
                        let _slot = slot;
                        match engine.fetch_and_pin(&object_id).await {
                            Ok(outcome) => debug!(object_id = %object_id, ?outcome, "dispatched unit finished"),
                            Err(e) => warn!(object_id = %object_id, "dispatched unit failed: {e}"),
                        }
                    });
                }
            }
        }
    })
}
