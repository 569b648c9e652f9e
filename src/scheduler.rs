// scheduler.rs
// Periodic reconciliation: sweeps unresolved claims, resets retry counters
// and enforces moderation.

use anyhow::Result;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::Receiver;
use tokio::task::{self, JoinHandle};
use tokio::time::{interval_at, sleep, timeout, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::claim::ClaimRecord;
use crate::config;
use crate::metrics::Metrics;
use crate::moderation::Moderator;
use crate::pinning::{PinEngine, PinOutcome};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Unresolved records found in the store.
    pub unresolved: usize,
    /// Records left out because they reached the retry cap.
    pub capped: usize,
    pub attempted: usize,
    pub pinned: usize,
    pub failed: usize,
    pub rejected: usize,
    pub errors: usize,
    /// Units abandoned after exceeding the per-unit budget.
    pub stalled: usize,
}

/// Pick the records a sweep should drive: drop those at the retry cap, order
/// the rest by `download_tries` ascending (stable, so equal counts keep store
/// order) and keep at most `batch`. Returns the batch and the number capped.
pub fn plan_sweep(records: Vec<ClaimRecord>, retry_cap: u32, batch: usize) -> (Vec<ClaimRecord>, usize) {
    let total = records.len();
    let mut eligible: Vec<ClaimRecord> =
        records.into_iter().filter(|r| r.download_tries < retry_cap).collect();
    let capped = total - eligible.len();
    eligible.sort_by_key(|r| r.download_tries);
    eligible.truncate(batch);
    (eligible, capped)
}

// A unit may spend one executor timeout on each of the size lookup, the price
// lookup and the pin, plus one more queueing for permits.
const UNIT_BUDGET_TIMEOUTS: u32 = 4;

struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Reconciler {
    engine: Arc<PinEngine>,
    moderator: Option<Arc<Moderator>>,
    retry_cap: u32,
    batch: usize,
    unit_budget: Duration,
    timers: config::Timers,
    sweeping: AtomicBool,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    pub fn new(engine: Arc<PinEngine>, pinning: &config::Pinning, timers: config::Timers, metrics: Arc<Metrics>) -> Self {
        let unit_budget = engine.executor().timeout().saturating_mul(UNIT_BUDGET_TIMEOUTS);
        Self {
            engine,
            moderator: None,
            retry_cap: pinning.retry_cap,
            batch: pinning.sweep_batch,
            unit_budget,
            timers,
            sweeping: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn with_moderator(mut self, moderator: Arc<Moderator>) -> Self {
        self.moderator = Some(moderator);
        self
    }

    /// One reconciliation pass. Returns `None` if another sweep is still
    /// running. A failing record never aborts the rest of the batch, and a
    /// unit that outlives its budget is abandoned so the sweep always ends.
    pub async fn sweep(&self) -> Result<Option<SweepReport>> {
        if self.sweeping.swap(true, Ordering::AcqRel) {
            debug!("previous sweep still running; skipping");
            return Ok(None);
        }
        let _running = Running(&self.sweeping);

        let unresolved = self.engine.store().unresolved_claims()?;
        let mut report = SweepReport { unresolved: unresolved.len(), ..SweepReport::default() };
        let (batch, capped) = plan_sweep(unresolved, self.retry_cap, self.batch);
        report.capped = capped;
        report.attempted = batch.len();

        let results = join_all(
            batch.iter().map(|r| timeout(self.unit_budget, self.engine.fetch_and_pin(&r.object_id))),
        )
        .await;
        for (record, result) in batch.iter().zip(results) {
            let Ok(result) = result else {
                report.stalled += 1;
                warn!(object_id = %record.object_id, budget = ?self.unit_budget, "sweep unit stalled; abandoned");
                continue;
            };
            match result {
                Ok(PinOutcome::Pinned) | Ok(PinOutcome::Repinned) => report.pinned += 1,
                Ok(PinOutcome::FetchFailed) => report.failed += 1,
                Ok(PinOutcome::Rejected) => report.rejected += 1,
                Ok(PinOutcome::InFlight) | Ok(PinOutcome::NotFound) => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(object_id = %record.object_id, "sweep attempt failed: {e}");
                }
            }
        }

        self.metrics.sweeps.inc();
        Ok(Some(report))
    }

    /// Give every claim a fresh retry window.
    pub fn amnesty(&self) -> Result<usize> {
        let reset = self.engine.store().reset_download_tries()?;
        info!(reset, "download tries cleared");
        Ok(reset)
    }

    /// Log the queue state and refresh the store gauges.
    pub fn report(&self) {
        let executor = self.engine.executor();
        info!(
            tracked = self.engine.tracker().len(),
            running = executor.running(),
            waiting = executor.waiting(),
            "pin queue"
        );
        match self.engine.store().get_stats() {
            Ok(stats) => self.metrics.observe_store(&stats),
            Err(e) => warn!("could not read store stats: {e:#}"),
        }
    }

    /// Start the timer loops. Each stops when `shutdown_rx` fires.
    pub fn spawn(self: Arc<Self>, shutdown_rx: Receiver<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Sweep: re-armed only after the previous pass finishes, even on error.
        {
            let me = self.clone();
            let mut rx = shutdown_rx.resubscribe();
            let first = Duration::from_secs(me.timers.first_sweep_delay_secs);
            let every = Duration::from_secs(me.timers.sweep_interval_secs);
            handles.push(task::spawn(async move {
                let mut delay = first;
                loop {
                    tokio::select! {
                        _ = rx.recv() => {
                            info!("reconciliation sweep received shutdown signal");
                            break;
                        }
                        _ = sleep(delay) => {}
                    }
                    info!("starting reconciliation sweep");
                    match me.sweep().await {
                        Ok(Some(r)) => info!(
                            unresolved = r.unresolved,
                            attempted = r.attempted,
                            pinned = r.pinned,
                            failed = r.failed,
                            rejected = r.rejected,
                            capped = r.capped,
                            stalled = r.stalled,
                            "reconciliation sweep finished"
                        ),
                        Ok(None) => {}
                        Err(e) => error!("reconciliation sweep failed: {e:#}"),
                    }
                    delay = every;
                }
            }));
        }

        {
            let me = self.clone();
            let mut rx = shutdown_rx.resubscribe();
            let period = Duration::from_secs(me.timers.amnesty_interval_secs.max(1));
            handles.push(task::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = rx.recv() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = me.amnesty() {
                                error!("download-tries amnesty failed: {e:#}");
                            }
                        }
                    }
                }
            }));
        }

        if let Some(moderator) = self.moderator.clone() {
            let mut rx = shutdown_rx.resubscribe();
            let period = Duration::from_secs(self.timers.moderation_interval_secs.max(1));
            handles.push(task::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = rx.recv() => break,
                        _ = ticker.tick() => match moderator.enforce().await {
                            Ok(0) => {}
                            Ok(n) => info!(removed = n, "moderation enforced"),
                            Err(e) => error!("moderation pass failed: {e:#}"),
                        }
                    }
                }
            }));
        }

        {
            let me = self;
            let mut rx = shutdown_rx;
            let period = Duration::from_secs(me.timers.report_interval_secs.max(1));
            handles.push(task::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = rx.recv() => break,
                        _ = ticker.tick() => me.report(),
                    }
                }
            }));
        }

        handles
    }
}
