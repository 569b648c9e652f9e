// pinning.rs
// Per-object fetch, validate and pin state machine.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::amount::TokenAmount;
use crate::content::{object_size, pin_idempotent, unpin_idempotent, ContentError, ContentStore};
use crate::error::{PinError, PinResult};
use crate::executor::{ExecError, Executor};
use crate::metrics::Metrics;
use crate::oracle::PriceCache;
use crate::storage::Store;
use crate::tracker::{PinTracker, TrackGuard};

const BYTES_PER_MB: u128 = 1_000_000;
// Payment tolerance: 98 percent of the computed cost is enough.
const TOLERANCE_PCT: u128 = 98;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    /// Record was already pinned; the pin was re-asserted.
    Repinned,
    /// Another attempt for the same object is running.
    InFlight,
    Pinned,
    /// Size lookup or pin failed or timed out; `download_tries` was bumped.
    FetchFailed,
    /// Too large or underpaid; the record was deleted.
    Rejected,
    /// No claim record for this object.
    NotFound,
}

impl PinOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, PinOutcome::Repinned | PinOutcome::InFlight | PinOutcome::Pinned)
    }
}

/// Cost in tokens of retaining `file_size` bytes at `write_price` per MB,
/// truncated to base units.
pub fn required_cost(file_size: u64, write_price: TokenAmount) -> TokenAmount {
    let units = file_size as u128 * write_price.units() as u128 / BYTES_PER_MB;
    TokenAmount::from_units(u64::try_from(units).unwrap_or(u64::MAX))
}

/// `burned >= (file_size / 1e6) * write_price * 0.98`, evaluated exactly.
pub fn payment_covers(file_size: u64, burned: TokenAmount, write_price: TokenAmount) -> bool {
    let paid = burned.units() as u128 * 100 * BYTES_PER_MB;
    let owed = file_size as u128 * write_price.units() as u128 * TOLERANCE_PCT;
    paid >= owed
}

pub struct PinEngine {
    store: Arc<Store>,
    content: Arc<dyn ContentStore>,
    prices: Arc<PriceCache>,
    tracker: Arc<PinTracker>,
    executor: Arc<Executor>,
    max_pin_size: u64,
    metrics: Arc<Metrics>,
}

impl PinEngine {
    pub fn new(
        store: Arc<Store>,
        content: Arc<dyn ContentStore>,
        prices: Arc<PriceCache>,
        tracker: Arc<PinTracker>,
        executor: Arc<Executor>,
        max_pin_size: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { store, content, prices, tracker, executor, max_pin_size, metrics }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<PinTracker> {
        &self.tracker
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Size and payment check. Objects of `max_pin_size` bytes or more are
    /// refused outright.
    pub async fn validate(&self, file_size: u64, burned: TokenAmount, claim_height: Option<u64>) -> bool {
        if file_size >= self.max_pin_size {
            debug!(file_size, max = self.max_pin_size, "object exceeds maximum pin size");
            return false;
        }
        let price = self.prices.resolve_price(claim_height).await;
        let ok = payment_covers(file_size, burned, price);
        debug!(
            file_size,
            %burned,
            %price,
            required = %required_cost(file_size, price),
            accepted = ok,
            "payment check"
        );
        ok
    }

    /// Drive one claim record through fetch, validation and pinning.
    ///
    /// Expected failures (timeouts, network errors during the size lookup or
    /// the pin, underpayment) come back as an outcome. Errors are returned
    /// only for persistence failures and pin failures other than "already
    /// pinned".
    ///
    /// Every write back is conditional on the payment the decision was made
    /// for. A renewal landing mid-attempt is re-validated instead of being
    /// overwritten or deleted.
    pub async fn fetch_and_pin(&self, object_id: &str) -> PinResult<PinOutcome> {
        let Some(guard) = self.tracker.try_track(object_id) else {
            debug!(object_id, "attempt already in flight");
            return Ok(PinOutcome::InFlight);
        };

        let Some(mut record) = self.store.get_claim(object_id).map_err(PinError::persistence)? else {
            debug!(object_id, "no claim record");
            return Ok(PinOutcome::NotFound);
        };

        if record.data_pinned {
            self.pin(object_id).await.map_err(pin_error)?;
            debug!(object_id, "already pinned; re-asserted");
            return Ok(PinOutcome::Repinned);
        }

        let size = self
            .executor
            .run(&format!("fetch {object_id}"), object_size(self.content.clone(), object_id.to_string()))
            .await;
        let file_size = match size {
            Ok(size) => size,
            Err(e) => return self.attempt_failed(object_id, &guard, &e),
        };

        let mut pinned_here = false;
        loop {
            let paid_by = record.proof_of_burn_txid.clone();
            if !self.validate(file_size, record.tokens_burned, record.claim_height).await {
                let deleted = self
                    .store
                    .delete_claim_if(object_id, |cur| cur.proof_of_burn_txid == paid_by)
                    .map_err(PinError::persistence)?;
                if deleted {
                    guard.complete(false);
                    self.metrics.claims_deleted.inc();
                    if pinned_here {
                        if let Err(e) = unpin_idempotent(self.content.as_ref(), object_id).await {
                            warn!(object_id, "could not unpin rejected object: {e}");
                        }
                    }
                    info!(object_id, file_size, burned = %record.tokens_burned, "claim rejected: payment does not cover size");
                    return Ok(PinOutcome::Rejected);
                }
            } else {
                if !pinned_here {
                    match self.pin(object_id).await {
                        Ok(()) => pinned_here = true,
                        Err(e @ (ExecError::TimedOut { .. } | ExecError::Aborted { .. })) => {
                            return self.attempt_failed(object_id, &guard, &e);
                        }
                        Err(e) => return Err(pin_error(e)),
                    }
                }
                let committed = self
                    .store
                    .update_claim_if(
                        object_id,
                        |cur| cur.proof_of_burn_txid == paid_by,
                        |r| {
                            r.valid_claim = Some(true);
                            r.data_pinned = true;
                            r.file_size = Some(file_size);
                        },
                    )
                    .map_err(PinError::persistence)?;
                if committed.is_some() {
                    guard.complete(true);
                    self.metrics.pins_succeeded.inc();
                    info!(object_id, file_size, filename = %record.filename, "pinned");
                    return Ok(PinOutcome::Pinned);
                }
            }

            // The payment this decision was made for is gone.
            match self.store.get_claim(object_id).map_err(PinError::persistence)? {
                Some(current) => {
                    debug!(object_id, "claim renewed during attempt; re-checking payment");
                    record = current;
                }
                None => {
                    warn!(object_id, "claim record disappeared during attempt");
                    guard.complete(false);
                    return Ok(PinOutcome::NotFound);
                }
            }
        }
    }

    async fn pin(&self, object_id: &str) -> Result<(), ExecError> {
        let content = self.content.clone();
        let id = object_id.to_string();
        self.executor
            .run(&format!("pin {object_id}"), async move {
                pin_idempotent(content.as_ref(), &id).await.map_err(anyhow::Error::from)
            })
            .await
    }

    /// Count a failed try against the record and release the attempt.
    fn attempt_failed(&self, object_id: &str, guard: &TrackGuard, err: &ExecError) -> PinResult<PinOutcome> {
        self.metrics.fetch_failures.inc();
        let updated = self
            .store
            .update_claim(object_id, |r| r.download_tries = r.download_tries.saturating_add(1))
            .map_err(PinError::persistence)?;
        warn!(object_id, tries = updated.map(|r| r.download_tries), "attempt failed: {err}");
        guard.complete(false);
        Ok(PinOutcome::FetchFailed)
    }
}

/// Content-store errors surface as `Storage`; anything else the executor
/// reported stays a `Fetch` error.
fn pin_error(err: ExecError) -> PinError {
    match err {
        ExecError::Failed { label, source } => match source.downcast::<ContentError>() {
            Ok(e) => PinError::Storage(e),
            Err(source) => PinError::Fetch(ExecError::Failed { label, source }),
        },
        other => PinError::Fetch(other),
    }
}
