// oracle.rs
// Write-price oracle boundary and the process-lifetime price cache.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::amount::TokenAmount;
use crate::claim::PriceRecord;
use crate::executor::Executor;
use crate::metrics::Metrics;
use crate::storage::Store;

/// Price in effect from `height` onwards, in tokens per MB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    pub height: u64,
    pub write_price: TokenAmount,
}

/// A governance approval transaction and the update it approves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalCandidate {
    pub approval_txid: String,
    pub update_txid: String,
    pub height: Option<u64>,
}

/// Payload referenced by an update transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceUpdate {
    pub write_price: TokenAmount,
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Price history ordered by height, newest first. Consensus-validated upstream.
    async fn write_price_history(&self) -> anyhow::Result<Vec<PricePoint>>;

    /// Most recent approval transaction whose id is not in `exclude`.
    async fn find_approval(&self, exclude: &HashSet<String>) -> anyhow::Result<Option<ApprovalCandidate>>;

    async fn fetch_update(&self, candidate: &ApprovalCandidate) -> anyhow::Result<PriceUpdate>;

    /// Multi-signature check of the approval against its update. Expensive.
    async fn validate_approval(&self, candidate: &ApprovalCandidate, update: &PriceUpdate) -> anyhow::Result<bool>;
}

/// Pick the price in effect at `claim_height` from a newest-first history.
/// An unconfirmed claim (`None`) uses the newest entry.
pub fn select_price(history: &[PricePoint], claim_height: Option<u64>) -> Option<TokenAmount> {
    match claim_height {
        None => history.first().map(|p| p.write_price),
        Some(h) => history.iter().find(|p| p.height <= h).map(|p| p.write_price),
    }
}

/// Resolves write prices once per process and falls back to a fixed constant
/// whenever the oracle cannot answer.
pub struct PriceCache {
    oracle: Arc<dyn PriceOracle>,
    store: Arc<Store>,
    executor: Arc<Executor>,
    fallback: TokenAmount,
    max_candidates: usize,
    resolved: RwLock<Option<TokenAmount>>,
    // Approval txids that failed validation; skipped on later lookups.
    rejected_approvals: Mutex<HashSet<String>>,
    metrics: Arc<Metrics>,
}

impl PriceCache {
    pub fn new(
        oracle: Arc<dyn PriceOracle>,
        store: Arc<Store>,
        executor: Arc<Executor>,
        fallback: TokenAmount,
        max_candidates: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            oracle,
            store,
            executor,
            fallback,
            max_candidates: max_candidates.max(1),
            resolved: RwLock::new(None),
            rejected_approvals: Mutex::new(HashSet::new()),
            metrics,
        }
    }

    pub fn fallback(&self) -> TokenAmount {
        self.fallback
    }

    pub async fn cached(&self) -> Option<TokenAmount> {
        *self.resolved.read().await
    }

    /// Write price for a claim made at `claim_height`.
    ///
    /// The first successful resolution is kept for the life of the process and
    /// returned for every later call. Failures return the fallback without
    /// caching it, so a later call can still pick up the real price.
    pub async fn resolve_price(&self, claim_height: Option<u64>) -> TokenAmount {
        if let Some(price) = *self.resolved.read().await {
            return price;
        }

        let oracle = self.oracle.clone();
        let history = self
            .executor
            .run("write-price-history", async move { oracle.write_price_history().await })
            .await;

        let selected = match history {
            Ok(history) => select_price(&history, claim_height),
            Err(e) => {
                warn!("price history unavailable: {e}");
                None
            }
        };

        match selected {
            Some(price) => {
                let mut slot = self.resolved.write().await;
                let price = *slot.get_or_insert(price);
                info!(%price, ?claim_height, "write price resolved");
                price
            }
            None => {
                self.metrics.price_fallbacks.inc();
                warn!(fallback = %self.fallback, "using hard-coded write price");
                self.fallback
            }
        }
    }

    /// Current governance write price from the latest valid approval.
    ///
    /// Approvals already verified are read back from the store; new ones are
    /// validated once and memoized. Invalid approvals are excluded and the next
    /// candidate is tried, up to `max_candidates` lookups.
    pub async fn consensus_write_price(&self) -> TokenAmount {
        match self.find_consensus_price().await {
            Ok(Some(price)) => price,
            Ok(None) => {
                self.metrics.price_fallbacks.inc();
                warn!(fallback = %self.fallback, "no valid approval transaction found; using hard-coded write price");
                self.fallback
            }
            Err(e) => {
                self.metrics.price_fallbacks.inc();
                warn!(fallback = %self.fallback, "approval lookup failed: {e:#}");
                self.fallback
            }
        }
    }

    async fn find_consensus_price(&self) -> anyhow::Result<Option<TokenAmount>> {
        for _ in 0..self.max_candidates {
            let exclude = self.rejected_approvals.lock().clone();
            let Some(candidate) = self.oracle.find_approval(&exclude).await? else {
                return Ok(None);
            };

            if let Some(record) = self.store.get_price_record(&candidate.approval_txid)? {
                if record.verified {
                    debug!(approval = %candidate.approval_txid, "approval previously validated");
                    return Ok(Some(record.write_price));
                }
            }

            info!(approval = %candidate.approval_txid, "validating new approval transaction");
            let update = self.oracle.fetch_update(&candidate).await?;
            if self.oracle.validate_approval(&candidate, &update).await? {
                let record = PriceRecord {
                    approval_txid: candidate.approval_txid.clone(),
                    update_txid: candidate.update_txid.clone(),
                    write_price: update.write_price,
                    height: candidate.height,
                    verified: true,
                };
                self.store.put_price_record(&record)?;
                info!(approval = %record.approval_txid, price = %record.write_price, "approval validated");
                return Ok(Some(update.write_price));
            }

            warn!(approval = %candidate.approval_txid, "approval transaction is invalid; skipping");
            self.rejected_approvals.lock().insert(candidate.approval_txid);
        }
        warn!(limit = self.max_candidates, "gave up after too many invalid approval candidates");
        Ok(None)
    }
}
