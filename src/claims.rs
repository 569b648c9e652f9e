// claims.rs
// Claim admission and the read-only status surfaces.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::amount::TokenAmount;
use crate::chain::{tokens_burned, TxData, TxLookup};
use crate::claim::{
    ClaimRecord, ClaimResponse, ClaimSubmission, ClaimView, Page, RejectReason, SubmitOutcome,
};
use crate::dispatch::DispatchQueue;
use crate::error::{PinError, PinResult};
use crate::metrics::Metrics;
use crate::moderation::BlockList;
use crate::storage::Store;

pub struct PinService {
    store: Arc<Store>,
    chain: Arc<dyn TxLookup>,
    blocklist: Arc<dyn BlockList>,
    queue: DispatchQueue,
    token_id: String,
    settle_delay: Duration,
    metrics: Arc<Metrics>,
}

impl PinService {
    pub fn new(
        store: Arc<Store>,
        chain: Arc<dyn TxLookup>,
        blocklist: Arc<dyn BlockList>,
        queue: DispatchQueue,
        cfg: &crate::config::Pinning,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            chain,
            blocklist,
            queue,
            token_id: cfg.token_id.clone(),
            settle_delay: Duration::from_millis(cfg.settle_delay_ms),
            metrics,
        }
    }

    /// Evaluate a pin claim and, when accepted, persist it and queue the
    /// object for fetching. Business rejections come back as a negative
    /// response; errors are reserved for bad input and failed lookups.
    pub async fn submit_claim(&self, sub: ClaimSubmission) -> PinResult<ClaimResponse> {
        sub.validate()?;
        self.metrics.claims_submitted.inc();

        if self.blocklist.is_blocked(&sub.object_id, &sub.filename) {
            return Ok(self.reject(&sub, RejectReason::Blocked));
        }

        // Freshly broadcast transactions may not be indexed yet.
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }

        let (pob, claim) = self.lookup_pair(&sub).await?;

        if !pob.is_valid_token_tx {
            return Ok(self.reject(&sub, RejectReason::NotTokenTx));
        }
        if !pob.consumes_token(&self.token_id) {
            return Ok(self.reject(&sub, RejectReason::WrongToken));
        }

        let burned = tokens_burned(&pob);
        debug!(object_id = %sub.object_id, %burned, "proof-of-burn verified");

        let existing = self.store.get_claim(&sub.object_id).map_err(PinError::persistence)?;
        let response = match existing {
            None => {
                let record = new_record(&sub, burned, &pob, &claim);
                self.store.put_claim(&record).map_err(PinError::persistence)?;
                self.queue.try_dispatch(&record.object_id);
                info!(object_id = %record.object_id, filename = %record.filename, %burned, "pin claim accepted");
                ClaimResponse::ok(SubmitOutcome::Accepted, "Pin claim accepted; object queued for download.")
            }
            Some(record) if record.is_complete() => {
                ClaimResponse::ok(SubmitOutcome::AlreadyComplete, "Object is already pinned.")
            }
            Some(record) if record.is_awaiting_pin() => {
                ClaimResponse::ok(SubmitOutcome::AlreadyPending, "Claim is valid; object is awaiting download.")
            }
            Some(record) if record.is_fresh_payment(&sub) => {
                let renewed = self
                    .store
                    .update_claim(&record.object_id, |r| {
                        r.proof_of_burn_txid = sub.proof_of_burn_txid.clone();
                        r.claim_txid = sub.claim_txid.clone();
                        r.filename = sub.filename.clone();
                        r.owner_address = sub.owner_address.clone();
                        r.tokens_burned = burned;
                        r.pob_tx_details = pob.snapshot();
                        r.claim_tx_details = claim.snapshot();
                        r.claim_height = claim.height;
                        r.valid_claim = None;
                        r.download_tries = 0;
                    })
                    .map_err(PinError::persistence)?;
                if renewed.is_none() {
                    // Deleted under us by a rejection; the new payment still stands.
                    let record = new_record(&sub, burned, &pob, &claim);
                    self.store.put_claim(&record).map_err(PinError::persistence)?;
                }
                self.queue.try_dispatch(&record.object_id);
                info!(object_id = %record.object_id, %burned, "pin claim renewed");
                ClaimResponse::ok(SubmitOutcome::Renewed, "Pin claim renewed; object queued for download.")
            }
            Some(_) => {
                debug!(object_id = %sub.object_id, "same payment resubmitted; nothing to do");
                ClaimResponse::ok(SubmitOutcome::Duplicate, "Claim already submitted; awaiting processing.")
            }
        };
        Ok(response)
    }

    async fn lookup_pair(&self, sub: &ClaimSubmission) -> PinResult<(TxData, TxData)> {
        let txids = vec![sub.proof_of_burn_txid.clone(), sub.claim_txid.clone()];
        let mut found = self.chain.get_tx_data(&txids).await.map_err(PinError::UpstreamLookup)?;

        let mut take = |txid: &str| -> PinResult<TxData> {
            let pos = found.iter().position(|t| t.txid == txid).ok_or_else(|| {
                PinError::UpstreamLookup(anyhow::anyhow!("transaction {txid} not returned by lookup"))
            })?;
            Ok(found.swap_remove(pos))
        };
        let pob = take(&sub.proof_of_burn_txid)?;
        // The same txid may legitimately serve as both burn and claim.
        let claim = if sub.claim_txid == sub.proof_of_burn_txid {
            pob.clone()
        } else {
            take(&sub.claim_txid)?
        };
        Ok((pob, claim))
    }

    fn reject(&self, sub: &ClaimSubmission, reason: RejectReason) -> ClaimResponse {
        self.metrics.claims_rejected.inc();
        info!(object_id = %sub.object_id, pob = %sub.proof_of_burn_txid, ?reason, "pin claim rejected");
        ClaimResponse::rejected(reason)
    }

    /// Current state of one claim; `None` if unknown or deleted after rejection.
    pub fn claim_status(&self, object_id: &str) -> PinResult<Option<ClaimView>> {
        Ok(self
            .store
            .get_claim(object_id)
            .map_err(PinError::persistence)?
            .map(|r| r.view()))
    }

    /// Newest claims first, 20 per page. Page numbers start at 1.
    pub fn recent_claims(&self, page: usize) -> PinResult<Page<ClaimView>> {
        let page = self.store.recent_claims(page).map_err(PinError::persistence)?;
        Ok(Page {
            items: page.items.iter().map(ClaimRecord::view).collect(),
            current_page: page.current_page,
            total_pages: page.total_pages,
            page_size: page.page_size,
            total_items: page.total_items,
        })
    }

    pub fn unprocessed_claims(&self) -> PinResult<Vec<ClaimView>> {
        let records = self.store.unprocessed_claims().map_err(PinError::persistence)?;
        Ok(records.iter().map(ClaimRecord::view).collect())
    }

    pub fn unpinned_claims(&self) -> PinResult<Vec<ClaimView>> {
        let records = self.store.unresolved_claims().map_err(PinError::persistence)?;
        Ok(records.iter().map(ClaimRecord::view).collect())
    }
}

fn new_record(sub: &ClaimSubmission, burned: TokenAmount, pob: &TxData, claim: &TxData) -> ClaimRecord {
    ClaimRecord {
        object_id: sub.object_id.clone(),
        proof_of_burn_txid: sub.proof_of_burn_txid.clone(),
        claim_txid: sub.claim_txid.clone(),
        filename: sub.filename.clone(),
        owner_address: sub.owner_address.clone(),
        tokens_burned: burned,
        pob_tx_details: pob.snapshot(),
        claim_tx_details: claim.snapshot(),
        claim_height: claim.height,
        valid_claim: None,
        data_pinned: false,
        download_tries: 0,
        file_size: None,
        record_time: chrono::Utc::now().timestamp_millis(),
    }
}
