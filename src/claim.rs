// claim.rs
// Durable records and the request/response shapes of the admission surface.

use serde::{Deserialize, Serialize};

use crate::amount::TokenAmount;
use crate::error::{PinError, PinResult};

/// Number of claims returned per page by the recent-claims listing.
pub const PAGE_SIZE: usize = 20;

/// A pin claim as submitted by a client or indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSubmission {
    pub proof_of_burn_txid: String,
    pub claim_txid: String,
    pub object_id: String,
    pub filename: String,
    pub owner_address: String,
}

impl ClaimSubmission {
    /// Every field is required and must be non-blank.
    pub fn validate(&self) -> PinResult<()> {
        let fields = [
            ("proofOfBurnTxid", &self.proof_of_burn_txid),
            ("claimTxid", &self.claim_txid),
            ("objectId", &self.object_id),
            ("filename", &self.filename),
            ("ownerAddress", &self.owner_address),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(PinError::validation(format!("property '{name}' must be a non-empty string")));
            }
        }
        Ok(())
    }
}

/// Persisted state of one pin claim, keyed by `object_id`.
///
/// `pob_tx_details` and `claim_tx_details` hold the raw JSON snapshots returned
/// by the blockchain collaborator and are never interpreted after admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub object_id: String,
    pub proof_of_burn_txid: String,
    pub claim_txid: String,
    pub filename: String,
    pub owner_address: String,
    pub tokens_burned: TokenAmount,
    pub pob_tx_details: String,
    pub claim_tx_details: String,
    /// Confirmation height of the claim tx; `None` while unconfirmed.
    pub claim_height: Option<u64>,
    /// Tri-state: `None` until the fetch/validate unit has decided.
    pub valid_claim: Option<bool>,
    pub data_pinned: bool,
    pub download_tries: u32,
    pub file_size: Option<u64>,
    /// Creation time in milliseconds since the Unix epoch.
    pub record_time: i64,
}

impl ClaimRecord {
    pub fn is_complete(&self) -> bool {
        self.valid_claim == Some(true) && self.data_pinned
    }

    pub fn is_awaiting_pin(&self) -> bool {
        self.valid_claim == Some(true) && !self.data_pinned
    }

    /// Replay protection for renewals: both tx ids must be new.
    pub fn is_fresh_payment(&self, sub: &ClaimSubmission) -> bool {
        self.proof_of_burn_txid != sub.proof_of_burn_txid && self.claim_txid != sub.claim_txid
    }

    pub fn view(&self) -> ClaimView {
        ClaimView {
            object_id: self.object_id.clone(),
            proof_of_burn_txid: self.proof_of_burn_txid.clone(),
            claim_txid: self.claim_txid.clone(),
            filename: self.filename.clone(),
            owner_address: self.owner_address.clone(),
            tokens_burned: self.tokens_burned.to_string(),
            valid_claim: self.valid_claim,
            data_pinned: self.data_pinned,
            download_tries: self.download_tries,
            file_size: self.file_size,
            record_time: self.record_time,
        }
    }
}

/// Public projection of a [`ClaimRecord`] without the tx snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimView {
    pub object_id: String,
    pub proof_of_burn_txid: String,
    pub claim_txid: String,
    pub filename: String,
    pub owner_address: String,
    pub tokens_burned: String,
    pub valid_claim: Option<bool>,
    pub data_pinned: bool,
    pub download_tries: u32,
    pub file_size: Option<u64>,
    pub record_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NotTokenTx,
    WrongToken,
    Blocked,
}

impl RejectReason {
    pub fn details(self) -> &'static str {
        match self {
            RejectReason::NotTokenTx => "Proof-of-burn not a valid token transaction.",
            RejectReason::WrongToken => "Proof-of-burn does not consume a valid token.",
            RejectReason::Blocked => "Object is blocked by moderation rules.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Accepted,
    Renewed,
    AlreadyPending,
    AlreadyComplete,
    /// Same payment resubmitted for an undecided record.
    Duplicate,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub success: bool,
    pub details: String,
    pub outcome: SubmitOutcome,
}

impl ClaimResponse {
    pub fn rejected(reason: RejectReason) -> Self {
        Self { success: false, details: reason.details().to_string(), outcome: SubmitOutcome::Rejected(reason) }
    }

    pub fn ok(outcome: SubmitOutcome, details: impl Into<String>) -> Self {
        Self { success: true, details: details.into(), outcome }
    }
}

/// Content pinned directly by an operator, outside the payment flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPinRecord {
    pub object_id: String,
    pub filename: String,
    pub file_size: u64,
    pub date_pinned: i64,
}

impl LocalPinRecord {
    pub fn new(object_id: &str, filename: &str, file_size: u64) -> PinResult<Self> {
        if object_id.trim().is_empty() {
            return Err(PinError::validation("property 'objectId' must be a non-empty string"));
        }
        if filename.trim().is_empty() {
            return Err(PinError::validation("property 'filename' must be a non-empty string"));
        }
        Ok(Self {
            object_id: object_id.to_string(),
            filename: filename.to_string(),
            file_size,
            date_pinned: chrono::Utc::now().timestamp_millis(),
        })
    }
}

/// Memoized outcome of validating a governance price approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub approval_txid: String,
    pub update_txid: String,
    pub write_price: TokenAmount,
    pub height: Option<u64>,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub current_page: usize,
    pub total_pages: usize,
    pub page_size: usize,
    pub total_items: usize,
}
