// chain.rs
// Blockchain lookup boundary and proof-of-burn accounting.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::amount::TokenAmount;

/// One transaction input or output; only the token quantity matters here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIo {
    #[serde(default)]
    pub token_qty: Option<TokenAmount>,
}

impl TxIo {
    pub fn tokens(qty: TokenAmount) -> Self {
        Self { token_qty: Some(qty) }
    }

    pub fn plain() -> Self {
        Self { token_qty: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxData {
    pub txid: String,
    pub is_valid_token_tx: bool,
    pub token_id: Option<String>,
    /// Confirmation height, `None` for mempool transactions.
    pub height: Option<u64>,
    pub vin: Vec<TxIo>,
    pub vout: Vec<TxIo>,
    /// Verbatim snapshot as returned by the indexer.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl TxData {
    /// Snapshot persisted on the claim record.
    pub fn snapshot(&self) -> String {
        if self.raw.is_null() {
            serde_json::to_string(self).unwrap_or_default()
        } else {
            self.raw.to_string()
        }
    }

    pub fn consumes_token(&self, token_id: &str) -> bool {
        self.token_id.as_deref() == Some(token_id)
    }
}

#[async_trait]
pub trait TxLookup: Send + Sync {
    /// Look up transactions by id. Results are returned in request order.
    async fn get_tx_data(&self, txids: &[String]) -> anyhow::Result<Vec<TxData>>;
}

/// Tokens destroyed by a transaction: inputs minus outputs, with absent
/// quantities counted as zero. Never negative.
pub fn tokens_burned(tx: &TxData) -> TokenAmount {
    let inputs: TokenAmount = tx.vin.iter().filter_map(|i| i.token_qty).sum();
    let outputs: TokenAmount = tx.vout.iter().filter_map(|o| o.token_qty).sum();
    inputs.saturating_sub(outputs)
}
