// moderation.rs
// Blocked content: admission check and periodic enforcement.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::content::{unpin_idempotent, ContentStore};
use crate::metrics::Metrics;
use crate::storage::Store;

/// Source of object ids and filenames that must not be retained.
pub trait BlockList: Send + Sync {
    fn list_blocked(&self) -> HashSet<String>;

    fn is_blocked(&self, object_id: &str, filename: &str) -> bool {
        let blocked = self.list_blocked();
        blocked.contains(object_id) || blocked.contains(filename)
    }
}

/// Fixed list resolved once from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticBlockList {
    entries: HashSet<String>,
}

impl StaticBlockList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(Into::into)
                .map(|s: String| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Empty when moderation is disabled.
    pub fn from_config(cfg: &crate::config::Moderation) -> Self {
        if cfg.enabled {
            Self::new(cfg.blocked.iter().cloned())
        } else {
            Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl BlockList for StaticBlockList {
    fn list_blocked(&self) -> HashSet<String> {
        self.entries.clone()
    }

    fn is_blocked(&self, object_id: &str, filename: &str) -> bool {
        self.entries.contains(object_id) || self.entries.contains(filename)
    }
}

pub struct Moderator {
    store: Arc<Store>,
    content: Arc<dyn ContentStore>,
    blocklist: Arc<dyn BlockList>,
    metrics: Arc<Metrics>,
}

impl Moderator {
    pub fn new(
        store: Arc<Store>,
        content: Arc<dyn ContentStore>,
        blocklist: Arc<dyn BlockList>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { store, content, blocklist, metrics }
    }

    /// Unpin and forget every claim matching the block list. Unpin failures
    /// are logged and the record is removed anyway. Returns how many claims
    /// were deleted.
    pub async fn enforce(&self) -> Result<usize> {
        let blocked = self.blocklist.list_blocked();
        if blocked.is_empty() {
            return Ok(0);
        }

        let mut removed = 0usize;
        for claim in self.store.all_claims()? {
            if !blocked.contains(&claim.object_id) && !blocked.contains(&claim.filename) {
                continue;
            }
            if let Err(e) = unpin_idempotent(self.content.as_ref(), &claim.object_id).await {
                warn!(object_id = %claim.object_id, "could not unpin blocked object: {e}");
            }
            if self.store.delete_claim(&claim.object_id)? {
                self.metrics.claims_deleted.inc();
                removed += 1;
                info!(object_id = %claim.object_id, filename = %claim.filename, "removed blocked content");
            }
        }
        Ok(removed)
    }
}
