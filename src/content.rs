// content.rs
// Storage-network boundary: size lookups and pin management.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("object is already pinned")]
    AlreadyPinned,
    #[error("object is not pinned")]
    NotPinned,
    #[error("object `{0}` could not be resolved")]
    NotFound(String),
    #[error("storage network: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
    pub is_directory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    pub name: String,
    pub size: u64,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Resolve the object (fetching it if needed) and report its size.
    async fn stat(&self, object_id: &str) -> Result<ObjectStat, ContentError>;
    async fn list_children(&self, object_id: &str) -> Result<Vec<ChildEntry>, ContentError>;
    async fn pin(&self, object_id: &str) -> Result<(), ContentError>;
    async fn unpin(&self, object_id: &str) -> Result<(), ContentError>;
}

/// Pin, treating "already pinned" as success.
pub async fn pin_idempotent(store: &dyn ContentStore, object_id: &str) -> Result<(), ContentError> {
    match store.pin(object_id).await {
        Ok(()) => Ok(()),
        Err(ContentError::AlreadyPinned) => {
            debug!(object_id, "already pinned");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Unpin, treating "not pinned" as success.
pub async fn unpin_idempotent(store: &dyn ContentStore, object_id: &str) -> Result<(), ContentError> {
    match store.unpin(object_id).await {
        Ok(()) | Err(ContentError::NotPinned) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Size of an object in bytes. Directories (and objects whose stat reports
/// no size) are measured as the sum of their children.
pub async fn object_size(store: Arc<dyn ContentStore>, object_id: String) -> anyhow::Result<u64> {
    let stat = store.stat(&object_id).await?;
    if !stat.is_directory && stat.size > 0 {
        return Ok(stat.size);
    }
    let children = store.list_children(&object_id).await?;
    let total = children.iter().fold(0u64, |acc, c| acc.saturating_add(c.size));
    debug!(object_id = %object_id, children = children.len(), total, "measured directory");
    Ok(total)
}
