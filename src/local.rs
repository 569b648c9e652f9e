// local.rs
// Operator-pinned content outside the payment flow.

use std::sync::Arc;
use tracing::info;

use crate::claim::LocalPinRecord;
use crate::content::{object_size, pin_idempotent, unpin_idempotent, ContentStore};
use crate::error::{PinError, PinResult};
use crate::executor::Executor;
use crate::storage::Store;

pub struct LocalPins {
    store: Arc<Store>,
    content: Arc<dyn ContentStore>,
    executor: Arc<Executor>,
}

impl LocalPins {
    pub fn new(store: Arc<Store>, content: Arc<dyn ContentStore>, executor: Arc<Executor>) -> Self {
        Self { store, content, executor }
    }

    /// Fetch, pin and record an object. Pinning an object that is already
    /// pinned refreshes its record.
    pub async fn pin(&self, object_id: &str, filename: &str) -> PinResult<LocalPinRecord> {
        // Validate before touching the network.
        let mut record = LocalPinRecord::new(object_id, filename, 0)?;

        let size = self
            .executor
            .run(&format!("local {object_id}"), object_size(self.content.clone(), object_id.to_string()))
            .await?;
        pin_idempotent(self.content.as_ref(), object_id).await?;

        record.file_size = size;
        self.store.put_local_pin(&record).map_err(PinError::persistence)?;
        info!(object_id, filename, size, "local pin added");
        Ok(record)
    }

    pub fn list(&self) -> PinResult<Vec<LocalPinRecord>> {
        self.store.local_pins().map_err(PinError::persistence)
    }

    /// Unpin, then drop the record. Unknown ids are a validation error.
    pub async fn delete(&self, object_id: &str) -> PinResult<()> {
        if self.store.get_local_pin(object_id).map_err(PinError::persistence)?.is_none() {
            return Err(PinError::validation(format!("no local pin for '{object_id}'")));
        }
        unpin_idempotent(self.content.as_ref(), object_id).await?;
        self.store.delete_local_pin(object_id).map_err(PinError::persistence)?;
        info!(object_id, "local pin removed");
        Ok(())
    }
}
