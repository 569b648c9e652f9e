use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{de::DeserializeOwned, Serialize};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

use crate::claim::{ClaimRecord, LocalPinRecord, Page, PriceRecord, PAGE_SIZE};

// Values are bincode-encoded and zstd-compressed. Reads fall back to plain
// bincode so rows written by older builds stay readable.

pub const CF_CLAIM: &str = "claim";
pub const CF_CLAIM_TIME: &str = "claim_time";
pub const CF_LOCAL_PIN: &str = "local_pin";
pub const CF_WRITE_PRICE: &str = "write_price";

const ZSTD_LEVEL: i32 = 3;

pub struct Store {
    pub db: DB,
    path: String,
    // Serializes read-modify-write cycles on claim rows.
    write_lock: Mutex<()>,
}

impl Store {
    /// Perform database health check
    pub fn health_check(&self) -> Result<()> {
        let test_key = b"health_check";
        self.db.put(test_key, b"ok").with_context(|| "Database write test failed")?;
        let value = self.db.get(test_key).with_context(|| "Database read test failed")?;
        if value.as_deref() != Some(b"ok") {
            anyhow::bail!("Database read/write consistency check failed");
        }
        self.db.delete(test_key).with_context(|| "Database delete test failed")?;
        Ok(())
    }

    pub fn open(base_path: &str) -> Result<Self> {
        let db_path = base_path.to_string();

        let cf_names = ["default", CF_CLAIM, CF_CLAIM_TIME, CF_LOCAL_PIN, CF_WRITE_PRICE];

        let mut cf_opts = Options::default();
        cf_opts.set_write_buffer_size(16 * 1024 * 1024);
        cf_opts.set_max_write_buffer_number(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = cf_names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_opts.clone()))
            .collect();

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let wal_dir = format!("{db_path}/logs");
        std::fs::create_dir_all(&db_path).ok();
        std::fs::create_dir_all(&wal_dir).ok();
        db_opts.set_wal_dir(&wal_dir);

        db_opts.set_use_fsync(false);
        db_opts.set_bytes_per_sync(1024 * 1024);
        db_opts.set_max_background_jobs(2);
        db_opts.set_max_open_files(256);
        db_opts.set_wal_recovery_mode(rocksdb::DBRecoveryMode::TolerateCorruptedTailRecords);
        db_opts.set_keep_log_file_num(10);

        let db = DB::open_cf_descriptors(&db_opts, &db_path, cf_descriptors)
            .with_context(|| format!("Failed to open database at '{db_path}'"))?;

        let store = Store { db, path: db_path, write_lock: Mutex::new(()) };
        store.health_check().with_context(|| "Database health check failed during initialization")?;

        info!(path = %store.path, "database opened");
        Ok(store)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        let raw = bincode::serialize(value).with_context(|| "Failed to serialize value")?;
        zstd::encode_all(&raw[..], ZSTD_LEVEL).with_context(|| "Failed to compress value")
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        if let Ok(decompressed) = zstd::decode_all(bytes) {
            if let Ok(value) = bincode::deserialize(&decompressed) {
                return Ok(value);
            }
        }
        bincode::deserialize(bytes).with_context(|| "Failed to deserialize value")
    }

    pub fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let data = Self::encode(value)
            .with_context(|| format!("Failed to encode value for key '{}' in CF '{cf}'", String::from_utf8_lossy(key)))?;
        let handle = self.db.cf_handle(cf)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))?;
        self.db
            .put_cf_opt(handle, key, &data, &WriteOptions::default())
            .with_context(|| format!("Failed to PUT key '{}' in CF '{cf}'", String::from_utf8_lossy(key)))
    }

    pub fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.db.cf_handle(cf)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))?;
        match self.db.get_cf(handle, key)? {
            Some(value) => Self::decode(&value)
                .map(Some)
                .with_context(|| format!("Corrupt value for key '{}' in CF '{cf}'", String::from_utf8_lossy(key))),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let handle = self.db.cf_handle(cf)
            .ok_or_else(|| anyhow::anyhow!("'{}' column family missing", cf))?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (key, value) = item?;
            match Self::decode::<T>(&value) {
                Ok(v) => out.push(v),
                Err(e) => warn!(cf, key = %String::from_utf8_lossy(&key), "skipping undecodable row: {e:#}"),
            }
        }
        Ok(out)
    }

    /// Atomically applies a set of writes.
    pub fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts).with_context(|| "Failed to write batch to database")
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().with_context(|| "Failed to flush database")?;
        if let Err(e) = self.db.flush_wal(true) {
            warn!("WAL flush failed (non-critical): {e}");
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.db.cancel_all_background_work(true);
        Ok(())
    }

    // --- claims ---

    /// Index key: big-endian record time followed by the object id, so a
    /// reverse scan yields newest claims first.
    fn time_key(record: &ClaimRecord) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + record.object_id.len());
        key.extend_from_slice(&(record.record_time.max(0) as u64).to_be_bytes());
        key.extend_from_slice(record.object_id.as_bytes());
        key
    }

    fn write_claim(&self, previous: Option<&ClaimRecord>, record: &ClaimRecord) -> Result<()> {
        let claim_cf = self.db.cf_handle(CF_CLAIM)
            .ok_or_else(|| anyhow::anyhow!("'claim' column family missing"))?;
        let time_cf = self.db.cf_handle(CF_CLAIM_TIME)
            .ok_or_else(|| anyhow::anyhow!("'claim_time' column family missing"))?;

        let mut batch = WriteBatch::default();
        if let Some(prev) = previous {
            if prev.record_time != record.record_time {
                batch.delete_cf(time_cf, Self::time_key(prev));
            }
        }
        batch.put_cf(claim_cf, record.object_id.as_bytes(), Self::encode(record)?);
        batch.put_cf(time_cf, Self::time_key(record), record.object_id.as_bytes());
        self.write_batch(batch)
            .with_context(|| format!("Failed to persist claim for '{}'", record.object_id))
    }

    pub fn get_claim(&self, object_id: &str) -> Result<Option<ClaimRecord>> {
        self.get(CF_CLAIM, object_id.as_bytes())
    }

    /// Insert or replace a claim record.
    pub fn put_claim(&self, record: &ClaimRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        let previous = self.get_claim(&record.object_id)?;
        self.write_claim(previous.as_ref(), record)
    }

    /// Re-read the current row, apply `f` and write it back. Returns `None`
    /// when the record no longer exists (e.g. deleted by a rejection).
    pub fn update_claim<F>(&self, object_id: &str, f: F) -> Result<Option<ClaimRecord>>
    where
        F: FnOnce(&mut ClaimRecord),
    {
        let _guard = self.write_lock.lock();
        let Some(current) = self.get_claim(object_id)? else { return Ok(None) };
        let mut updated = current.clone();
        f(&mut updated);
        self.write_claim(Some(&current), &updated)?;
        Ok(Some(updated))
    }

    /// Like `update_claim`, but leaves the row alone unless `pred` holds for
    /// the current version. Returns `None` when the record is gone or `pred`
    /// rejected it.
    pub fn update_claim_if<P, F>(&self, object_id: &str, pred: P, f: F) -> Result<Option<ClaimRecord>>
    where
        P: FnOnce(&ClaimRecord) -> bool,
        F: FnOnce(&mut ClaimRecord),
    {
        let _guard = self.write_lock.lock();
        let Some(current) = self.get_claim(object_id)? else { return Ok(None) };
        if !pred(&current) {
            return Ok(None);
        }
        let mut updated = current.clone();
        f(&mut updated);
        self.write_claim(Some(&current), &updated)?;
        Ok(Some(updated))
    }

    /// Returns whether a record was removed.
    pub fn delete_claim(&self, object_id: &str) -> Result<bool> {
        self.delete_claim_if(object_id, |_| true)
    }

    /// Delete the record only if `pred` holds for the version currently
    /// stored. Returns whether a record was removed.
    pub fn delete_claim_if<P>(&self, object_id: &str, pred: P) -> Result<bool>
    where
        P: FnOnce(&ClaimRecord) -> bool,
    {
        let _guard = self.write_lock.lock();
        let Some(current) = self.get_claim(object_id)? else { return Ok(false) };
        if !pred(&current) {
            return Ok(false);
        }
        let claim_cf = self.db.cf_handle(CF_CLAIM)
            .ok_or_else(|| anyhow::anyhow!("'claim' column family missing"))?;
        let time_cf = self.db.cf_handle(CF_CLAIM_TIME)
            .ok_or_else(|| anyhow::anyhow!("'claim_time' column family missing"))?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(claim_cf, object_id.as_bytes());
        batch.delete_cf(time_cf, Self::time_key(&current));
        self.write_batch(batch)?;
        Ok(true)
    }

    pub fn all_claims(&self) -> Result<Vec<ClaimRecord>> {
        self.scan(CF_CLAIM)
    }

    /// Claims not yet pinned; the reconciliation sweep works from this set.
    pub fn unresolved_claims(&self) -> Result<Vec<ClaimRecord>> {
        Ok(self.all_claims()?.into_iter().filter(|c| !c.data_pinned).collect())
    }

    /// Claims whose validity has not been decided yet.
    pub fn unprocessed_claims(&self) -> Result<Vec<ClaimRecord>> {
        Ok(self.all_claims()?.into_iter().filter(|c| c.valid_claim.is_none()).collect())
    }

    pub fn claim_count(&self) -> Result<usize> {
        let cf = self.db.cf_handle(CF_CLAIM_TIME)
            .ok_or_else(|| anyhow::anyhow!("'claim_time' column family missing"))?;
        Ok(self.db.iterator_cf(cf, IteratorMode::Start).count())
    }

    /// Page through claims newest-first. Pages are 1-based; 0 is read as 1.
    pub fn recent_claims(&self, page: usize) -> Result<Page<ClaimRecord>> {
        let page = page.max(1);
        let time_cf = self.db.cf_handle(CF_CLAIM_TIME)
            .ok_or_else(|| anyhow::anyhow!("'claim_time' column family missing"))?;

        let total_items = self.claim_count()?;
        let total_pages = total_items.div_ceil(PAGE_SIZE);
        let skip = (page - 1).saturating_mul(PAGE_SIZE);

        let mut items = Vec::with_capacity(PAGE_SIZE);
        for item in self.db.iterator_cf(time_cf, IteratorMode::End).skip(skip).take(PAGE_SIZE) {
            let (_k, id) = item?;
            let id = String::from_utf8_lossy(&id).into_owned();
            if let Some(record) = self.get_claim(&id)? {
                items.push(record);
            }
        }

        Ok(Page { items, current_page: page, total_pages, page_size: PAGE_SIZE, total_items })
    }

    /// Amnesty: zero `download_tries` on every claim. Returns how many rows changed.
    pub fn reset_download_tries(&self) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let mut reset = 0usize;
        for record in self.all_claims()? {
            if record.download_tries == 0 {
                continue;
            }
            let mut updated = record.clone();
            updated.download_tries = 0;
            self.write_claim(Some(&record), &updated)?;
            reset += 1;
        }
        Ok(reset)
    }

    // --- local pins ---

    pub fn put_local_pin(&self, record: &LocalPinRecord) -> Result<()> {
        self.put(CF_LOCAL_PIN, record.object_id.as_bytes(), record)
    }

    pub fn get_local_pin(&self, object_id: &str) -> Result<Option<LocalPinRecord>> {
        self.get(CF_LOCAL_PIN, object_id.as_bytes())
    }

    pub fn local_pins(&self) -> Result<Vec<LocalPinRecord>> {
        self.scan(CF_LOCAL_PIN)
    }

    pub fn delete_local_pin(&self, object_id: &str) -> Result<()> {
        let cf = self.db.cf_handle(CF_LOCAL_PIN)
            .ok_or_else(|| anyhow::anyhow!("'local_pin' column family missing"))?;
        self.db.delete_cf(cf, object_id.as_bytes())
            .with_context(|| format!("Failed to delete local pin '{object_id}'"))
    }

    // --- write price approvals ---

    pub fn get_price_record(&self, approval_txid: &str) -> Result<Option<PriceRecord>> {
        self.get(CF_WRITE_PRICE, approval_txid.as_bytes())
    }

    pub fn put_price_record(&self, record: &PriceRecord) -> Result<()> {
        self.put(CF_WRITE_PRICE, record.approval_txid.as_bytes(), record)
    }

    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let claims = self.all_claims()?;
        Ok(DatabaseStats {
            claim_count: claims.len() as u64,
            pinned_count: claims.iter().filter(|c| c.data_pinned).count() as u64,
            unprocessed_count: claims.iter().filter(|c| c.valid_claim.is_none()).count() as u64,
            local_pin_count: self.local_pins()?.len() as u64,
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseStats {
    pub claim_count: u64,
    pub pinned_count: u64,
    pub unprocessed_count: u64,
    pub local_pin_count: u64,
}

pub fn open(cfg: &crate::config::Storage) -> Result<Arc<Store>> {
    Store::open(&cfg.path)
        .map(Arc::new)
        .with_context(|| format!("Database failed to open at '{}'. Check that the directory is writable and no other instance holds its LOCK file.", cfg.path))
}
