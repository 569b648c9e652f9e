// tracker.rs
// In-process registry of objects with a fetch/validate attempt in flight.
//
// Nothing here is persisted. The map is empty after a restart and recovery
// depends only on the stored `download_tries`, `valid_claim` and `data_pinned`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::metrics::Metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerEntry {
    pub created: DateTime<Utc>,
    pub completed: bool,
    pub is_valid: bool,
}

impl TrackerEntry {
    fn fresh() -> Self {
        Self { created: Utc::now(), completed: false, is_valid: true }
    }
}

#[derive(Default)]
pub struct PinTracker {
    entries: Mutex<HashMap<String, TrackerEntry>>,
    live: AtomicUsize,
    metrics: Option<Arc<Metrics>>,
}

impl PinTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: Arc<Metrics>) -> Self {
        Self { metrics: Some(metrics), ..Self::default() }
    }

    /// Existing entry for `id`, or a new one if it was not tracked.
    pub fn track(&self, id: &str) -> TrackerEntry {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(id) {
            return entry.clone();
        }
        let entry = TrackerEntry::fresh();
        entries.insert(id.to_string(), entry.clone());
        self.inc();
        entry
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn untrack(&self, id: &str) {
        if self.entries.lock().remove(id).is_some() {
            self.dec();
        }
    }

    /// Check-and-insert in one step. Returns `None` when another attempt
    /// already holds `id`; otherwise a guard that untracks on drop.
    pub fn try_track(self: &Arc<Self>, id: &str) -> Option<TrackGuard> {
        let mut entries = self.entries.lock();
        if entries.contains_key(id) {
            return None;
        }
        entries.insert(id.to_string(), TrackerEntry::fresh());
        self.inc();
        Some(TrackGuard { tracker: self.clone(), id: id.to_string() })
    }

    /// Record the attempt's verdict on a live entry.
    pub fn complete(&self, id: &str, is_valid: bool) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.completed = true;
            entry.is_valid = is_valid;
        }
    }

    pub fn get(&self, id: &str) -> Option<TrackerEntry> {
        self.entries.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn inc(&self) {
        self.live.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.tracked_pins.inc();
        }
    }

    fn dec(&self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.tracked_pins.dec();
        }
    }
}

/// Holds an object in the tracker for the lifetime of one attempt.
pub struct TrackGuard {
    tracker: Arc<PinTracker>,
    id: String,
}

impl TrackGuard {
    pub fn complete(&self, is_valid: bool) {
        self.tracker.complete(&self.id, is_valid);
    }
}

impl Drop for TrackGuard {
    fn drop(&mut self) {
        self.tracker.untrack(&self.id);
    }
}
