// Shared in-memory collaborators and a wired-up engine over a temp RocksDB.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

use pinclaim::chain::{TxData, TxIo, TxLookup};
use pinclaim::claim::{ClaimRecord, ClaimSubmission};
use pinclaim::config::{Pinning, Storage};
use pinclaim::content::{ChildEntry, ContentError, ContentStore, ObjectStat};
use pinclaim::dispatch::DispatchQueue;
use pinclaim::metrics::Metrics;
use pinclaim::moderation::StaticBlockList;
use pinclaim::oracle::{ApprovalCandidate, PriceCache, PriceOracle, PricePoint, PriceUpdate};
use pinclaim::{Executor, PinEngine, PinService, PinTracker, Store, TokenAmount};

pub const TOKEN: &str = "psf-token";

pub fn amt(s: &str) -> TokenAmount {
    s.parse().expect("test amount")
}

// --- blockchain ---

#[derive(Default)]
pub struct MockChain {
    txs: Mutex<HashMap<String, TxData>>,
    pub down: AtomicBool,
    pub lookups: AtomicUsize,
}

impl MockChain {
    pub fn insert(&self, tx: TxData) {
        self.txs.lock().insert(tx.txid.clone(), tx);
    }

    /// A valid token burn of `burned` tokens of `token_id`.
    pub fn add_burn(&self, txid: &str, token_id: &str, burned: &str, height: Option<u64>) {
        self.insert(TxData {
            txid: txid.into(),
            is_valid_token_tx: true,
            token_id: Some(token_id.into()),
            height,
            vin: vec![TxIo::tokens(amt("100")), TxIo::plain()],
            vout: vec![TxIo::tokens(amt("100").saturating_sub(amt(burned))), TxIo::plain()],
            raw: serde_json::json!({ "txid": txid }),
        });
    }

    pub fn add_plain(&self, txid: &str, height: Option<u64>) {
        self.insert(TxData {
            txid: txid.into(),
            is_valid_token_tx: false,
            token_id: None,
            height,
            vin: vec![TxIo::plain()],
            vout: vec![TxIo::plain()],
            raw: serde_json::Value::Null,
        });
    }
}

#[async_trait]
impl TxLookup for MockChain {
    async fn get_tx_data(&self, txids: &[String]) -> anyhow::Result<Vec<TxData>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            anyhow::bail!("indexer unreachable");
        }
        let txs = self.txs.lock();
        txids
            .iter()
            .map(|id| txs.get(id).cloned().ok_or_else(|| anyhow::anyhow!("unknown tx {id}")))
            .collect()
    }
}

// --- storage network ---

#[derive(Default)]
pub struct MockContent {
    stats: Mutex<HashMap<String, ObjectStat>>,
    children: Mutex<HashMap<String, Vec<ChildEntry>>>,
    unreachable: Mutex<HashSet<String>>,
    pinned: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
    pin_broken: AtomicBool,
    pin_hangs: AtomicBool,
    pub stat_calls: AtomicUsize,
    pub pin_calls: AtomicUsize,
    pub unpin_calls: AtomicUsize,
}

impl MockContent {
    pub fn add_file(&self, id: &str, size: u64) {
        self.stats.lock().insert(id.into(), ObjectStat { size, is_directory: false });
        self.unreachable.lock().remove(id);
    }

    pub fn add_dir(&self, id: &str, children: &[u64]) {
        self.stats.lock().insert(id.into(), ObjectStat { size: 0, is_directory: true });
        let entries = children
            .iter()
            .enumerate()
            .map(|(i, size)| ChildEntry { name: format!("part-{i}"), size: *size })
            .collect();
        self.children.lock().insert(id.into(), entries);
    }

    pub fn make_unreachable(&self, id: &str) {
        self.unreachable.lock().insert(id.into());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn break_pinning(&self) {
        self.pin_broken.store(true, Ordering::SeqCst);
    }

    /// Every later `pin` call never returns.
    pub fn hang_pinning(&self) {
        self.pin_hangs.store(true, Ordering::SeqCst);
    }

    pub fn mark_pinned(&self, id: &str) {
        self.pinned.lock().insert(id.into());
    }

    pub fn is_pinned(&self, id: &str) -> bool {
        self.pinned.lock().contains(id)
    }
}

#[async_trait]
impl ContentStore for MockContent {
    async fn stat(&self, object_id: &str) -> Result<ObjectStat, ContentError> {
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.lock().contains(object_id) {
            return Err(ContentError::Network("no providers".into()));
        }
        self.stats
            .lock()
            .get(object_id)
            .copied()
            .ok_or_else(|| ContentError::NotFound(object_id.into()))
    }

    async fn list_children(&self, object_id: &str) -> Result<Vec<ChildEntry>, ContentError> {
        Ok(self.children.lock().get(object_id).cloned().unwrap_or_default())
    }

    async fn pin(&self, object_id: &str) -> Result<(), ContentError> {
        self.pin_calls.fetch_add(1, Ordering::SeqCst);
        if self.pin_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.pin_broken.load(Ordering::SeqCst) {
            return Err(ContentError::Network("pin refused".into()));
        }
        if !self.pinned.lock().insert(object_id.into()) {
            return Err(ContentError::AlreadyPinned);
        }
        Ok(())
    }

    async fn unpin(&self, object_id: &str) -> Result<(), ContentError> {
        self.unpin_calls.fetch_add(1, Ordering::SeqCst);
        if self.pinned.lock().remove(object_id) {
            Ok(())
        } else {
            Err(ContentError::NotPinned)
        }
    }
}

// --- price oracle ---

pub struct Approval {
    pub candidate: ApprovalCandidate,
    pub price: TokenAmount,
    pub valid: bool,
}

#[derive(Default)]
pub struct MockOracle {
    history: Mutex<Vec<PricePoint>>,
    approvals: Mutex<Vec<Approval>>,
    pub down: AtomicBool,
    pub history_calls: AtomicUsize,
    pub validations: AtomicUsize,
}

impl MockOracle {
    pub fn with_history(points: &[(u64, &str)]) -> Self {
        let oracle = Self::default();
        oracle.set_history(points);
        oracle
    }

    pub fn set_history(&self, points: &[(u64, &str)]) {
        *self.history.lock() =
            points.iter().map(|(h, p)| PricePoint { height: *h, write_price: amt(p) }).collect();
    }

    /// Approvals are searched newest first; push the newest last.
    pub fn push_approval(&self, approval_txid: &str, price: &str, valid: bool) {
        self.approvals.lock().push(Approval {
            candidate: ApprovalCandidate {
                approval_txid: approval_txid.into(),
                update_txid: format!("update-{approval_txid}"),
                height: Some(900_000),
            },
            price: amt(price),
            valid,
        });
    }
}

#[async_trait]
impl PriceOracle for MockOracle {
    async fn write_price_history(&self) -> anyhow::Result<Vec<PricePoint>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            anyhow::bail!("oracle unreachable");
        }
        Ok(self.history.lock().clone())
    }

    async fn find_approval(&self, exclude: &HashSet<String>) -> anyhow::Result<Option<ApprovalCandidate>> {
        if self.down.load(Ordering::SeqCst) {
            anyhow::bail!("oracle unreachable");
        }
        Ok(self
            .approvals
            .lock()
            .iter()
            .rev()
            .find(|a| !exclude.contains(&a.candidate.approval_txid))
            .map(|a| a.candidate.clone()))
    }

    async fn fetch_update(&self, candidate: &ApprovalCandidate) -> anyhow::Result<PriceUpdate> {
        self.approvals
            .lock()
            .iter()
            .find(|a| a.candidate == *candidate)
            .map(|a| PriceUpdate { write_price: a.price })
            .ok_or_else(|| anyhow::anyhow!("no update for {}", candidate.update_txid))
    }

    async fn validate_approval(&self, candidate: &ApprovalCandidate, _update: &PriceUpdate) -> anyhow::Result<bool> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .approvals
            .lock()
            .iter()
            .any(|a| a.candidate == *candidate && a.valid))
    }
}

// --- wiring ---

pub struct Harness {
    _dir: TempDir,
    pub store: Arc<Store>,
    pub chain: Arc<MockChain>,
    pub content: Arc<MockContent>,
    pub oracle: Arc<MockOracle>,
    pub metrics: Arc<Metrics>,
    pub executor: Arc<Executor>,
    pub tracker: Arc<PinTracker>,
    pub prices: Arc<PriceCache>,
    pub engine: Arc<PinEngine>,
    pub service: PinService,
    pub pinning: Pinning,
    queue_rx: Option<mpsc::Receiver<String>>,
}

pub struct Options {
    pub pinning: Pinning,
    pub blocked: Vec<String>,
    pub concurrency: usize,
    pub timeout: Duration,
    pub oracle: MockOracle,
}

impl Default for Options {
    fn default() -> Self {
        let mut pinning = Pinning::with_token(TOKEN);
        pinning.settle_delay_ms = 0;
        Self {
            pinning,
            blocked: Vec::new(),
            concurrency: 20,
            timeout: Duration::from_secs(5),
            oracle: MockOracle::with_history(&[(900_000, "0.01")]),
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with(Options::default())
    }

    pub fn with(opts: Options) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("pins").to_string_lossy().into_owned();
        let store = pinclaim::storage::open(&Storage { path }).expect("open store");

        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let chain = Arc::new(MockChain::default());
        let content = Arc::new(MockContent::default());
        let oracle = Arc::new(opts.oracle);
        let executor = Arc::new(Executor::new(opts.concurrency, opts.timeout).with_metrics(metrics.clone()));
        let tracker = Arc::new(PinTracker::with_metrics(metrics.clone()));
        let prices = Arc::new(PriceCache::new(
            oracle.clone(),
            store.clone(),
            executor.clone(),
            opts.pinning.fallback_price().expect("fallback"),
            opts.pinning.max_approval_candidates,
            metrics.clone(),
        ));
        let engine = Arc::new(PinEngine::new(
            store.clone(),
            content.clone(),
            prices.clone(),
            tracker.clone(),
            executor.clone(),
            opts.pinning.max_pin_size,
            metrics.clone(),
        ));
        let (queue, queue_rx) = DispatchQueue::bounded(opts.pinning.dispatch_queue);
        let service = PinService::new(
            store.clone(),
            chain.clone(),
            Arc::new(StaticBlockList::new(opts.blocked)),
            queue.with_metrics(metrics.clone()),
            &opts.pinning,
            metrics.clone(),
        );

        Self {
            _dir: dir,
            store,
            chain,
            content,
            oracle,
            metrics,
            executor,
            tracker,
            prices,
            engine,
            service,
            pinning: opts.pinning,
            queue_rx: Some(queue_rx),
        }
    }

    /// Object ids queued for background fetching since the last call.
    pub fn dispatched(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(rx) = self.queue_rx.as_mut() {
            while let Ok(id) = rx.try_recv() {
                out.push(id);
            }
        }
        out
    }

    /// Hand the work queue to a real dispatcher task.
    pub fn start_dispatcher(&mut self, shutdown: &broadcast::Sender<()>) -> tokio::task::JoinHandle<()> {
        let rx = self.queue_rx.take().expect("dispatcher already started");
        pinclaim::dispatch::spawn_dispatcher(self.engine.clone(), rx, shutdown.subscribe(), self.executor.ceiling())
    }

    /// Poll until `f` holds or `limit` elapses.
    pub async fn wait_for<F: Fn(&Store) -> bool>(&self, limit: Duration, f: F) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if f(&self.store) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        f(&self.store)
    }

    /// Register a valid burn + claim pair on the mock chain and return the
    /// matching submission.
    pub fn paid_submission(&self, object_id: &str, burned: &str, height: Option<u64>) -> ClaimSubmission {
        let pob = format!("pob-{object_id}-{burned}");
        let claim = format!("claim-{object_id}-{burned}");
        self.chain.add_burn(&pob, TOKEN, burned, height);
        self.chain.add_plain(&claim, height);
        ClaimSubmission {
            proof_of_burn_txid: pob,
            claim_txid: claim,
            object_id: object_id.into(),
            filename: format!("{object_id}.bin"),
            owner_address: "bitcoincash:qowner".into(),
        }
    }
}

pub fn record(object_id: &str, burned: &str, tries: u32, record_time: i64) -> ClaimRecord {
    ClaimRecord {
        object_id: object_id.into(),
        proof_of_burn_txid: format!("pob-{object_id}"),
        claim_txid: format!("claim-{object_id}"),
        filename: format!("{object_id}.bin"),
        owner_address: "bitcoincash:qowner".into(),
        tokens_burned: amt(burned),
        pob_tx_details: "{}".into(),
        claim_tx_details: "{}".into(),
        claim_height: Some(900_100),
        valid_claim: None,
        data_pinned: false,
        download_tries: tries,
        file_size: None,
        record_time,
    }
}
