// Reconciliation sweeps, amnesty, timers, dispatcher, moderation and local pins.

mod common;

use common::{record, Harness, Options};
use pinclaim::config::Timers;
use pinclaim::local::LocalPins;
use pinclaim::moderation::{Moderator, StaticBlockList};
use pinclaim::{PinError, Reconciler};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const MB: u64 = 1_000_000;

fn reconciler(h: &Harness) -> Arc<Reconciler> {
    Arc::new(Reconciler::new(h.engine.clone(), &h.pinning, Timers::default(), h.metrics.clone()))
}

#[tokio::test]
async fn sweep_drives_unresolved_claims() {
    let h = Harness::new();
    for id in ["s1", "s2", "s3"] {
        h.store.put_claim(&record(id, "1", 0, 1)).unwrap();
        h.content.add_file(id, MB);
    }
    h.store.put_claim(&record("gone", "1", 0, 2)).unwrap();
    h.content.make_unreachable("gone");

    let report = reconciler(&h).sweep().await.unwrap().unwrap();
    assert_eq!(report.unresolved, 4);
    assert_eq!(report.attempted, 4);
    assert_eq!(report.pinned, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors, 0);
    assert!(h.store.get_claim("s2").unwrap().unwrap().data_pinned);
    assert_eq!(h.store.get_claim("gone").unwrap().unwrap().download_tries, 1);
    assert_eq!(h.metrics.sweeps.get(), 1);
}

#[tokio::test]
async fn retry_cap_excludes_until_amnesty() {
    let h = Harness::new();
    h.store.put_claim(&record("flaky", "1", 0, 1)).unwrap();
    h.content.make_unreachable("flaky");
    let r = reconciler(&h);

    for expected in 1..=5u32 {
        r.sweep().await.unwrap().unwrap();
        assert_eq!(h.store.get_claim("flaky").unwrap().unwrap().download_tries, expected);
    }

    let report = r.sweep().await.unwrap().unwrap();
    assert_eq!(report.capped, 1);
    assert_eq!(report.attempted, 0);
    assert_eq!(h.store.get_claim("flaky").unwrap().unwrap().download_tries, 5);

    h.content.add_file("flaky", MB);
    let still_capped = r.sweep().await.unwrap().unwrap();
    assert_eq!(still_capped.attempted, 0);

    assert_eq!(r.amnesty().unwrap(), 1);
    let report = r.sweep().await.unwrap().unwrap();
    assert_eq!(report.pinned, 1);
    assert!(h.store.get_claim("flaky").unwrap().unwrap().data_pinned);
}

#[tokio::test]
async fn sweep_batch_is_bounded_and_least_tried_first() {
    let h = Harness::new();
    for i in 0..35 {
        let id = format!("b{i:02}");
        let tries = if i < 5 { 4 } else { 0 };
        h.store.put_claim(&record(&id, "1", tries, i)).unwrap();
        h.content.make_unreachable(&id);
    }

    let report = reconciler(&h).sweep().await.unwrap().unwrap();
    assert_eq!(report.unresolved, 35);
    assert_eq!(report.attempted, 30);
    // The five records at 4 tries sort last and miss the cut.
    for i in 0..5 {
        assert_eq!(h.store.get_claim(&format!("b{i:02}")).unwrap().unwrap().download_tries, 4);
    }
    assert_eq!(h.store.get_claim("b10").unwrap().unwrap().download_tries, 1);
}

#[tokio::test]
async fn failing_record_does_not_abort_the_sweep() {
    let h = Harness::new();
    h.store.put_claim(&record("ok", "1", 0, 1)).unwrap();
    h.content.add_file("ok", MB);
    h.store.put_claim(&record("cheap", "0.000001", 0, 2)).unwrap();
    h.content.add_file("cheap", 50 * MB);

    let report = reconciler(&h).sweep().await.unwrap().unwrap();
    assert_eq!(report.pinned, 1);
    assert_eq!(report.rejected, 1);
    assert!(h.store.get_claim("cheap").unwrap().is_none());
}

#[tokio::test]
async fn overlapping_sweep_is_skipped() {
    let h = Harness::new();
    h.store.put_claim(&record("slow", "1", 0, 1)).unwrap();
    h.content.add_file("slow", MB);
    h.content.set_delay(Duration::from_millis(150));
    let r = reconciler(&h);

    let (a, b) = tokio::join!(r.sweep(), r.sweep());
    let ran = [a.unwrap(), b.unwrap()];
    assert_eq!(ran.iter().filter(|r| r.is_some()).count(), 1);
    assert_eq!(h.metrics.sweeps.get(), 1);

    // The flag is released once the sweep ends.
    assert!(r.sweep().await.unwrap().is_some());
}

#[tokio::test]
async fn timers_run_sweep_and_stop_on_shutdown() {
    let h = Harness::new();
    h.store.put_claim(&record("timed", "1", 0, 1)).unwrap();
    h.content.add_file("timed", MB);

    let timers = Timers { first_sweep_delay_secs: 0, ..Timers::default() };
    let r = Arc::new(Reconciler::new(h.engine.clone(), &h.pinning, timers, h.metrics.clone()));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let handles = r.spawn(shutdown_tx.subscribe());

    let pinned = h
        .wait_for(Duration::from_secs(3), |s| {
            s.get_claim("timed").ok().flatten().map(|c| c.data_pinned).unwrap_or(false)
        })
        .await;
    assert!(pinned);

    shutdown_tx.send(()).unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn submitted_claim_is_pinned_by_dispatcher() {
    let mut h = Harness::new();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let dispatcher = h.start_dispatcher(&shutdown_tx);

    let sub = h.paid_submission("bafy-flow", "0.0098", Some(900_500));
    h.content.add_file("bafy-flow", MB);
    h.service.submit_claim(sub).await.unwrap();

    let pinned = h
        .wait_for(Duration::from_secs(3), |s| {
            s.get_claim("bafy-flow").ok().flatten().map(|c| c.data_pinned).unwrap_or(false)
        })
        .await;
    assert!(pinned);
    assert!(h.content.is_pinned("bafy-flow"));

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), dispatcher).await.unwrap().unwrap();
}

#[tokio::test]
async fn moderation_removes_blocked_claims() {
    let h = Harness::with(Options::default());
    let mut blocked = record("bafy-bad", "1", 0, 1);
    blocked.valid_claim = Some(true);
    blocked.data_pinned = true;
    h.store.put_claim(&blocked).unwrap();
    h.content.mark_pinned("bafy-bad");
    h.store.put_claim(&record("bafy-fine", "1", 0, 2)).unwrap();
    let mut by_name = record("bafy-named", "1", 0, 3);
    by_name.filename = "leak.zip".into();
    h.store.put_claim(&by_name).unwrap();

    let moderator = Moderator::new(
        h.store.clone(),
        h.content.clone(),
        Arc::new(StaticBlockList::new(["bafy-bad", "leak.zip"])),
        h.metrics.clone(),
    );
    assert_eq!(moderator.enforce().await.unwrap(), 2);
    assert!(h.store.get_claim("bafy-bad").unwrap().is_none());
    assert!(h.store.get_claim("bafy-named").unwrap().is_none());
    assert!(h.store.get_claim("bafy-fine").unwrap().is_some());
    assert!(!h.content.is_pinned("bafy-bad"));
    assert_eq!(h.content.unpin_calls.load(Ordering::SeqCst), 2);

    assert_eq!(moderator.enforce().await.unwrap(), 0);
}

#[tokio::test]
async fn local_pins_lifecycle() {
    let h = Harness::new();
    let local = LocalPins::new(h.store.clone(), h.content.clone(), h.executor.clone());
    h.content.add_dir("site", &[10, 20, 30]);

    let rec = local.pin("site", "index.html").await.unwrap();
    assert_eq!(rec.file_size, 60);
    assert!(h.content.is_pinned("site"));

    // Pinning again refreshes the record.
    local.pin("site", "index.html").await.unwrap();
    let all = local.list().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].filename, "index.html");

    local.delete("site").await.unwrap();
    assert!(local.list().unwrap().is_empty());
    assert!(!h.content.is_pinned("site"));

    let err = local.delete("site").await.unwrap_err();
    assert!(matches!(err, PinError::Validation(_)));
    let err = local.pin("", "x").await.unwrap_err();
    assert!(matches!(err, PinError::Validation(_)));
}

#[tokio::test]
async fn hung_pin_does_not_wedge_the_sweep() {
    let h = Harness::with(Options { concurrency: 1, timeout: Duration::from_millis(50), ..Options::default() });
    h.store.put_claim(&record("hang", "1", 0, 1)).unwrap();
    h.content.add_file("hang", MB);
    h.content.hang_pinning();
    let r = reconciler(&h);

    let report = tokio::time::timeout(Duration::from_secs(3), r.sweep()).await.unwrap().unwrap().unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.store.get_claim("hang").unwrap().unwrap().download_tries, 1);
    assert!(!h.tracker.is_tracked("hang"));

    // The abandoned pin still holds the only permit, so the next unit can
    // never start; the sweep gives up on it instead of waiting.
    let report = tokio::time::timeout(Duration::from_secs(3), r.sweep()).await.unwrap().unwrap().unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.stalled, 1);
    assert_eq!(h.store.get_claim("hang").unwrap().unwrap().download_tries, 1);
    assert!(!h.tracker.is_tracked("hang"));
    assert_eq!(h.content.pin_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn busy_dispatcher_leaves_overflow_to_the_sweep() {
    let mut opts = Options { concurrency: 1, ..Options::default() };
    opts.pinning.dispatch_queue = 1;
    let mut h = Harness::with(opts);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let dispatcher = h.start_dispatcher(&shutdown_tx);
    h.content.set_delay(Duration::from_millis(200));
    for id in ["q-a", "q-b", "q-c"] {
        h.content.add_file(id, MB);
    }

    h.service.submit_claim(h.paid_submission("q-a", "1", Some(900_500))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    // q-a occupies the only worker, q-b waits in the queue and q-c overflows.
    h.service.submit_claim(h.paid_submission("q-b", "1", Some(900_500))).await.unwrap();
    h.service.submit_claim(h.paid_submission("q-c", "1", Some(900_500))).await.unwrap();
    assert_eq!(h.metrics.dispatch_dropped.get(), 1);

    let pinned = h
        .wait_for(Duration::from_secs(3), |s| {
            ["q-a", "q-b"]
                .iter()
                .all(|id| s.get_claim(id).ok().flatten().map(|c| c.data_pinned).unwrap_or(false))
        })
        .await;
    assert!(pinned);
    let left = h.store.get_claim("q-c").unwrap().unwrap();
    assert!(!left.data_pinned);
    assert_eq!(left.valid_claim, None);

    let report = reconciler(&h).sweep().await.unwrap().unwrap();
    assert_eq!(report.pinned, 1);
    assert!(h.store.get_claim("q-c").unwrap().unwrap().data_pinned);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), dispatcher).await.unwrap().unwrap();
}

#[tokio::test]
async fn report_refreshes_store_gauges() {
    let h = Harness::new();
    let mut done = record("g-done", "1", 0, 1);
    done.valid_claim = Some(true);
    done.data_pinned = true;
    h.store.put_claim(&done).unwrap();
    h.store.put_claim(&record("g-open", "1", 0, 2)).unwrap();

    reconciler(&h).report();
    assert_eq!(h.metrics.claims_stored.get(), 2);
    assert_eq!(h.metrics.claims_pinned.get(), 1);
    assert_eq!(h.metrics.claims_unprocessed.get(), 1);
    assert_eq!(h.metrics.local_pins_stored.get(), 0);
}
