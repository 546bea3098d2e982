mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{Duration as ChronoDuration, Utc};
use common::{Item, init_tracing, item_table, make_item};
use entable_engine::{EngineError, LockOptions, LockRejection, LockedOutcome};
use entable_storage::{TableStore, WriteCondition};
use entable_types::{KeyPair, PropertyBag};
use pretty_assertions::assert_eq;
use tokio::time::{Duration, Instant, sleep};

fn a_p1() -> KeyPair {
    KeyPair::new("A", "P1")
}

fn bump(mut item: Item) -> entable_engine::EngineResult<(Item, ())> {
    item.x += 1;
    Ok((item, ()))
}

// ── Acquisition and release ─────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn second_caller_waits_for_first_release() {
    init_tracing();
    let (_h, items) = item_table();
    items.create(&make_item("A", "P1", 0)).await.unwrap();
    let options = LockOptions::default().with_timeout(Duration::from_secs(5));
    let keys = a_p1();
    let start = Instant::now();

    let first = items.locked_update(&keys, &options, |_: &Item| true, |item| async move {
        sleep(Duration::from_secs(2)).await;
        bump(item)
    });
    let second = async {
        sleep(Duration::from_secs(1)).await;
        let outcome = items
            .locked_update(&keys, &options, |_: &Item| true, |item| async move { bump(item) })
            .await;
        (outcome, start.elapsed())
    };

    let (first, (second, acquired_after)) = tokio::join!(first, second);
    assert!(first.unwrap().completed().is_some());
    let (stored, ()) = second.unwrap().completed().expect("second caller gets the lock");
    assert_eq!(stored.entity.x, 2);
    assert!(acquired_after >= Duration::from_secs(2), "{acquired_after:?}");
    assert!(acquired_after < Duration::from_millis(2_500), "{acquired_after:?}");
}

#[tokio::test(start_paused = true)]
async fn critical_sections_never_overlap() {
    let (_h, items) = item_table();
    items.create(&make_item("A", "P1", 0)).await.unwrap();
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let keys = a_p1();
    let calls = (0..5).map(|_| {
        let inside = Arc::clone(&inside);
        let overlaps = Arc::clone(&overlaps);
        items.with_lock(&keys, move |item| async move {
            if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            sleep(Duration::from_millis(100)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
            bump(item)
        })
    });
    for outcome in futures::future::join_all(calls).await {
        assert!(outcome.unwrap().completed().is_some());
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(items.get(&a_p1()).await.unwrap().unwrap().entity.x, 5);
}

#[tokio::test]
async fn completed_update_clears_sentinel() {
    let (h, items) = item_table();
    items.create(&make_item("A", "P1", 0)).await.unwrap();

    let (stored, value) = items
        .with_lock(&a_p1(), |item| async move {
            let mut item = item;
            item.x = 7;
            Ok::<_, EngineError>((item, "done"))
        })
        .await
        .unwrap()
        .completed()
        .unwrap();
    assert_eq!(value, "done");
    assert_eq!(stored.entity.x, 7);

    let raw = h.store.get("items", &a_p1()).await.unwrap().unwrap();
    assert!(raw.bag.get("LockedAt").is_none());
    assert_eq!(raw.etag, stored.etag);
}

// ── Rejection ───────────────────────────────────────────────────

async fn plant_sentinel(store: &dyn TableStore, age: ChronoDuration) {
    let bag = PropertyBag::new()
        .with("Id", "A")
        .with("Part", "P1")
        .with("X", 0i64)
        .with("LockedAt", Utc::now() - age);
    store
        .put("items", &a_p1(), bag, WriteCondition::Any)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn held_lock_times_out() {
    let (h, items) = item_table();
    plant_sentinel(h.store.as_ref(), ChronoDuration::zero()).await;
    let ran = AtomicBool::new(false);
    let options = LockOptions::default()
        .with_timeout(Duration::from_secs(1))
        .with_retry_delay(Duration::from_millis(100));

    let start = Instant::now();
    let outcome = items
        .locked_update(&a_p1(), &options, |_: &Item| true, |item| {
            ran.store(true, Ordering::SeqCst);
            async move { bump(item) }
        })
        .await
        .unwrap();

    assert!(matches!(outcome, LockedOutcome::Rejected(LockRejection::Timeout)));
    assert!(!ran.load(Ordering::SeqCst));
    assert!(start.elapsed() >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn backoff_still_honours_timeout() {
    let (h, items) = item_table();
    plant_sentinel(h.store.as_ref(), ChronoDuration::zero()).await;
    let options = LockOptions::default()
        .with_timeout(Duration::from_secs(3))
        .with_retry_delay(Duration::from_millis(100))
        .with_backoff(Duration::from_secs(10));

    let start = Instant::now();
    let outcome = items
        .locked_update(&a_p1(), &options, |_: &Item| true, |item| async move { bump(item) })
        .await
        .unwrap();
    assert!(matches!(outcome, LockedOutcome::Rejected(LockRejection::Timeout)));
    assert!(start.elapsed() <= Duration::from_secs(3));
}

#[tokio::test]
async fn stale_lock_is_reclaimed() {
    let (h, items) = item_table();
    plant_sentinel(h.store.as_ref(), ChronoDuration::minutes(5)).await;

    let outcome = items
        .locked_update(
            &a_p1(),
            &LockOptions::default().with_stale_after(Duration::from_secs(60)),
            |_: &Item| true,
            |item| async move { bump(item) },
        )
        .await
        .unwrap();
    let (stored, ()) = outcome.completed().expect("stale sentinel reclaimed");
    assert_eq!(stored.entity.x, 1);
}

#[tokio::test]
async fn declined_by_predicate() {
    let (_h, items) = item_table();
    items.create(&make_item("A", "P1", 50)).await.unwrap();
    let outcome = items
        .locked_update(
            &a_p1(),
            &LockOptions::default(),
            |item: &Item| item.x < 10,
            |item| async move { bump(item) },
        )
        .await
        .unwrap();
    assert!(matches!(outcome, LockedOutcome::Rejected(LockRejection::Declined)));
    assert_eq!(items.get(&a_p1()).await.unwrap().unwrap().entity.x, 50);
}

#[tokio::test]
async fn missing_row_is_not_found() {
    let (_h, items) = item_table();
    let outcome = items
        .with_lock(&a_p1(), |item| async move { bump(item) })
        .await
        .unwrap();
    assert!(matches!(outcome, LockedOutcome::NotFound));
}

// ── Failure inside the critical section ─────────────────────────

#[tokio::test]
async fn takeover_during_critical_section_is_lock_lost() {
    let (h, items) = item_table();
    items.create(&make_item("A", "P1", 0)).await.unwrap();
    let store = Arc::clone(&h.store);

    let err = items
        .with_lock(&a_p1(), move |item| async move {
            let bag = PropertyBag::new()
                .with("Id", "A")
                .with("Part", "P1")
                .with("X", 999i64);
            store
                .put("items", &a_p1(), bag, WriteCondition::Any)
                .await
                .unwrap();
            bump(item)
        })
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::LockLost(ref keys) if keys == &a_p1()));
    // The critical section's result was not written over the newer state.
    assert_eq!(items.get(&a_p1()).await.unwrap().unwrap().entity.x, 999);
}

#[tokio::test]
async fn failing_critical_section_releases_lock_unchanged() {
    let (h, items) = item_table();
    items.create(&make_item("A", "P1", 3)).await.unwrap();

    let err = items
        .with_lock(&a_p1(), |_item: Item| async move {
            Err::<(Item, ()), _>(EngineError::Configuration("boom".into()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));

    let raw = h.store.get("items", &a_p1()).await.unwrap().unwrap();
    assert!(raw.bag.get("LockedAt").is_none());
    assert_eq!(items.get(&a_p1()).await.unwrap().unwrap().entity.x, 3);

    let next = items
        .with_lock(&a_p1(), |item| async move { bump(item) })
        .await
        .unwrap();
    assert!(next.completed().is_some());
}

#[tokio::test]
async fn key_change_in_critical_section_is_rejected() {
    let (h, items) = item_table();
    items.create(&make_item("A", "P1", 3)).await.unwrap();

    let err = items
        .with_lock(&a_p1(), |item| async move {
            let mut item = item;
            item.part = "P2".into();
            Ok::<_, EngineError>((item, ()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::KeyChanged { .. }));

    let raw = h.store.get("items", &a_p1()).await.unwrap().unwrap();
    assert!(raw.bag.get("LockedAt").is_none());
    assert_eq!(h.store.row_count("items"), 1);
}
