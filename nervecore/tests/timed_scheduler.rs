mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use nervecore::signal::types;
use nervecore::store::timed::{NewTimedSignal, TimedStatus};
use nervecore::timed::TimedScheduler;

use common::{test_kernel, TestKernel};

fn scheduler(kernel: &TestKernel) -> TimedScheduler {
    TimedScheduler::new(
        &kernel.store,
        Arc::clone(&kernel.bus),
        Arc::clone(&kernel.trace),
        StdDuration::from_secs(1),
        StdDuration::from_secs(300),
    )
}

fn timed_row(trigger_at: chrono::DateTime<Utc>, rrule: Option<&str>) -> NewTimedSignal {
    NewTimedSignal {
        id: Uuid::new_v4().to_string(),
        trigger_at,
        rrule: rrule.map(ToString::to_string),
        timezone: None,
        signal_type: "reminder".to_string(),
        payload: json!({ "summary": "water the plants", "idempotency_key": "k1" }),
        target: Some("local".to_string()),
        origin: Some("cli".to_string()),
        correlation_id: Some("C1".to_string()),
    }
}

#[tokio::test]
async fn due_row_fires_and_carries_correlation_id() {
    let kernel = test_kernel().await;
    let scheduler = scheduler(&kernel);
    let tap = kernel.bus.subscribe_tap();

    let row = timed_row(Utc::now() - Duration::seconds(5), None);
    kernel.store.timed().insert(&row).await.unwrap();

    let dispatched = scheduler.tick_once(Utc::now()).await.unwrap();
    assert_eq!(dispatched, 1);

    let fired = tap.recv_async().await.unwrap();
    assert_eq!(fired.signal_type, types::TIMED_SIGNAL_FIRED);
    assert_eq!(fired.correlation_id, "C1");
    assert_eq!(
        fired.payload.get("timed_signal_id").and_then(|v| v.as_str()),
        Some(row.id.as_str())
    );
    assert_eq!(
        fired
            .payload
            .get("payload")
            .and_then(|p| p.get("summary"))
            .and_then(|v| v.as_str()),
        Some("water the plants")
    );

    let stored = kernel.store.timed().get(&row.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TimedStatus::Fired);
    assert!(stored.fired_at.is_some());
    assert_eq!(stored.attempts, 1);
}

#[tokio::test]
async fn future_row_stays_pending() {
    let kernel = test_kernel().await;
    let scheduler = scheduler(&kernel);

    let row = timed_row(Utc::now() + Duration::minutes(10), None);
    kernel.store.timed().insert(&row).await.unwrap();

    assert_eq!(scheduler.tick_once(Utc::now()).await.unwrap(), 0);
    let stored = kernel.store.timed().get(&row.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TimedStatus::Pending);
}

#[tokio::test]
async fn one_shot_beyond_catchup_window_fails() {
    let kernel = test_kernel().await;
    let scheduler = scheduler(&kernel);

    let row = timed_row(Utc::now() - Duration::hours(2), None);
    kernel.store.timed().insert(&row).await.unwrap();

    assert_eq!(scheduler.tick_once(Utc::now()).await.unwrap(), 0);
    let stored = kernel.store.timed().get(&row.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TimedStatus::Failed);
    assert_eq!(stored.last_error.as_deref(), Some("missed_dispatch_window"));
}

#[tokio::test]
async fn recurring_beyond_window_skips_to_next_occurrence() {
    let kernel = test_kernel().await;
    let scheduler = scheduler(&kernel);

    let row = timed_row(
        Utc::now() - Duration::days(2),
        Some("FREQ=DAILY;BYHOUR=7;BYMINUTE=0"),
    );
    kernel.store.timed().insert(&row).await.unwrap();

    assert_eq!(scheduler.tick_once(Utc::now()).await.unwrap(), 0);
    let stored = kernel.store.timed().get(&row.id).await.unwrap().unwrap();
    // The occurrence was skipped and the cursor parked in the future.
    assert_eq!(stored.status, TimedStatus::Pending);
    let next = stored.next_trigger_at.expect("cursor advanced");
    assert!(next > Utc::now());
}

#[tokio::test]
async fn recurring_fire_reschedules_next_occurrence() {
    let kernel = test_kernel().await;
    let scheduler = scheduler(&kernel);
    let tap = kernel.bus.subscribe_tap();

    let row = timed_row(Utc::now() - Duration::minutes(1), Some("FREQ=HOURLY"));
    kernel.store.timed().insert(&row).await.unwrap();

    assert_eq!(scheduler.tick_once(Utc::now()).await.unwrap(), 1);
    let _ = tap.recv_async().await.unwrap();

    let stored = kernel.store.timed().get(&row.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TimedStatus::Pending);
    let next = stored.next_trigger_at.expect("rescheduled");
    assert!(next > Utc::now() - Duration::minutes(5));
}

#[tokio::test]
async fn insert_is_idempotent_on_row_id() {
    let kernel = test_kernel().await;
    let row = timed_row(Utc::now() + Duration::minutes(1), None);
    assert!(kernel.store.timed().insert(&row).await.unwrap());
    assert!(!kernel.store.timed().insert(&row).await.unwrap());
}

#[tokio::test]
async fn stale_processing_claim_is_reclaimed() {
    let kernel = test_kernel().await;
    let scheduler = scheduler(&kernel);
    let repo = kernel.store.timed();

    let row = timed_row(Utc::now() - Duration::seconds(5), None);
    repo.insert(&row).await.unwrap();

    // A claim that never completed.
    let claimed = repo.claim_due(Utc::now(), "dead-worker").await.unwrap();
    assert_eq!(claimed.len(), 1);

    // Within the lease nothing happens; claim_due sees no pending rows.
    assert_eq!(scheduler.tick_once(Utc::now()).await.unwrap(), 0);
    let stored = repo.get(&row.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TimedStatus::Processing);

    // Past the lease the row returns to pending and the next tick fires it.
    let reclaimed = repo.reclaim_stale(Duration::seconds(-1)).await.unwrap();
    assert_eq!(reclaimed, 1);
    assert_eq!(scheduler.tick_once(Utc::now()).await.unwrap(), 1);
}

#[tokio::test]
async fn cancel_only_touches_pending_or_processing() {
    let kernel = test_kernel().await;
    let repo = kernel.store.timed();

    let row = timed_row(Utc::now() + Duration::minutes(1), None);
    repo.insert(&row).await.unwrap();
    assert!(repo.cancel(&row.id).await.unwrap());
    assert!(!repo.cancel(&row.id).await.unwrap());

    let stored = repo.get(&row.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TimedStatus::Cancelled);
}
