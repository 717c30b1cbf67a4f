mod common;

use chrono::Duration;
use serde_json::json;

use nervecore::signal::{types, Signal, SignalStatus};

use common::test_kernel;

fn durable_signal(id: &str) -> Signal {
    Signal::new(
        types::API_MESSAGE_RECEIVED,
        "api",
        json!({ "text": "hello" }),
    )
    .with_id(id)
    .durable()
}

#[tokio::test]
async fn claim_moves_rows_to_processing_once() {
    let kernel = test_kernel().await;
    let queue = kernel.store.signal_queue();

    queue.enqueue(&durable_signal("s1")).await.unwrap();
    queue.enqueue(&durable_signal("s2")).await.unwrap();

    let first = queue.claim(10, "w1").await.unwrap();
    assert_eq!(first.len(), 2);

    // Nothing left for a second claimant.
    let second = queue.claim(10, "w2").await.unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn complete_marks_terminal_status_with_error() {
    let kernel = test_kernel().await;
    let queue = kernel.store.signal_queue();

    queue.enqueue(&durable_signal("s1")).await.unwrap();
    queue.claim(1, "w1").await.unwrap();
    queue.complete("s1", false, Some("deadline exceeded")).await.unwrap();

    let stored = queue.get("s1").await.unwrap().unwrap();
    assert_eq!(stored.status, SignalStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("deadline exceeded"));
}

#[tokio::test]
async fn stale_processing_rows_return_to_queued() {
    let kernel = test_kernel().await;
    let queue = kernel.store.signal_queue();

    queue.enqueue(&durable_signal("s1")).await.unwrap();
    queue.claim(1, "crashed-worker").await.unwrap();

    // A generous lease leaves the claim alone.
    assert_eq!(queue.reclaim_stale(Duration::minutes(5)).await.unwrap(), 0);
    // A negative lease places the cutoff in the future: the claim is stale.
    assert_eq!(queue.reclaim_stale(Duration::seconds(-1)).await.unwrap(), 1);

    let stored = queue.get("s1").await.unwrap().unwrap();
    assert_eq!(stored.status, SignalStatus::Queued);
}

#[tokio::test]
async fn overdue_claim_skips_fresh_rows() {
    let kernel = test_kernel().await;
    let queue = kernel.store.signal_queue();

    queue.enqueue(&durable_signal("fresh")).await.unwrap();

    // A 30s minimum age must not pick up the row that was just enqueued.
    let claimed = queue
        .claim_overdue(10, "poller", Duration::seconds(30))
        .await
        .unwrap();
    assert!(claimed.is_empty());

    // With no minimum age it is fair game.
    let claimed = queue
        .claim_overdue(10, "poller", Duration::seconds(-1))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, "fresh");
}

#[tokio::test]
async fn round_trip_preserves_payload_and_correlation() {
    let kernel = test_kernel().await;
    let queue = kernel.store.signal_queue();

    let signal = Signal::new(
        types::API_MESSAGE_RECEIVED,
        "api",
        json!({ "text": "hello", "metadata": { "locale": "en" } }),
    )
    .with_correlation_id("C1")
    .durable();
    queue.enqueue(&signal).await.unwrap();

    let claimed = queue.claim(1, "w1").await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].payload, signal.payload);
    assert_eq!(claimed[0].correlation_id, "C1");
    assert_eq!(claimed[0].signal_type, types::API_MESSAGE_RECEIVED);
}
