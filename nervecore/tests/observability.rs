use chrono::{Duration, Utc};

use nervecore::observability::{RetentionConfig, TraceEventRecord, TraceSink, TraceStore};

async fn store_with(retention: RetentionConfig) -> TraceStore {
    TraceStore::connect_in_memory(retention).await.expect("trace store")
}

fn record(event: &str, level: &str, correlation: &str) -> TraceEventRecord {
    TraceEventRecord {
        level: level.to_string(),
        event: event.to_string(),
        correlation_id: Some(correlation.to_string()),
        ..TraceEventRecord::default()
    }
}

#[tokio::test]
async fn events_are_queryable_by_correlation_id() {
    let store = store_with(RetentionConfig::default()).await;
    store.record(record("fsm.transition", "info", "C1")).await.unwrap();
    store.record(record("delivery_receipt", "info", "C1")).await.unwrap();
    store.record(record("fsm.transition", "info", "C2")).await.unwrap();

    let chain = store.events_for_correlation("C1").await.unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].event, "fsm.transition");
    assert_eq!(chain[1].event, "delivery_receipt");
}

#[tokio::test]
async fn daily_rollups_count_per_event_and_level() {
    let store = store_with(RetentionConfig::default()).await;
    for _ in 0..3 {
        store.record(record("fsm.transition", "info", "C1")).await.unwrap();
    }
    store.record(record("fsm.transition", "error", "C1")).await.unwrap();

    let day = Utc::now().to_rfc3339()[..10].to_string();
    assert_eq!(store.rollup_count(&day, "fsm.transition", "info").await.unwrap(), 3);
    assert_eq!(store.rollup_count(&day, "fsm.transition", "error").await.unwrap(), 1);
}

#[tokio::test]
async fn retention_prunes_by_severity_ttl() {
    let store = store_with(RetentionConfig {
        non_error_ttl_days: 14,
        error_ttl_days: 30,
        max_rows: 1_000_000,
        maintenance_interval: std::time::Duration::from_secs(3600),
    })
    .await;

    let old = Some(Utc::now() - Duration::days(20));
    let mut stale_info = record("fsm.transition", "info", "old-info");
    stale_info.ts = old;
    let mut stale_error = record("fsm.action_failed", "error", "old-error");
    stale_error.ts = old;
    store.record(stale_info).await.unwrap();
    store.record(stale_error).await.unwrap();
    store.record(record("fsm.transition", "info", "fresh")).await.unwrap();

    store.run_maintenance().await.unwrap();

    // 20 days old: the info row is past its TTL, the error row is not.
    assert!(store.events_for_correlation("old-info").await.unwrap().is_empty());
    assert_eq!(store.events_for_correlation("old-error").await.unwrap().len(), 1);
    assert_eq!(store.events_for_correlation("fresh").await.unwrap().len(), 1);
}

#[tokio::test]
async fn row_cap_prunes_oldest_first() {
    let store = store_with(RetentionConfig {
        non_error_ttl_days: 365,
        error_ttl_days: 365,
        max_rows: 5,
        maintenance_interval: std::time::Duration::from_secs(3600),
    })
    .await;

    for n in 0..8 {
        store
            .record(record("fsm.transition", "info", &format!("C{n}")))
            .await
            .unwrap();
    }
    store.run_maintenance().await.unwrap();

    assert_eq!(store.total_rows().await.unwrap(), 5);
    assert!(store.events_for_correlation("C0").await.unwrap().is_empty());
    assert_eq!(store.events_for_correlation("C7").await.unwrap().len(), 1);
}

#[tokio::test]
async fn sink_builder_records_structured_fields() {
    let store = store_with(RetentionConfig::default()).await;
    let sink = TraceSink::new(store.clone());

    sink.event("tool.call", nervecore::observability::TraceLevel::Info)
        .correlation_id(Some("C9"))
        .tool("geocoder")
        .latency_ms(42)
        .status("ok")
        .record()
        .await;

    let events = store.events_for_correlation("C9").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tool.as_deref(), Some("geocoder"));
    assert_eq!(events[0].latency_ms, Some(42));
    assert_eq!(events[0].status.as_deref(), Some("ok"));
}
