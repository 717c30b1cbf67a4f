use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use nervecore::heart::Heart;
use nervecore::runtime::NerveConfig;
use nervecore::signal::{types, Signal};
use nervecore::store::timed::TimedStatus;

fn temp_config() -> NerveConfig {
    let db_path = std::env::temp_dir().join(format!("nervecore-test-{}.db", Uuid::new_v4()));
    NerveConfig {
        observability_db_path: db_path.clone(),
        db_path,
        ..NerveConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn kernel_processes_a_reminder_then_shuts_down_cleanly() {
    let config = temp_config();
    let db_path = config.db_path.clone();

    let heart = Heart::start(config, vec![]).await.expect("boot");
    let heart = heart.without_gateway();
    let bus = heart.bus();
    let store = heart.store().clone();

    bus.publish(
        Signal::new(
            types::CLI_MESSAGE_RECEIVED,
            "cli",
            json!({
                "text": "remind me to water the plants in 1 minute",
                "channel_type": "cli",
                "channel_target": "local",
                "user_id": "local",
            }),
        )
        .with_correlation_id("E2E-1")
        .durable(),
    )
    .await
    .expect("publish message");
    bus.publish(Signal::new(types::SHUTDOWN_REQUESTED, "test", json!({})))
        .await
        .expect("publish shutdown");

    // The heart exits on its own once the FSM reaches the terminal state.
    tokio::time::timeout(Duration::from_secs(20), heart.run())
        .await
        .expect("kernel should exit within the window")
        .expect("clean shutdown");

    // The reminder survived as a pending timed row.
    let pending = store.timed().list_pending(10).await.expect("timed rows");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, TimedStatus::Pending);
    assert_eq!(pending[0].correlation_id.as_deref(), Some("E2E-1"));

    // The trace records both steps, ending in the terminal state.
    let trace = store.fsm().recent_trace(10).await.expect("trace");
    assert!(trace.iter().any(|row| row.state_after == "shutting_down"
        && row.action_key.as_deref() == Some("shutdown")));
    assert!(trace
        .iter()
        .any(|row| row.correlation_id.as_deref() == Some("E2E-1")));

    // New publishes are refused after shutdown.
    assert!(bus
        .publish(Signal::new(types::TIMER_FIRED, "clock", json!({})))
        .await
        .is_err());

    let _ = std::fs::remove_file(&db_path);
}
