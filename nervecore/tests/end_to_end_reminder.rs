mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::json;

use nervecore::signal::{types, Signal};
use nervecore::store::timed::TimedStatus;
use nervecore::timed::TimedScheduler;

use common::test_kernel;

/// The whole reminder chain: a user message schedules a timed signal, the
/// scheduler fires it, the engine turns the dispatch into the user-facing
/// reminder. One correlation id threads the entire flow.
#[tokio::test]
async fn reminder_round_trip_preserves_correlation_id() {
    let kernel = test_kernel().await;
    let mut engine = kernel.engine().await;
    let scheduler = TimedScheduler::new(
        &kernel.store,
        Arc::clone(&kernel.bus),
        Arc::clone(&kernel.trace),
        StdDuration::from_secs(1),
        StdDuration::from_secs(300),
    );
    let tap = kernel.bus.subscribe_tap();

    // 1. Inbound message schedules the reminder.
    engine
        .step(
            Signal::new(
                types::CLI_MESSAGE_RECEIVED,
                "cli",
                json!({
                    "text": "remind me to water the plants in 1 second",
                    "channel_type": "cli",
                    "channel_target": "local",
                    "user_id": "local",
                }),
            )
            .with_correlation_id("RT-1")
            .durable(),
        )
        .await
        .unwrap();

    let pending = kernel.store.timed().list_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    let timed_id = pending[0].id.clone();

    // 2. The scheduler claims and fires the due row.
    let dispatched = scheduler
        .tick_once(Utc::now() + Duration::seconds(2))
        .await
        .unwrap();
    assert_eq!(dispatched, 1);
    let stored = kernel.store.timed().get(&timed_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TimedStatus::Fired);

    // The dispatch carries the scheduling correlation id.
    let fired = loop {
        let signal = tap.recv_async().await.unwrap();
        if signal.signal_type == types::TIMED_SIGNAL_FIRED {
            break signal;
        }
    };
    assert_eq!(fired.correlation_id, "RT-1");

    // 3. The engine consumes the dispatch and answers the user.
    engine.step(fired).await.unwrap();

    let outbox = kernel.cli_outbox.snapshot();
    assert_eq!(outbox.len(), 2, "acknowledgement plus reminder");
    let reminder = &outbox[1];
    assert!(reminder.message.contains("water the plants"));
    assert_eq!(reminder.correlation_id, "RT-1");
    assert_eq!(reminder.channel_target, "local");

    // Both FSM steps share the correlation id in the trace.
    let trace = kernel
        .store
        .fsm()
        .trace_for_correlation("RT-1")
        .await
        .unwrap();
    assert_eq!(trace.len(), 2);
    assert_eq!(trace[0].signal_type, types::CLI_MESSAGE_RECEIVED);
    assert_eq!(trace[1].signal_type, types::TIMED_SIGNAL_FIRED);
}
