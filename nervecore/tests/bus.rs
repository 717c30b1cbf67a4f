use std::sync::Arc;

use serde_json::json;

use nervecore::bus::{BusConfig, BusError, PublishMode, SignalBus};
use nervecore::signal::{types, Signal};

fn tick(n: u32) -> Signal {
    Signal::new(types::TIMER_FIRED, "clock", json!({ "n": n }))
}

#[tokio::test]
async fn publish_and_consume_preserves_fifo_per_producer() {
    let bus = SignalBus::new(BusConfig::default());
    let consumer = bus.take_consumer();

    for n in 0..5 {
        bus.publish(tick(n)).await.unwrap();
    }
    for n in 0..5 {
        let signal = consumer.recv().await.unwrap();
        assert_eq!(signal.payload.get("n").and_then(|v| v.as_u64()), Some(n));
    }
}

#[tokio::test]
async fn fail_fast_mode_reports_full_queue() {
    let bus = SignalBus::new(BusConfig::new(2, PublishMode::FailFast));
    let _consumer = bus.take_consumer();

    bus.publish(tick(0)).await.unwrap();
    bus.publish(tick(1)).await.unwrap();
    match bus.publish(tick(2)).await {
        Err(BusError::Full { capacity }) => assert_eq!(capacity, 2),
        other => panic!("expected Full, got {other:?}"),
    }
}

#[tokio::test]
async fn close_refuses_new_publishes_and_drains_pending() {
    let bus = SignalBus::new(BusConfig::default());
    let consumer = bus.take_consumer();

    bus.publish(tick(0)).await.unwrap();
    bus.publish(tick(1)).await.unwrap();
    bus.close();

    assert!(matches!(bus.publish(tick(2)).await, Err(BusError::Closed)));

    // Already-queued signals still drain, then the consumer sees the end.
    assert!(consumer.recv().await.is_some());
    assert!(consumer.recv().await.is_some());
    assert!(consumer.recv().await.is_none());
}

#[tokio::test]
async fn taps_see_clones_without_blocking_the_consumer() {
    let bus = SignalBus::new(BusConfig::default());
    let consumer = bus.take_consumer();
    let tap = bus.subscribe_tap();

    bus.publish(tick(7)).await.unwrap();

    let main = consumer.recv().await.unwrap();
    let tapped = tap.recv_async().await.unwrap();
    assert_eq!(main, tapped);
}

#[tokio::test]
async fn dropped_tap_does_not_break_publishing() {
    let bus = SignalBus::new(BusConfig::default());
    let _consumer = bus.take_consumer();
    let tap = bus.subscribe_tap();
    drop(tap);

    bus.publish(tick(0)).await.unwrap();
    bus.publish(tick(1)).await.unwrap();
}

struct RecordingSink {
    persisted: std::sync::Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl nervecore::bus::DurableSink for RecordingSink {
    async fn persist(&self, signal: &Signal) -> Result<(), String> {
        self.persisted
            .lock()
            .expect("persisted poisoned")
            .push(signal.id.clone());
        Ok(())
    }
}

#[tokio::test]
async fn durable_signals_hit_the_sink_before_delivery() {
    let bus = SignalBus::new(BusConfig::default());
    let consumer = bus.take_consumer();
    let sink = Arc::new(RecordingSink {
        persisted: std::sync::Mutex::new(Vec::new()),
    });
    bus.set_durable_sink(Arc::clone(&sink) as Arc<dyn nervecore::bus::DurableSink>);

    let durable = tick(0).durable();
    let durable_id = durable.id.clone();
    bus.publish(durable).await.unwrap();
    bus.publish(tick(1)).await.unwrap();

    let _ = consumer.recv().await.unwrap();
    let _ = consumer.recv().await.unwrap();

    let persisted = sink.persisted.lock().unwrap();
    assert_eq!(persisted.as_slice(), &[durable_id]);
}
