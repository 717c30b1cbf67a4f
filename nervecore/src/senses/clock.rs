//! Clock sense: ephemeral heartbeat ticks.
//!
//! `timer.fired` ticks are internal and never durable; the timed scheduler,
//! not this sense, owns scheduled dispatches.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::Sense;
use crate::bus::SignalBus;
use crate::signal::{types, Signal};

pub struct ClockSense {
    interval: Duration,
}

impl ClockSense {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Sense for ClockSense {
    fn key(&self) -> &str {
        "clock"
    }

    fn signals(&self) -> Vec<&'static str> {
        vec![types::TIMER_FIRED]
    }

    fn start(&self, bus: Arc<SignalBus>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let tick = Signal::new(
                            types::TIMER_FIRED,
                            "clock",
                            json!({ "tick_at": chrono::Utc::now().to_rfc3339() }),
                        );
                        if bus.publish(tick).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
