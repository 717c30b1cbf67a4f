//! API sense: the gateway's inbound path.
//!
//! The gateway hands normalized requests to an [`ApiIngress`]; the sense's
//! background producer forwards them onto the bus, deduping on the caller's
//! message id so a retried HTTP request cannot double-enqueue.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashSet;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::Sense;
use crate::bus::SignalBus;
use crate::signal::{types, Signal};

const DEDUPE_WINDOW: usize = 1024;

/// Write half handed to the gateway.
#[derive(Clone)]
pub struct ApiIngress {
    tx: flume::Sender<Signal>,
}

impl ApiIngress {
    /// Queue a signal for ingestion. Returns `false` when the sense has
    /// stopped.
    pub fn submit(&self, signal: Signal) -> bool {
        self.tx.send(signal).is_ok()
    }
}

pub struct ApiSense {
    rx: flume::Receiver<Signal>,
}

impl ApiSense {
    #[must_use]
    pub fn channel() -> (ApiIngress, Self) {
        let (tx, rx) = flume::unbounded();
        (ApiIngress { tx }, Self { rx })
    }
}

impl Sense for ApiSense {
    fn key(&self) -> &str {
        "api"
    }

    fn signals(&self) -> Vec<&'static str> {
        vec![
            types::API_MESSAGE_RECEIVED,
            types::API_STATUS_REQUESTED,
            types::API_TIMED_SIGNALS_REQUESTED,
        ]
    }

    fn start(&self, bus: Arc<SignalBus>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let rx = self.rx.clone();
        tokio::spawn(async move {
            let mut seen: FxHashSet<String> = FxHashSet::default();
            let mut order: VecDeque<String> = VecDeque::new();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    incoming = rx.recv_async() => {
                        let signal = match incoming {
                            Ok(signal) => signal,
                            Err(_) => break,
                        };
                        if !seen.insert(signal.id.clone()) {
                            tracing::debug!(signal_id = %signal.id, "duplicate api submission dropped");
                            continue;
                        }
                        order.push_back(signal.id.clone());
                        if order.len() > DEDUPE_WINDOW {
                            if let Some(evicted) = order.pop_front() {
                                seen.remove(&evicted);
                            }
                        }
                        if bus.publish(signal).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
