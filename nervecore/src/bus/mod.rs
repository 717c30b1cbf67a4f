//! In-process signal bus.
//!
//! The bus is transport-only: producers publish [`Signal`] values, the FSM
//! engine owns the single consuming receiver, and auxiliary taps (metrics,
//! gateway drains) receive best-effort clones. Durable signals are persisted
//! to the signal queue *before* the in-memory send so a crash between publish
//! and consume cannot lose them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::signal::Signal;

/// Behavior when the bounded queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PublishMode {
    /// Publishers wait for capacity.
    #[default]
    Block,
    /// Publishers get [`BusError::Full`] immediately.
    FailFast,
}

#[derive(Clone, Debug)]
pub struct BusConfig {
    pub capacity: usize,
    pub mode: PublishMode,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: Self::DEFAULT_CAPACITY,
            mode: PublishMode::Block,
        }
    }
}

impl BusConfig {
    pub const DEFAULT_CAPACITY: usize = 1024;

    #[must_use]
    pub fn new(capacity: usize, mode: PublishMode) -> Self {
        Self {
            capacity: if capacity == 0 {
                Self::DEFAULT_CAPACITY
            } else {
                capacity
            },
            mode,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum BusError {
    #[error("bus is closed")]
    #[diagnostic(
        code(nervecore::bus::closed),
        help("The kernel is shutting down; no new signals are accepted.")
    )]
    Closed,

    #[error("bus is full ({capacity} signals pending)")]
    #[diagnostic(
        code(nervecore::bus::full),
        help("Raise NERVE_BUS_CAPACITY or switch the publisher to blocking mode.")
    )]
    Full { capacity: usize },

    #[error("durable persistence failed: {message}")]
    #[diagnostic(code(nervecore::bus::durable))]
    Durable { message: String },
}

/// Write half of the durable signal queue, as seen by the bus.
#[async_trait]
pub trait DurableSink: Send + Sync {
    async fn persist(&self, signal: &Signal) -> Result<(), String>;
}

/// Bounded pub/sub of signals with a single consuming receiver.
pub struct SignalBus {
    tx: Mutex<Option<flume::Sender<Signal>>>,
    rx: Mutex<Option<flume::Receiver<Signal>>>,
    taps: Mutex<Vec<flume::Sender<Signal>>>,
    closed: AtomicBool,
    mode: PublishMode,
    capacity: usize,
    durable_sink: Mutex<Option<Arc<dyn DurableSink>>>,
}

impl SignalBus {
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        let (tx, rx) = flume::bounded(config.capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            taps: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            mode: config.mode,
            capacity: config.capacity,
            durable_sink: Mutex::new(None),
        }
    }

    /// Install the durable write half. Called once during kernel wiring.
    pub fn set_durable_sink(&self, sink: Arc<dyn DurableSink>) {
        *self.durable_sink.lock().expect("durable sink poisoned") = Some(sink);
    }

    /// Take the single consuming receiver. Panics if taken twice: the FSM
    /// consumer is the only component allowed to drain the bus.
    pub fn take_consumer(&self) -> BusConsumer {
        let rx = self
            .rx
            .lock()
            .expect("consumer poisoned")
            .take()
            .expect("bus consumer already taken");
        BusConsumer { rx }
    }

    /// Subscribe a best-effort tap. Taps receive clones of every published
    /// signal and never block the FSM path.
    pub fn subscribe_tap(&self) -> flume::Receiver<Signal> {
        let (tx, rx) = flume::unbounded();
        self.taps.lock().expect("taps poisoned").push(tx);
        rx
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Publish a signal. Durable signals hit the queue first; the in-memory
    /// send then respects the configured backpressure mode.
    pub async fn publish(&self, signal: Signal) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        if signal.durable {
            let sink = self
                .durable_sink
                .lock()
                .expect("durable sink poisoned")
                .clone();
            if let Some(sink) = sink {
                sink.persist(&signal)
                    .await
                    .map_err(|message| BusError::Durable { message })?;
            }
        }

        self.fan_out_taps(&signal);

        let sender = {
            let guard = self.tx.lock().expect("sender poisoned");
            guard.as_ref().cloned()
        };
        let Some(sender) = sender else {
            return Err(BusError::Closed);
        };

        match self.mode {
            PublishMode::Block => sender
                .send_async(signal)
                .await
                .map_err(|_| BusError::Closed),
            PublishMode::FailFast => sender.try_send(signal).map_err(|err| match err {
                flume::TrySendError::Full(_) => BusError::Full {
                    capacity: self.capacity,
                },
                flume::TrySendError::Disconnected(_) => BusError::Closed,
            }),
        }
    }

    /// Refuse new publishes and let the consumer drain what is queued.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.tx.lock().expect("sender poisoned").take();
        self.taps.lock().expect("taps poisoned").clear();
    }

    fn fan_out_taps(&self, signal: &Signal) {
        let mut taps = self.taps.lock().expect("taps poisoned");
        // Drop taps whose receivers went away.
        taps.retain(|tap| tap.send(signal.clone()).is_ok());
    }
}

/// The single consuming end of the bus.
pub struct BusConsumer {
    rx: flume::Receiver<Signal>,
}

impl BusConsumer {
    /// Receive the next signal. Returns `None` once the bus is closed and
    /// fully drained.
    pub async fn recv(&self) -> Option<Signal> {
        self.rx.recv_async().await.ok()
    }

    /// Number of signals waiting in the in-memory queue.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}
