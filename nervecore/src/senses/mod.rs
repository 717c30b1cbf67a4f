/*!
Sense adapters.

A sense translates a channel's native events into signals of its declared
types and publishes them to the bus. Each sense runs as its own background
producer, dedupes at the source, and attaches a correlation id before the
signal enters the kernel.
*/

mod api;
mod cli;
mod clock;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use api::{ApiIngress, ApiSense};
pub use cli::CliSense;
pub use clock::ClockSense;

use crate::bus::SignalBus;

pub trait Sense: Send + Sync {
    /// Stable sense key (also used as the emitted signals' `source`).
    fn key(&self) -> &str;
    /// Signal types this sense may emit.
    fn signals(&self) -> Vec<&'static str>;
    /// Spawn the background producer. The producer must exit promptly when
    /// `shutdown` flips.
    fn start(&self, bus: Arc<SignalBus>, shutdown: watch::Receiver<bool>) -> JoinHandle<()>;
}

/// Starts and stops the configured senses as a group.
pub struct SenseManager {
    senses: Vec<Arc<dyn Sense>>,
    handles: Vec<JoinHandle<()>>,
}

impl SenseManager {
    #[must_use]
    pub fn new(senses: Vec<Arc<dyn Sense>>) -> Self {
        Self {
            senses,
            handles: Vec::new(),
        }
    }

    pub fn start_all(&mut self, bus: &Arc<SignalBus>, shutdown: &watch::Receiver<bool>) {
        for sense in &self.senses {
            tracing::info!(sense = sense.key(), signals = ?sense.signals(), "sense started");
            self.handles
                .push(sense.start(Arc::clone(bus), shutdown.clone()));
        }
    }

    /// Wait for every producer to acknowledge shutdown.
    pub async fn join_all(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}
