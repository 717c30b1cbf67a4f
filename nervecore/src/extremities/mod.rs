/*!
Extremity adapters.

An extremity owns channel-specific delivery of normalized outbound messages
and must not consult core state. The [`DeliveryHub`] routes by
`channel_type`, reports every attempt as a `delivery_receipt` trace event,
and treats delivery as best-effort: failures are traced, not retried.
*/

use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::observability::{TraceLevel, TraceSink};
use crate::signal::NormalizedOutboundMessage;

#[derive(Debug, Error, Diagnostic)]
pub enum ExtremityError {
    #[error("delivery failed: {message}")]
    #[diagnostic(code(nervecore::extremities::delivery))]
    Delivery { message: String },

    #[error("no extremity registered for channel `{channel_type}`")]
    #[diagnostic(code(nervecore::extremities::unknown_channel))]
    UnknownChannel { channel_type: String },
}

#[async_trait]
pub trait Extremity: Send + Sync {
    fn channel_type(&self) -> &str;
    async fn deliver(&self, message: &NormalizedOutboundMessage) -> Result<(), ExtremityError>;
}

/// Routes outbound messages to the extremity owning their channel.
pub struct DeliveryHub {
    routes: FxHashMap<String, Arc<dyn Extremity>>,
    trace: Option<Arc<TraceSink>>,
}

impl DeliveryHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: FxHashMap::default(),
            trace: None,
        }
    }

    #[must_use]
    pub fn with_trace(mut self, trace: Arc<TraceSink>) -> Self {
        self.trace = Some(trace);
        self
    }

    #[must_use]
    pub fn register(mut self, extremity: Arc<dyn Extremity>) -> Self {
        self.routes
            .insert(extremity.channel_type().to_string(), extremity);
        self
    }

    pub async fn deliver(&self, message: NormalizedOutboundMessage) {
        let result = match self.routes.get(&message.channel_type) {
            Some(extremity) => extremity.deliver(&message).await,
            None => Err(ExtremityError::UnknownChannel {
                channel_type: message.channel_type.clone(),
            }),
        };

        if let Some(trace) = &self.trace {
            let (level, status, error_code) = match &result {
                Ok(()) => (TraceLevel::Info, "delivered", None),
                Err(ExtremityError::UnknownChannel { .. }) => {
                    (TraceLevel::Warning, "failed", Some("unknown_channel"))
                }
                Err(_) => (TraceLevel::Warning, "failed", Some("delivery_error")),
            };
            let mut builder = trace
                .event("delivery_receipt", level)
                .correlation_id(Some(&message.correlation_id))
                .channel(&message.channel_type)
                .status(status);
            if let Some(code) = error_code {
                builder = builder.error_code(code);
            }
            builder.record().await;
        }

        if let Err(err) = result {
            tracing::warn!(
                channel = %message.channel_type,
                target = %message.channel_target,
                error = %err,
                "outbound delivery failed"
            );
        }
    }
}

impl Default for DeliveryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Stdout delivery for the local CLI channel.
pub struct CliExtremity;

#[async_trait]
impl Extremity for CliExtremity {
    fn channel_type(&self) -> &str {
        "cli"
    }

    async fn deliver(&self, message: &NormalizedOutboundMessage) -> Result<(), ExtremityError> {
        let mut stdout = std::io::stdout();
        writeln!(stdout, "{}", message.message).map_err(|err| ExtremityError::Delivery {
            message: err.to_string(),
        })?;
        stdout.flush().map_err(|err| ExtremityError::Delivery {
            message: err.to_string(),
        })
    }
}

/// Fan-out buffer for API/SSE clients.
///
/// The gateway subscribes per channel target for its event stream and
/// globally for synchronous request/response correlation. Dead subscriber
/// channels are dropped on the next delivery.
pub struct SseHub {
    by_target: Mutex<FxHashMap<String, Vec<flume::Sender<NormalizedOutboundMessage>>>>,
    all: Mutex<Vec<flume::Sender<NormalizedOutboundMessage>>>,
}

impl SseHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_target: Mutex::new(FxHashMap::default()),
            all: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe_target(&self, channel_target: &str) -> flume::Receiver<NormalizedOutboundMessage> {
        let (tx, rx) = flume::unbounded();
        self.by_target
            .lock()
            .expect("sse targets poisoned")
            .entry(channel_target.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub fn subscribe_all(&self) -> flume::Receiver<NormalizedOutboundMessage> {
        let (tx, rx) = flume::unbounded();
        self.all.lock().expect("sse subscribers poisoned").push(tx);
        rx
    }
}

impl Default for SseHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extremity for SseHub {
    fn channel_type(&self) -> &str {
        "api"
    }

    async fn deliver(&self, message: &NormalizedOutboundMessage) -> Result<(), ExtremityError> {
        {
            let mut by_target = self.by_target.lock().expect("sse targets poisoned");
            if let Some(subscribers) = by_target.get_mut(&message.channel_target) {
                subscribers.retain(|tx| tx.send(message.clone()).is_ok());
                if subscribers.is_empty() {
                    by_target.remove(&message.channel_target);
                }
            }
        }
        let mut all = self.all.lock().expect("sse subscribers poisoned");
        all.retain(|tx| tx.send(message.clone()).is_ok());
        Ok(())
    }
}

/// Captures deliveries for assertions. Mirrors the in-memory sink the test
/// suite uses everywhere.
#[derive(Clone)]
pub struct MemoryExtremity {
    channel_type: String,
    messages: Arc<Mutex<Vec<NormalizedOutboundMessage>>>,
}

impl MemoryExtremity {
    #[must_use]
    pub fn new(channel_type: &str) -> Self {
        Self {
            channel_type: channel_type.to_string(),
            messages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn snapshot(&self) -> Vec<NormalizedOutboundMessage> {
        self.messages.lock().expect("messages poisoned").clone()
    }
}

#[async_trait]
impl Extremity for MemoryExtremity {
    fn channel_type(&self) -> &str {
        &self.channel_type
    }

    async fn deliver(&self, message: &NormalizedOutboundMessage) -> Result<(), ExtremityError> {
        self.messages
            .lock()
            .expect("messages poisoned")
            .push(message.clone());
        Ok(())
    }
}
