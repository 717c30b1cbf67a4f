//! Kernel configuration and the runtime facade handed to action handlers.

pub mod config;
pub mod llm;
pub mod renderer;
pub mod tools;

use std::sync::Arc;

pub use config::NerveConfig;
pub use llm::{provider_for, EchoProvider, LlmError, LlmProvider};
pub use renderer::{response_keys, Renderer, TemplateRenderer};
pub use tools::{execute_with_retry, Tool, ToolOutcome, ToolRegistry, ToolStatus};

use crate::store::NerveStore;

/// Read-only facade actions receive alongside each signal.
///
/// Actions declare their effects in the returned result and never touch the
/// bus or write to the store directly; the engine's transaction applies
/// them. The store handle here is for reads (principals, preferences, queue
/// depths) only.
#[derive(Clone)]
pub struct RuntimeContext {
    pub config: Arc<NerveConfig>,
    pub store: NerveStore,
    pub renderer: Arc<dyn Renderer>,
    pub tools: Arc<ToolRegistry>,
    pub llm: Arc<dyn LlmProvider>,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(
        config: Arc<NerveConfig>,
        store: NerveStore,
        renderer: Arc<dyn Renderer>,
        tools: Arc<ToolRegistry>,
        llm: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            config,
            store,
            renderer,
            tools,
            llm,
        }
    }

    /// Facade with default collaborators, for tests and simple embeddings.
    #[must_use]
    pub fn with_defaults(config: NerveConfig, store: NerveStore) -> Self {
        let provider = provider_for(&config.llm_provider);
        Self {
            config: Arc::new(config),
            store,
            renderer: Arc::new(TemplateRenderer::new()),
            tools: Arc::new(ToolRegistry::new()),
            llm: provider,
        }
    }
}
