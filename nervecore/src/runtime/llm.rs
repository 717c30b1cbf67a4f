//! LLM provider contract.
//!
//! Handlers that call a model see one method; which provider answers is a
//! deployment choice (`LLM_PROVIDER`). The kernel ships an echo provider so
//! tests and offline runs never need a network.

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum LlmError {
    #[error("provider `{provider}` is unavailable: {message}")]
    #[diagnostic(code(nervecore::llm::unavailable))]
    Unavailable { provider: String, message: String },
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(&self, system_prompt: &str, user_prompt: &str)
        -> Result<String, LlmError>;
}

/// Offline provider: returns the user prompt unchanged. Useful in tests and
/// as the default when no provider is configured.
pub struct EchoProvider;

#[async_trait]
impl LlmProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(
        &self,
        _system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, LlmError> {
        Ok(user_prompt.to_string())
    }
}

/// Select a provider by name. Concrete network providers are wired by the
/// embedding deployment; the kernel only carries the contract and must keep
/// functioning without a model.
pub fn provider_for(name: &str) -> Arc<dyn LlmProvider> {
    if name != "echo" {
        tracing::warn!(provider = name, "no built-in client for provider, using echo");
    }
    Arc::new(EchoProvider)
}
