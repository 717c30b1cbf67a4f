//! Tool registry contract.
//!
//! Tools are deterministic `execute(args) -> outcome` units. They enforce
//! their own authorization; the core never encodes tool policy anywhere
//! else.

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolStatus {
    Ok,
    Failed,
}

#[derive(Clone, Debug)]
pub struct ToolOutcome {
    pub status: ToolStatus,
    pub result: Value,
    pub error: Option<String>,
    pub metadata: FxHashMap<String, Value>,
}

impl ToolOutcome {
    #[must_use]
    pub fn ok(result: Value) -> Self {
        Self {
            status: ToolStatus::Ok,
            result,
            error: None,
            metadata: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Failed,
            result: Value::Null,
            error: Some(error.into()),
            metadata: FxHashMap::default(),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn key(&self) -> &str;
    async fn execute(&self, args: Value) -> ToolOutcome;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: FxHashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.key().to_string(), tool);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }
}

/// Run a tool with bounded retries on failure. Transient errors (a network
/// blip, store contention inside the tool) get `attempts` tries with a short
/// linear backoff; the last failure is returned as-is.
pub async fn execute_with_retry(tool: &Arc<dyn Tool>, args: Value, attempts: u32) -> ToolOutcome {
    let attempts = attempts.max(1);
    let mut last = ToolOutcome::failed("tool did not run");
    for attempt in 0..attempts {
        last = tool.execute(args.clone()).await;
        if last.status == ToolStatus::Ok {
            return last;
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(std::time::Duration::from_millis(100 * u64::from(attempt + 1)))
                .await;
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyTool {
        failures_before_success: AtomicU32,
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn key(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, _args: Value) -> ToolOutcome {
            if self.failures_before_success.fetch_update(
                Ordering::SeqCst,
                Ordering::SeqCst,
                |n| n.checked_sub(1),
            ).is_ok()
            {
                ToolOutcome::failed("transient")
            } else {
                ToolOutcome::ok(json!("done"))
            }
        }
    }

    #[tokio::test]
    async fn retry_succeeds_within_budget() {
        let tool: Arc<dyn Tool> = Arc::new(FlakyTool {
            failures_before_success: AtomicU32::new(2),
        });
        let outcome = execute_with_retry(&tool, json!({}), 3).await;
        assert_eq!(outcome.status, ToolStatus::Ok);
    }

    #[tokio::test]
    async fn retry_returns_last_failure_beyond_budget() {
        let tool: Arc<dyn Tool> = Arc::new(FlakyTool {
            failures_before_success: AtomicU32::new(5),
        });
        let outcome = execute_with_retry(&tool, json!({}), 2).await;
        assert_eq!(outcome.status, ToolStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("transient"));
    }
}
