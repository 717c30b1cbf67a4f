/*!
Typed plan registry and executor.

A plan is a schema-versioned unit of work. The registry maps
`(plan_kind, plan_version)` to a compiled JSON schema, an executor key, and
a deprecation flag. Actions submit plans as `queued` rows plus a `plan.run`
nudge; the executor worker claims queued instances, validates payloads,
dispatches by executor key, and feeds resulting messages and signals back
into the kernel.

Deprecated versions are readable but refused for new instances; a payload
that fails validation marks the plan `failed` with a structured error and a
calm safe-fallback message to the originating conversation.
*/

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use thiserror::Error;

use crate::runtime::RuntimeContext;
use crate::signal::{NormalizedOutboundMessage, Signal};
use crate::store::plans::{PlanInstance, PlanKindVersion, PlanStatus};
use crate::store::timed::NewTimedSignal;
use crate::store::StoreError;

mod executors;
mod worker;

pub use executors::{CreateReminderExecutor, RunTaskExecutor, SendMessageExecutor};
pub use worker::PlanWorker;

/// Plan kinds the kernel ships.
pub mod kinds {
    pub const CREATE_REMINDER: &str = "create_reminder";
    pub const SEND_MESSAGE: &str = "send_message";
    pub const RUN_TASK: &str = "run_task";
}

#[derive(Debug, Error, Diagnostic)]
pub enum PlanError {
    #[error("unknown plan kind {kind}@{version}")]
    #[diagnostic(code(nervecore::plans::unknown_kind))]
    UnknownKind { kind: String, version: i64 },

    #[error("plan kind {kind}@{version} is deprecated")]
    #[diagnostic(
        code(nervecore::plans::deprecated),
        help("Submit the current version; deprecated versions are read-only.")
    )]
    Deprecated { kind: String, version: i64 },

    #[error("payload validation failed: {message}")]
    #[diagnostic(code(nervecore::plans::validation))]
    Validation { message: String },

    #[error("schema for {kind}@{version} does not compile: {message}")]
    #[diagnostic(code(nervecore::plans::schema))]
    Schema {
        kind: String,
        version: i64,
        message: String,
    },

    #[error("no executor registered for key `{key}`")]
    #[diagnostic(code(nervecore::plans::unknown_executor))]
    UnknownExecutor { key: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// What an executor wants done after a run. Outbound messages and follow-up
/// signals re-enter the kernel through the worker.
#[derive(Debug, Default)]
pub struct ExecutorOutcome {
    pub status: PlanStatus,
    pub resolution: Option<String>,
    pub outbound_messages: Vec<NormalizedOutboundMessage>,
    pub next_signals: Vec<Signal>,
    pub timed_signals: Vec<NewTimedSignal>,
}

impl ExecutorOutcome {
    #[must_use]
    pub fn done() -> Self {
        Self {
            status: PlanStatus::Done,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait PlanExecutor: Send + Sync {
    fn key(&self) -> &str;
    async fn run(
        &self,
        plan: &PlanInstance,
        ctx: &RuntimeContext,
    ) -> Result<ExecutorOutcome, PlanError>;
}

struct RegistryEntry {
    spec: PlanKindVersion,
    validator: jsonschema::Validator,
}

/// In-memory registry of plan contracts, mirrored into the store at boot so
/// the catalog is inspectable.
#[derive(Default)]
pub struct PlanRegistry {
    entries: FxHashMap<(String, i64), RegistryEntry>,
    executors: FxHashMap<String, Arc<dyn PlanExecutor>>,
}

impl PlanRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_kind(&mut self, spec: PlanKindVersion) -> Result<(), PlanError> {
        let validator =
            jsonschema::validator_for(&spec.schema).map_err(|err| PlanError::Schema {
                kind: spec.plan_kind.clone(),
                version: spec.plan_version,
                message: err.to_string(),
            })?;
        self.entries.insert(
            (spec.plan_kind.clone(), spec.plan_version),
            RegistryEntry { spec, validator },
        );
        Ok(())
    }

    pub fn register_executor(&mut self, executor: Arc<dyn PlanExecutor>) {
        self.executors.insert(executor.key().to_string(), executor);
    }

    pub fn executor(&self, key: &str) -> Option<Arc<dyn PlanExecutor>> {
        self.executors.get(key).cloned()
    }

    pub fn get(&self, kind: &str, version: i64) -> Option<&PlanKindVersion> {
        self.entries
            .get(&(kind.to_string(), version))
            .map(|entry| &entry.spec)
    }

    /// Validate an instance payload against its contract. Deprecated
    /// versions are refused for new instances.
    pub fn validate_new(&self, kind: &str, version: i64, payload: &Value) -> Result<(), PlanError> {
        let entry = self.entries.get(&(kind.to_string(), version)).ok_or_else(|| {
            PlanError::UnknownKind {
                kind: kind.to_string(),
                version,
            }
        })?;
        if entry.spec.is_deprecated {
            return Err(PlanError::Deprecated {
                kind: kind.to_string(),
                version,
            });
        }
        let mut failures = entry.validator.iter_errors(payload).peekable();
        if failures.peek().is_some() {
            let message = failures
                .map(|err| format!("{}: {err}", err.instance_path))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(PlanError::Validation { message });
        }
        Ok(())
    }

    /// Mirror every registered contract into `plan_kind_versions`.
    pub async fn sync_to_store(&self, ctx: &RuntimeContext) -> Result<(), PlanError> {
        let repo = ctx.store.plans();
        for entry in self.entries.values() {
            repo.upsert_kind(&entry.spec).await?;
        }
        Ok(())
    }

    /// Registry preloaded with the kernel's built-in plan kinds and their
    /// executors.
    #[must_use]
    pub fn with_builtin_kinds() -> Self {
        let mut registry = Self::new();

        registry
            .register_kind(PlanKindVersion {
                plan_kind: kinds::CREATE_REMINDER.to_string(),
                plan_version: 1,
                schema: json!({
                    "type": "object",
                    "required": ["summary", "schedule", "target"],
                    "properties": {
                        "summary": { "type": "string", "minLength": 1 },
                        "schedule": {
                            "type": "object",
                            "properties": {
                                "in_seconds": { "type": "integer", "minimum": 1 },
                                "trigger_at": { "type": "string" },
                                "rrule": { "type": "string" },
                                "timezone": { "type": "string" }
                            }
                        },
                        "target": {
                            "type": "object",
                            "required": ["channel_type", "channel_target"],
                            "properties": {
                                "channel_type": { "type": "string" },
                                "channel_target": { "type": "string" }
                            }
                        },
                        "idempotency_key": { "type": "string" }
                    }
                }),
                example: Some(json!({
                    "summary": "water the plants",
                    "schedule": { "in_seconds": 60 },
                    "target": { "channel_type": "cli", "channel_target": "local" }
                })),
                executor_key: "create_reminder".to_string(),
                is_deprecated: false,
            })
            .expect("builtin create_reminder schema compiles");

        registry
            .register_kind(PlanKindVersion {
                plan_kind: kinds::SEND_MESSAGE.to_string(),
                plan_version: 1,
                schema: json!({
                    "type": "object",
                    "required": ["message", "target"],
                    "properties": {
                        "message": { "type": "string", "minLength": 1 },
                        "target": {
                            "type": "object",
                            "required": ["channel_type", "channel_target"],
                            "properties": {
                                "channel_type": { "type": "string" },
                                "channel_target": { "type": "string" }
                            }
                        }
                    }
                }),
                example: Some(json!({
                    "message": "dinner is ready",
                    "target": { "channel_type": "cli", "channel_target": "local" }
                })),
                executor_key: "send_message".to_string(),
                is_deprecated: false,
            })
            .expect("builtin send_message schema compiles");

        registry
            .register_kind(PlanKindVersion {
                plan_kind: kinds::RUN_TASK.to_string(),
                plan_version: 1,
                schema: json!({
                    "type": "object",
                    "required": ["owner_id", "conversation_key", "goal"],
                    "properties": {
                        "owner_id": { "type": "string", "minLength": 1 },
                        "conversation_key": { "type": "string", "minLength": 1 },
                        "goal": { "type": "string", "minLength": 1 },
                        "priority": { "type": "integer" },
                        "slice_cycles": { "type": "integer", "minimum": 1 }
                    }
                }),
                example: Some(json!({
                    "owner_id": "user-1",
                    "conversation_key": "cli:local",
                    "goal": "plan the grocery run"
                })),
                executor_key: "run_task".to_string(),
                is_deprecated: false,
            })
            .expect("builtin run_task schema compiles");

        registry.register_executor(Arc::new(CreateReminderExecutor));
        registry.register_executor(Arc::new(SendMessageExecutor));
        registry.register_executor(Arc::new(RunTaskExecutor));
        registry
    }
}
