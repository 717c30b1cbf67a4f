mod common;

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use nervecore::plans::{kinds, PlanRegistry, PlanWorker};
use nervecore::store::plans::{PlanInstance, PlanKindVersion, PlanStatus};
use nervecore::store::slices::SliceStatus;

use common::{test_kernel, TestKernel};

fn worker(kernel: &TestKernel, registry: Arc<PlanRegistry>) -> PlanWorker {
    PlanWorker::new(
        kernel.ctx.clone(),
        registry,
        Arc::clone(&kernel.bus),
        Arc::clone(&kernel.hub),
        Arc::clone(&kernel.trace),
    )
}

fn reminder_plan(plan_id: &str, payload: serde_json::Value) -> PlanInstance {
    PlanInstance {
        plan_id: plan_id.to_string(),
        plan_kind: kinds::CREATE_REMINDER.to_string(),
        plan_version: 1,
        correlation_id: Some("C1".to_string()),
        status: PlanStatus::Queued,
        payload,
        actor: Some("user-1".to_string()),
        source_channel: Some("cli".to_string()),
        intent_confidence: Some(1.0),
        error: None,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn invalid_payload_fails_plan_without_side_effects() {
    let kernel = test_kernel().await;
    let registry = Arc::new(PlanRegistry::with_builtin_kinds());
    let worker = worker(&kernel, Arc::clone(&registry));

    // Missing the required `schedule` (and `summary`).
    let plan = reminder_plan("p-invalid", json!({ "target": {} }));
    kernel.store.plans().insert_instance(&plan).await.unwrap();

    worker.drain_queued().await;

    let stored = kernel
        .store
        .plans()
        .get_instance("p-invalid")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, PlanStatus::Failed);
    let error = stored.error.expect("structured error recorded");
    assert!(error.contains("validation"), "error was: {error}");

    // No timed row was created.
    assert!(kernel.store.timed().list_pending(10).await.unwrap().is_empty());

    // Payload is unchanged on the stored instance.
    assert_eq!(stored.payload, json!({ "target": {} }));

    // One failed run row exists.
    let runs = kernel.store.plans().runs_for_plan("p-invalid").await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, "failed");
}

#[tokio::test]
async fn valid_reminder_plan_creates_timed_row_and_completes() {
    let kernel = test_kernel().await;
    let registry = Arc::new(PlanRegistry::with_builtin_kinds());
    let worker = worker(&kernel, Arc::clone(&registry));

    let plan = reminder_plan(
        "p-valid",
        json!({
            "summary": "water the plants",
            "schedule": { "in_seconds": 60 },
            "target": { "channel_type": "cli", "channel_target": "local" },
            "idempotency_key": "p-valid",
        }),
    );
    kernel.store.plans().insert_instance(&plan).await.unwrap();

    worker.drain_queued().await;

    let stored = kernel
        .store
        .plans()
        .get_instance("p-valid")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, PlanStatus::Done);

    let pending = kernel.store.timed().list_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "p-valid");

    // At-least-once: re-queue the same plan, the timed row does not fork.
    kernel
        .store
        .plans()
        .set_status("p-valid", PlanStatus::Queued, None)
        .await
        .unwrap();
    worker.drain_queued().await;
    assert_eq!(kernel.store.timed().list_pending(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn deprecated_version_is_refused_for_new_instances() {
    let kernel = test_kernel().await;
    let mut registry = PlanRegistry::with_builtin_kinds();
    registry
        .register_kind(PlanKindVersion {
            plan_kind: kinds::SEND_MESSAGE.to_string(),
            plan_version: 1,
            schema: json!({ "type": "object" }),
            example: None,
            executor_key: "send_message".to_string(),
            is_deprecated: true,
        })
        .unwrap();
    let registry = Arc::new(registry);
    let worker = worker(&kernel, Arc::clone(&registry));

    let mut plan = reminder_plan("p-deprecated", json!({ "message": "hi" }));
    plan.plan_kind = kinds::SEND_MESSAGE.to_string();
    kernel.store.plans().insert_instance(&plan).await.unwrap();

    worker.drain_queued().await;

    let stored = kernel
        .store
        .plans()
        .get_instance("p-deprecated")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, PlanStatus::Failed);
    assert!(stored.error.unwrap().contains("deprecated"));
}

#[tokio::test]
async fn send_message_plan_delivers_outbound() {
    let kernel = test_kernel().await;
    let registry = Arc::new(PlanRegistry::with_builtin_kinds());
    let worker = worker(&kernel, Arc::clone(&registry));

    let mut plan = reminder_plan(
        "p-message",
        json!({
            "message": "dinner is ready",
            "target": { "channel_type": "cli", "channel_target": "local" },
        }),
    );
    plan.plan_kind = kinds::SEND_MESSAGE.to_string();
    kernel.store.plans().insert_instance(&plan).await.unwrap();

    worker.drain_queued().await;

    let outbox = kernel.cli_outbox.snapshot();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].message, "dinner is ready");
    assert_eq!(outbox[0].correlation_id, "C1");
}

#[tokio::test]
async fn run_task_plan_enqueues_slice_task() {
    let kernel = test_kernel().await;
    let registry = Arc::new(PlanRegistry::with_builtin_kinds());
    let worker = worker(&kernel, Arc::clone(&registry));

    let mut plan = reminder_plan(
        "p-task",
        json!({
            "owner_id": "user-1",
            "conversation_key": "cli:local",
            "goal": "sort the pantry",
        }),
    );
    plan.plan_kind = kinds::RUN_TASK.to_string();
    kernel.store.plans().insert_instance(&plan).await.unwrap();

    worker.drain_queued().await;

    let task = kernel
        .store
        .slices()
        .get_task("p-task")
        .await
        .unwrap()
        .expect("slice task enqueued");
    assert_eq!(task.status, SliceStatus::Queued);
    assert_eq!(task.owner_id, "user-1");
}

#[tokio::test]
async fn plan_instance_insert_is_idempotent() {
    let kernel = test_kernel().await;
    let plan = reminder_plan("p-dup", json!({ "summary": "x" }));
    assert!(kernel.store.plans().insert_instance(&plan).await.unwrap());
    assert!(!kernel.store.plans().insert_instance(&plan).await.unwrap());
}
