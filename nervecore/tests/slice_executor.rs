mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};

use nervecore::runtime::RuntimeContext;
use nervecore::signal::{types, Signal};
use nervecore::slices::{
    events, CycleOutcome, CycleReport, SliceDriver, SliceError, SliceExecutor,
    SliceExecutorConfig, StepListDriver,
};
use nervecore::store::slices::{SliceStatus, SliceTask};

use common::{test_kernel, TestKernel};

fn executor_with(
    kernel: &TestKernel,
    driver: Arc<dyn SliceDriver>,
    worker_id: &str,
) -> SliceExecutor {
    SliceExecutor::new(
        kernel.ctx.clone(),
        Arc::clone(&kernel.bus),
        Arc::clone(&kernel.hub),
        Arc::clone(&kernel.trace),
        driver,
        SliceExecutorConfig {
            yield_delay: StdDuration::from_secs(0),
            ..SliceExecutorConfig::default()
        },
        worker_id.to_string(),
    )
}

fn task_with_steps(owner: &str, conversation: &str, steps: &[&str], cycles: i64) -> SliceTask {
    let mut task = SliceTask::queued(owner, conversation, cycles);
    task.metadata = json!({ "steps": steps, "correlation_id": format!("corr-{owner}") });
    task
}

#[tokio::test]
async fn slice_yields_checkpoints_and_resumes_to_completion() {
    let kernel = test_kernel().await;
    let executor = executor_with(&kernel, Arc::new(StepListDriver), "w1");
    let repo = kernel.store.slices();

    let task = task_with_steps("user-1", "cli:local", &["a", "b", "c", "d", "e"], 3);
    let task_id = task.task_id.clone();
    repo.upsert_task(&task).await.unwrap();

    let mut last_owner = None;
    let mut last_warn = None;

    // Slice 1: three cycles, then yield with checkpoint version 1.
    assert_eq!(
        executor
            .run_once(Utc::now(), &mut last_owner, &mut last_warn)
            .await
            .unwrap(),
        1
    );
    let checkpoint = repo.load_checkpoint(&task_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.version, 1);
    assert_eq!(checkpoint.state.get("cursor").and_then(Value::as_i64), Some(3));
    let stored = repo.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SliceStatus::Queued);

    // Slice 2: resumes from the checkpoint and finishes.
    assert_eq!(
        executor
            .run_once(Utc::now() + Duration::seconds(1), &mut last_owner, &mut last_warn)
            .await
            .unwrap(),
        1
    );
    let stored = repo.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SliceStatus::Done);

    // The final message reached the conversation.
    let outbox = kernel.cli_outbox.snapshot();
    assert_eq!(outbox.len(), 1);
    assert!(outbox[0].message.contains("Finished"));

    // Audit trail: started, persisted, started, completed.
    let trail: Vec<String> = repo
        .list_events(&task_id, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|event| event.event_type)
        .collect();
    assert_eq!(
        trail,
        vec![
            events::SLICE_STARTED.to_string(),
            events::SLICE_PERSISTED.to_string(),
            events::SLICE_STARTED.to_string(),
            events::SLICE_COMPLETED.to_string(),
        ]
    );
}

#[tokio::test]
async fn interleaved_owners_share_the_executor_fairly() {
    let kernel = test_kernel().await;
    let executor = executor_with(&kernel, Arc::new(StepListDriver), "w1");
    let repo = kernel.store.slices();

    let first = task_with_steps("alice", "cli:alice", &["a1", "a2", "a3", "a4"], 2);
    let second = task_with_steps("bob", "cli:bob", &["b1", "b2"], 2);
    let first_id = first.task_id.clone();
    let second_id = second.task_id.clone();
    repo.upsert_task(&first).await.unwrap();
    repo.upsert_task(&second).await.unwrap();

    let mut last_owner = None;
    let mut last_warn = None;

    // First pass runs one of the owners; second pass must pick the other.
    executor
        .run_once(Utc::now(), &mut last_owner, &mut last_warn)
        .await
        .unwrap();
    let first_owner = last_owner.clone().unwrap();
    executor
        .run_once(Utc::now() + Duration::seconds(1), &mut last_owner, &mut last_warn)
        .await
        .unwrap();
    let second_owner = last_owner.clone().unwrap();
    assert_ne!(first_owner, second_owner);

    // Both tasks advanced.
    assert!(repo.load_checkpoint(&first_id).await.unwrap().is_some());
    assert!(repo.load_checkpoint(&second_id).await.unwrap().is_some());
}

#[tokio::test]
async fn checkpoint_version_is_compare_and_swap() {
    let kernel = test_kernel().await;
    let repo = kernel.store.slices();
    let task = task_with_steps("user-1", "cli:local", &["a"], 3);
    repo.upsert_task(&task).await.unwrap();

    // First writer with expected version 0 wins.
    let v1 = repo
        .save_checkpoint(&task.task_id, &json!({"n": 1}), &json!({}), Some(0))
        .await
        .unwrap();
    assert_eq!(v1, Some(1));

    // A second writer with the same expectation loses.
    let conflict = repo
        .save_checkpoint(&task.task_id, &json!({"n": 2}), &json!({}), Some(0))
        .await
        .unwrap();
    assert_eq!(conflict, None);

    // The winner's successor succeeds and the version stays monotonic.
    let v2 = repo
        .save_checkpoint(&task.task_id, &json!({"n": 3}), &json!({}), Some(1))
        .await
        .unwrap();
    assert_eq!(v2, Some(2));
    let stored = repo.load_checkpoint(&task.task_id).await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.state, json!({"n": 3}));
}

#[tokio::test]
async fn lease_is_exclusive_until_stolen() {
    let kernel = test_kernel().await;
    let repo = kernel.store.slices();
    let task = task_with_steps("user-1", "cli:local", &["a"], 3);
    repo.upsert_task(&task).await.unwrap();

    let now = Utc::now();
    let lease = Duration::seconds(30);
    assert!(repo.acquire_lease(&task.task_id, "w1", lease, now).await.unwrap());
    assert!(!repo.acquire_lease(&task.task_id, "w2", lease, now).await.unwrap());

    // Past the lease wall clock, another worker may steal it.
    let later = now + Duration::seconds(31);
    assert!(repo.acquire_lease(&task.task_id, "w2", lease, later).await.unwrap());
}

struct AskingDriver;

#[async_trait]
impl SliceDriver for AskingDriver {
    async fn cycle(
        &self,
        _task: &SliceTask,
        _state: &mut Value,
        _cycle_index: i64,
        _ctx: &RuntimeContext,
    ) -> Result<CycleReport, SliceError> {
        Ok(CycleReport::progressed(
            CycleOutcome::WaitingUser("Which pantry shelf?".to_string()),
            5,
        ))
    }
}

#[tokio::test]
async fn waiting_user_parks_the_task_and_asks() {
    let kernel = test_kernel().await;
    let executor = executor_with(&kernel, Arc::new(AskingDriver), "w1");
    let repo = kernel.store.slices();

    let task = task_with_steps("user-1", "cli:local", &["a"], 3);
    let task_id = task.task_id.clone();
    repo.upsert_task(&task).await.unwrap();

    let mut last_owner = None;
    let mut last_warn = None;
    executor
        .run_once(Utc::now(), &mut last_owner, &mut last_warn)
        .await
        .unwrap();

    let stored = repo.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SliceStatus::WaitingUser);

    let outbox = kernel.cli_outbox.snapshot();
    assert_eq!(outbox.len(), 1);
    assert!(outbox[0].message.contains("pantry shelf"));
}

struct FailingDriver;

#[async_trait]
impl SliceDriver for FailingDriver {
    async fn cycle(
        &self,
        _task: &SliceTask,
        _state: &mut Value,
        _cycle_index: i64,
        _ctx: &RuntimeContext,
    ) -> Result<CycleReport, SliceError> {
        Ok(CycleReport {
            outcome: CycleOutcome::Failed("tool unavailable".to_string()),
            tokens_spent: 0,
            progressed: false,
        })
    }
}

#[tokio::test]
async fn failure_streak_pauses_then_fails_the_task() {
    let kernel = test_kernel().await;
    let executor = executor_with(&kernel, Arc::new(FailingDriver), "w1");
    let repo = kernel.store.slices();

    let task = task_with_steps("user-1", "cli:local", &["a"], 3);
    let task_id = task.task_id.clone();
    repo.upsert_task(&task).await.unwrap();

    let mut last_owner = None;
    let mut last_warn = None;
    let mut now = Utc::now();
    for _ in 0..2 {
        // Paused tasks are not runnable; requeue between attempts the way a
        // resume request would.
        let mut stored = repo.get_task(&task_id).await.unwrap().unwrap();
        stored.status = SliceStatus::Queued;
        stored.next_run_at = Some(now);
        repo.upsert_task(&stored).await.unwrap();
        executor.run_once(now, &mut last_owner, &mut last_warn).await.unwrap();
        now += Duration::seconds(60);
    }
    let stored = repo.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SliceStatus::Paused);
    assert_eq!(stored.failure_streak, 2);

    let mut requeued = stored;
    requeued.status = SliceStatus::Queued;
    requeued.next_run_at = Some(now);
    repo.upsert_task(&requeued).await.unwrap();
    executor.run_once(now, &mut last_owner, &mut last_warn).await.unwrap();

    let stored = repo.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SliceStatus::Failed);
    assert_eq!(stored.failure_streak, 3);
    assert_eq!(stored.last_error.as_deref(), Some("tool unavailable"));
}

#[tokio::test]
async fn stale_resume_requests_are_ignored() {
    let kernel = test_kernel().await;
    let executor = executor_with(&kernel, Arc::new(StepListDriver), "w1");
    let repo = kernel.store.slices();

    let mut task = task_with_steps("user-1", "cli:local", &["a"], 3);
    task.status = SliceStatus::WaitingUser;
    let task_id = task.task_id.clone();
    repo.upsert_task(&task).await.unwrap();
    repo.save_checkpoint(&task_id, &json!({}), &json!({}), Some(0))
        .await
        .unwrap();
    repo.save_checkpoint(&task_id, &json!({}), &json!({}), Some(1))
        .await
        .unwrap();

    // A resume that saw version 1 is stale against the stored version 2.
    executor
        .handle_resume(&Signal::new(
            types::PDCA_RESUME_REQUESTED,
            "api",
            json!({ "task_id": task_id, "checkpoint_version": 1 }),
        ))
        .await;
    let stored = repo.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SliceStatus::WaitingUser);

    // A current resume requeues the task.
    executor
        .handle_resume(&Signal::new(
            types::PDCA_RESUME_REQUESTED,
            "api",
            json!({ "task_id": task_id, "checkpoint_version": 2 }),
        ))
        .await;
    let stored = repo.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SliceStatus::Queued);
}
