//! End-to-end scenarios driving the orchestrator, recovery, and
//! coordinator together against an in-memory log.

use async_trait::async_trait;
use futures::future::BoxFuture;
use saga_engine::error::{Result, SagaEngineError};
use saga_engine::log::memory::InMemorySagaLog;
use saga_engine::log::SagaLog;
use saga_engine::message::MessageType;
use saga_engine::orchestrator::{
    CompensationContext, Orchestrator, SagaDefinitionBuilder, SagaEvent, SagaEventSubscriber, TaskContext,
};
use saga_engine::recovery::{recover_saga_state, RecoveryStrategy};
use saga_engine::saga::{Saga, DEFAULT_MAILBOX_TIMEOUT};
use saga_engine::{SagaMessage, SagaState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

fn shared_log() -> Arc<dyn SagaLog> {
    Arc::new(InMemorySagaLog::new())
}

fn ok_step(name: &'static str) -> impl Fn(TaskContext<()>) -> BoxFuture<'static, Result<serde_json::Value>> {
    move |ctx| Box::pin(async move { Ok(serde_json::json!({ "step": name, "previous": ctx.previous })) })
}

// S1: happy path, three steps, all succeed.
#[tokio::test]
async fn s1_happy_path_three_steps() -> anyhow::Result<()> {
    let log = shared_log();
    let saga = Saga::create(Arc::clone(&log), "order-1", serde_json::json!({"amount": 10}), None, DEFAULT_MAILBOX_TIMEOUT)
        .await?;

    let def = SagaDefinitionBuilder::new()
        .step("reserve", ok_step("reserve"))
        .step("charge", ok_step("charge"))
        .step("ship", ok_step("ship"))
        .build();

    let orchestrator = Orchestrator::new();
    orchestrator.run(&saga, &def, &()).await?;

    let state = saga.state().await?;
    assert!(state.completed);
    assert!(state.is_task_completed("reserve"));
    assert!(state.is_task_completed("charge"));
    assert!(state.is_task_completed("ship"));
    Ok(())
}

// S2: the middle step fails, triggering compensation of everything
// already completed, in reverse order.
#[tokio::test]
async fn s2_middle_step_fails_triggers_compensation() -> anyhow::Result<()> {
    let log = shared_log();
    let saga = Saga::create(Arc::clone(&log), "order-2", serde_json::Value::Null, None, DEFAULT_MAILBOX_TIMEOUT).await?;

    let compensated = Arc::new(Mutex::new(Vec::<&'static str>::new()));

    let def = SagaDefinitionBuilder::new()
        .step("reserve", ok_step("reserve"))
        .with_compensation({
            let compensated = Arc::clone(&compensated);
            move |_ctx: CompensationContext<()>| {
                let compensated = Arc::clone(&compensated);
                Box::pin(async move {
                    compensated.lock().await.push("reserve");
                    Ok(serde_json::Value::Null)
                })
            }
        })
        .step("charge", |_ctx: TaskContext<()>| {
            Box::pin(async move { Err(SagaEngineError::UserCallbackError("insufficient funds".into())) })
        })
        .step("ship", ok_step("ship"))
        .build();

    let orchestrator = Orchestrator::new();
    // The callback failure drives the saga into compensation but is not
    // itself surfaced as an `Err` from `run` (§7 propagation policy).
    orchestrator.run(&saga, &def, &()).await?;

    let state = saga.state().await?;
    assert!(state.aborted);
    assert!(!state.is_task_started("ship"));
    assert_eq!(compensated.lock().await.as_slice(), ["reserve"]);
    Ok(())
}

// S3: process "crashes" after the first step's EndTask is durably
// logged but before the orchestrator got to run the second step;
// ForwardRecovery resumes from exactly that point.
#[tokio::test]
async fn s3_crash_and_resume_with_forward_recovery() -> anyhow::Result<()> {
    let log = shared_log();
    log.start_saga("order-3", serde_json::json!({"amount": 5}), None, None).await?;
    log.log_message(SagaMessage::new("order-3", MessageType::StartTask, serde_json::Value::Null).with_task_id("reserve"))
        .await?;
    log.log_message(
        SagaMessage::new("order-3", MessageType::EndTask, serde_json::json!({"reserved": true})).with_task_id("reserve"),
    )
    .await?;
    // Process "crashes" here — no EndSaga, no further steps recorded.

    let saga = recover_saga_state(Arc::clone(&log), "order-3", RecoveryStrategy::Forward, DEFAULT_MAILBOX_TIMEOUT).await?;

    let charge_calls = Arc::new(AtomicUsize::new(0));
    let def = SagaDefinitionBuilder::new()
        .step("reserve", ok_step("reserve"))
        .step("charge", {
            let charge_calls = Arc::clone(&charge_calls);
            move |_ctx: TaskContext<()>| {
                let charge_calls = Arc::clone(&charge_calls);
                Box::pin(async move {
                    charge_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!({"charged": true}))
                })
            }
        })
        .build();

    let orchestrator = Orchestrator::new();
    orchestrator.run(&saga, &def, &()).await?;

    assert_eq!(charge_calls.load(Ordering::SeqCst), 1, "reserve must not re-run, only charge");
    let state = saga.state().await?;
    assert!(state.completed);
    Ok(())
}

// S4: process crashes mid-task (StartTask logged, no matching EndTask);
// RollbackRecovery appends AbortSaga so the orchestrator runs
// compensation for whatever already completed instead of re-invoking
// the in-flight step.
#[tokio::test]
async fn s4_crash_in_task_with_rollback_recovery() -> anyhow::Result<()> {
    let log = shared_log();
    log.start_saga("order-4", serde_json::Value::Null, None, None).await?;
    log.log_message(SagaMessage::new("order-4", MessageType::StartTask, serde_json::Value::Null).with_task_id("reserve"))
        .await?;
    log.log_message(
        SagaMessage::new("order-4", MessageType::EndTask, serde_json::json!({"reserved": true})).with_task_id("reserve"),
    )
    .await?;
    log.log_message(SagaMessage::new("order-4", MessageType::StartTask, serde_json::Value::Null).with_task_id("charge"))
        .await?;
    // Crash: no EndTask for "charge".

    let saga = recover_saga_state(Arc::clone(&log), "order-4", RecoveryStrategy::Rollback, DEFAULT_MAILBOX_TIMEOUT).await?;

    let reserve_compensated = Arc::new(Mutex::new(false));
    let def = SagaDefinitionBuilder::new()
        .step("reserve", ok_step("reserve"))
        .with_compensation({
            let reserve_compensated = Arc::clone(&reserve_compensated);
            move |_ctx: CompensationContext<()>| {
                let reserve_compensated = Arc::clone(&reserve_compensated);
                Box::pin(async move {
                    *reserve_compensated.lock().await = true;
                    Ok(serde_json::Value::Null)
                })
            }
        })
        .step("charge", ok_step("charge"))
        .build();

    let state_before = saga.state().await?;
    assert!(state_before.aborted, "recovery should have aborted the unsafe saga");

    let orchestrator = Orchestrator::new();
    // The saga was already aborted by recovery before this run started;
    // `run` drives straight to compensation and still returns `Ok`.
    orchestrator.run(&saga, &def, &()).await?;

    assert!(*reserve_compensated.lock().await);
    let state_after = saga.state().await?;
    assert!(!state_after.is_task_completed("charge"), "charge was in-flight at crash and must stay incomplete");
    Ok(())
}

// S3b: process crashes mid-task (StartTask logged, no matching EndTask);
// ForwardRecovery resumes and must retry that step's invocation without
// re-appending a second StartTask, which the validator would reject.
#[tokio::test]
async fn s3b_crash_mid_task_with_forward_recovery_retries_in_flight_step() -> anyhow::Result<()> {
    let log = shared_log();
    log.start_saga("order-3b", serde_json::Value::Null, None, None).await?;
    log.log_message(SagaMessage::new("order-3b", MessageType::StartTask, serde_json::Value::Null).with_task_id("reserve"))
        .await?;
    // Crash: no EndTask for "reserve".

    let saga =
        recover_saga_state(Arc::clone(&log), "order-3b", RecoveryStrategy::Forward, DEFAULT_MAILBOX_TIMEOUT).await?;

    let reserve_calls = Arc::new(AtomicUsize::new(0));
    let def = SagaDefinitionBuilder::new()
        .step("reserve", {
            let reserve_calls = Arc::clone(&reserve_calls);
            move |_ctx: TaskContext<()>| {
                let reserve_calls = Arc::clone(&reserve_calls);
                Box::pin(async move {
                    reserve_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!({"reserved": true}))
                })
            }
        })
        .build();

    let orchestrator = Orchestrator::new();
    orchestrator.run(&saga, &def, &()).await?;

    assert_eq!(reserve_calls.load(Ordering::SeqCst), 1, "the in-flight step must be retried exactly once");
    let state = saga.state().await?;
    assert!(state.completed);
    Ok(())
}

// S5: hierarchical abort — aborting the root cascades depth-first to
// every descendant saga.
#[tokio::test]
async fn s5_hierarchical_abort_cascades_to_descendants() -> anyhow::Result<()> {
    use saga_engine::coordinator::Coordinator;

    let log = shared_log();
    let coordinator = Coordinator::new(Arc::clone(&log));

    log.start_saga("parent", serde_json::Value::Null, None, None).await?;
    log.start_saga("child", serde_json::Value::Null, Some("parent".into()), Some("spawn-child".into()))
        .await?;
    log.start_saga("grandchild", serde_json::Value::Null, Some("child".into()), Some("spawn-grandchild".into()))
        .await?;

    coordinator
        .abort_saga_with_children("parent", serde_json::json!({"reason": "customer cancelled"}), false)
        .await?;

    for saga_id in ["parent", "child", "grandchild"] {
        let messages = log.get_messages(saga_id).await?;
        let state: SagaState = saga_engine::state::project(&messages)?;
        assert!(state.aborted, "{saga_id} should be aborted by the cascade");
    }
    Ok(())
}

// S6: an optional step fails; the saga still completes and the failure
// is stashed in the saga context instead of aborting.
#[tokio::test]
async fn s6_optional_task_failure_does_not_abort_saga() -> anyhow::Result<()> {
    let log = shared_log();
    let saga = Saga::create(Arc::clone(&log), "order-6", serde_json::Value::Null, None, DEFAULT_MAILBOX_TIMEOUT).await?;

    let def = SagaDefinitionBuilder::new()
        .step("reserve", ok_step("reserve"))
        .step("send-receipt-email", |_ctx: TaskContext<()>| {
            Box::pin(async move { Err(SagaEngineError::UserCallbackError("smtp timeout".into())) })
        })
        .optional()
        .step("ship", ok_step("ship"))
        .build();

    let orchestrator = Orchestrator::new();
    orchestrator.run(&saga, &def, &()).await?;

    let state = saga.state().await?;
    assert!(state.completed);
    assert!(state.is_task_completed("ship"));
    let stashed = state
        .context
        .get("__optionalTaskErrors__")
        .and_then(|v| v.get("send-receipt-email"))
        .and_then(|v| v.as_str())
        .unwrap();
    assert!(stashed.contains("smtp timeout"));
    Ok(())
}

// Event taxonomy: every registered subscriber observes every event, in
// registration order, and sees the full SagaStarted..SagaSucceeded
// bracket on a clean run.
#[tokio::test]
async fn event_taxonomy_is_delivered_in_order() -> anyhow::Result<()> {
    #[derive(Default)]
    struct Recorder {
        labels: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl SagaEventSubscriber for Recorder {
        async fn on_event(&self, event: &SagaEvent) {
            let label = match event {
                SagaEvent::SagaStarted { .. } => "SagaStarted",
                SagaEvent::SagaSucceeded { .. } => "SagaSucceeded",
                SagaEvent::SagaFailed { .. } => "SagaFailed",
                SagaEvent::TaskStarted { .. } => "TaskStarted",
                SagaEvent::TaskSucceeded { .. } => "TaskSucceeded",
                SagaEvent::TaskFailed { .. } => "TaskFailed",
                SagaEvent::OptionalTaskFailed { .. } => "OptionalTaskFailed",
                SagaEvent::MiddlewareSucceeded { .. } => "MiddlewareSucceeded",
                SagaEvent::MiddlewareFailed { .. } => "MiddlewareFailed",
                SagaEvent::CompensationStarted { .. } => "CompensationStarted",
                SagaEvent::CompensationSucceeded { .. } => "CompensationSucceeded",
                SagaEvent::CompensationFailed { .. } => "CompensationFailed",
            };
            self.labels.lock().await.push(label);
        }
    }

    let log = shared_log();
    let saga = Saga::create(Arc::clone(&log), "order-7", serde_json::Value::Null, None, DEFAULT_MAILBOX_TIMEOUT).await?;

    let def = SagaDefinitionBuilder::new().step("reserve", ok_step("reserve")).build();

    let orchestrator = Orchestrator::new();
    let recorder = Arc::new(Recorder::default());
    orchestrator.subscribe(recorder.clone());

    orchestrator.run(&saga, &def, &()).await?;

    let labels = recorder.labels.lock().await;
    assert_eq!(
        labels.as_slice(),
        ["SagaStarted", "TaskStarted", "TaskSucceeded", "SagaSucceeded"]
    );
    Ok(())
}
