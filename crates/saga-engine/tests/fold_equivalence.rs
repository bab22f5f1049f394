//! Property-based check of the fold-equivalence invariant (§8 #4 of the
//! saga engine spec): `project(messages[..n])` must equal the state
//! reached by applying `messages[n]` to `project(messages[..n-1])`, for
//! every prefix of every message sequence the validator accepts.
//!
//! Rather than generate arbitrary `SagaMessage`s (most would be rejected
//! by the validator before reaching the property under test), this
//! generates random *valid* saga lifecycles — sequences of task
//! start/end/compensate operations a well-behaved orchestrator could
//! produce — and checks both that every message it appends survives
//! validation and that folding from scratch tracks incremental
//! application step by step.

use proptest::prelude::*;
use saga_engine::message::{MessageType, SagaMessage};
use saga_engine::state::{self, SagaState};
use serde_json::Value;

/// One step of a randomly generated saga lifecycle.
#[derive(Debug, Clone)]
enum Op {
    StartTask(usize),
    EndTask(usize),
    Abort,
    StartCompensating(usize),
    EndCompensating(usize),
    UpdateContext(u32),
    End,
}

fn op_strategy(task_count: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..task_count).prop_map(Op::StartTask),
        (0..task_count).prop_map(Op::EndTask),
        Just(Op::Abort),
        (0..task_count).prop_map(Op::StartCompensating),
        (0..task_count).prop_map(Op::EndCompensating),
        any::<u32>().prop_map(Op::UpdateContext),
        Just(Op::End),
    ]
}

fn task_name(i: usize) -> String {
    format!("task-{i}")
}

/// Builds a message for `op` against `sim`, applying it only if the
/// validator would accept it — the random operation stream is a proposal
/// list, not a guaranteed-valid script, exactly like an adversarial
/// caller hammering on a saga handle.
fn try_build(sim: &SagaState, op: &Op) -> Option<SagaMessage> {
    let saga_id = sim.saga_id.clone();
    let msg = match op {
        Op::StartTask(i) => SagaMessage::new(&saga_id, MessageType::StartTask, Value::Null).with_task_id(task_name(*i)),
        Op::EndTask(i) => SagaMessage::new(&saga_id, MessageType::EndTask, Value::Bool(true)).with_task_id(task_name(*i)),
        Op::Abort => SagaMessage::new(&saga_id, MessageType::AbortSaga, Value::Null),
        Op::StartCompensating(i) => {
            SagaMessage::new(&saga_id, MessageType::StartCompensatingTask, Value::Null).with_task_id(task_name(*i))
        }
        Op::EndCompensating(i) => {
            SagaMessage::new(&saga_id, MessageType::EndCompensatingTask, Value::Null).with_task_id(task_name(*i))
        }
        Op::UpdateContext(n) => SagaMessage::new(&saga_id, MessageType::UpdateSagaContext, serde_json::json!({ "n": n })),
        Op::End => SagaMessage::new(&saga_id, MessageType::EndSaga, Value::Null),
    };

    if state::validate(sim, &msg).is_ok() {
        Some(msg)
    } else {
        None
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Folding a whole accepted-message log from scratch always matches
    /// applying the same messages one at a time, for every prefix.
    #[test]
    fn project_matches_incremental_application_for_any_valid_lifecycle(ops in prop::collection::vec(op_strategy(4), 0..40)) {
        let start = SagaMessage::new("prop-saga", MessageType::StartSaga, serde_json::json!({ "seed": true }));
        let mut sim = SagaState::from_start_saga(&start).unwrap();
        let mut accepted = vec![start.clone()];

        for op in &ops {
            if let Some(msg) = try_build(&sim, op) {
                state::apply(&mut sim, &msg).expect("validated message must also apply");
                accepted.push(msg);
            }
        }

        // Every prefix, folded from scratch, must equal incremental
        // application up to that point.
        let mut incremental = SagaState::from_start_saga(&accepted[0]).unwrap();
        for (n, msg) in accepted.iter().enumerate().skip(1) {
            let folded = state::project(&accepted[..=n]).unwrap();
            state::apply(&mut incremental, msg).unwrap();

            prop_assert_eq!(folded.completed, incremental.completed);
            prop_assert_eq!(folded.aborted, incremental.aborted);
            prop_assert_eq!(folded.context.clone(), incremental.context.clone());
            prop_assert_eq!(folded.task_status.len(), incremental.task_status.len());
            for task_id in incremental.task_status.keys() {
                prop_assert_eq!(
                    folded.task_status.get(task_id).cloned(),
                    incremental.task_status.get(task_id).cloned()
                );
            }
        }

        prop_assert_eq!(sim.completed, incremental.completed);
        prop_assert_eq!(sim.aborted, incremental.aborted);
    }

    /// The safe-state predicate never flips true while the generator
    /// still has an in-flight (started, not ended) task on the books,
    /// regardless of how many unrelated valid ops are interleaved.
    #[test]
    fn safe_state_never_true_with_an_in_flight_task(ops in prop::collection::vec(op_strategy(3), 0..30)) {
        let start = SagaMessage::new("prop-saga-2", MessageType::StartSaga, Value::Null);
        let mut sim = SagaState::from_start_saga(&start).unwrap();

        for op in &ops {
            if let Some(msg) = try_build(&sim, op) {
                state::apply(&mut sim, &msg).unwrap();
            }
        }

        // An aborted saga is safe by definition regardless of in-flight
        // tasks (compensation, not resumption, is what runs next); the
        // in-flight-implies-unsafe claim only holds while still running.
        let has_in_flight = sim.task_status.values().any(|t| t.started && !t.ended);
        if has_in_flight && !sim.aborted {
            prop_assert!(!sim.is_safe_state());
        }
    }
}
