//! In-memory saga state projection and the pure transition validator.

use crate::error::SagaEngineError;
use crate::message::{MessageType, SagaMessage};
use serde_json::Value;
use std::collections::HashMap;

/// Per-task progress, folded from `StartTask`/`EndTask`/compensation
/// messages. Mirrors the shape in the saga log, not a separate source of
/// truth.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskStatus {
    /// `StartTask` has been appended for this task.
    pub started: bool,
    /// `EndTask` has been appended for this task.
    pub ended: bool,
    /// Payload carried by `StartTask` (the previous step's result).
    pub start_data: Option<Value>,
    /// Payload carried by `EndTask` (null for a failed optional task).
    pub end_data: Option<Value>,
    /// `StartCompensatingTask` has been appended for this task.
    pub compensating_started: bool,
    /// `EndCompensatingTask` has been appended for this task.
    pub compensating_ended: bool,
    /// Payload carried by `EndCompensatingTask`.
    pub compensating_end_data: Option<Value>,
    /// Whether this task was declared optional via `StartTask` metadata.
    pub is_optional: bool,
}

/// The in-memory projection of a saga's message log.
#[derive(Debug, Clone)]
pub struct SagaState {
    /// Saga this state was folded for.
    pub saga_id: String,
    /// The `StartSaga` payload — the job the saga was created to run.
    pub job: Value,
    /// Parent saga id, if this is a child saga.
    pub parent_saga_id: Option<String>,
    /// Parent task id, if this is a child saga.
    pub parent_task_id: Option<String>,
    /// Whether `AbortSaga` has been appended.
    pub aborted: bool,
    /// Whether `EndSaga` has been appended (terminal, successful).
    pub completed: bool,
    /// Saga-scoped mutable map, folded from `UpdateSagaContext` messages.
    pub context: serde_json::Map<String, Value>,
    /// Per-task progress, keyed by task id.
    pub task_status: HashMap<String, TaskStatus>,
}

impl SagaState {
    /// Creates the initial state from a saga's `StartSaga` message.
    ///
    /// # Errors
    /// Returns `Corruption` if `msg` is not a `StartSaga`.
    pub fn from_start_saga(msg: &SagaMessage) -> Result<Self, SagaEngineError> {
        if msg.msg_type != MessageType::StartSaga {
            return Err(SagaEngineError::Corruption(
                msg.saga_id.clone(),
                "first message is not StartSaga".to_string(),
            ));
        }

        Ok(Self {
            saga_id: msg.saga_id.clone(),
            job: msg.data.clone(),
            parent_saga_id: msg.parent_saga_id.clone(),
            parent_task_id: msg.parent_task_id.clone(),
            aborted: false,
            completed: false,
            context: serde_json::Map::new(),
            task_status: HashMap::new(),
        })
    }

    /// Returns whether `StartTask` has been recorded for `task_id`.
    pub fn is_task_started(&self, task_id: &str) -> bool {
        self.task_status.get(task_id).map(|t| t.started).unwrap_or(false)
    }

    /// Returns whether `EndTask` has been recorded for `task_id`.
    pub fn is_task_completed(&self, task_id: &str) -> bool {
        self.task_status.get(task_id).map(|t| t.ended).unwrap_or(false)
    }

    /// Returns the `EndTask` payload for `task_id`, if recorded.
    pub fn end_task_data(&self, task_id: &str) -> Option<&Value> {
        self.task_status.get(task_id).and_then(|t| t.end_data.as_ref())
    }

    /// A saga is in a safe state when it is aborted, or when no task has
    /// been started without also having ended. This is the crash window
    /// a `StartTask` with no matching `EndTask` represents.
    pub fn is_safe_state(&self) -> bool {
        self.aborted
            || self
                .task_status
                .values()
                .all(|task| !task.started || task.ended)
    }
}

/// Validates `msg` against `state` without mutating it.
///
/// This is the pure half of the validate-append-apply cycle: callers must
/// call this (directly or via [`apply`]) before durably appending `msg`.
pub fn validate(state: &SagaState, msg: &SagaMessage) -> Result<(), SagaEngineError> {
    let reject = |reason: &str| {
        Err(SagaEngineError::invalid_state(
            state.saga_id.clone(),
            msg.task_id.clone(),
            reason.to_string(),
        ))
    };

    if state.completed {
        return reject("saga already completed, no further messages accepted");
    }

    if state.aborted
        && !matches!(
            msg.msg_type,
            MessageType::StartCompensatingTask
                | MessageType::EndCompensatingTask
                | MessageType::EndSaga
                | MessageType::UpdateSagaContext
        )
    {
        return reject("saga is aborted, only compensation and context messages are accepted");
    }

    match msg.msg_type {
        MessageType::StartSaga => reject("StartSaga may only be the first message of a saga"),
        MessageType::StartTask => {
            let task_id = msg.task_id.as_deref().unwrap_or_default();
            if state.is_task_started(task_id) {
                reject("task already started")
            } else {
                Ok(())
            }
        }
        MessageType::EndTask => {
            let task_id = msg.task_id.as_deref().unwrap_or_default();
            match state.task_status.get(task_id) {
                Some(task) if task.started && !task.ended => Ok(()),
                _ => reject("EndTask requires a prior StartTask with no matching EndTask"),
            }
        }
        MessageType::StartCompensatingTask => {
            let task_id = msg.task_id.as_deref().unwrap_or_default();
            let ended = state.task_status.get(task_id).map(|t| t.ended).unwrap_or(false);
            if state.aborted && ended {
                Ok(())
            } else {
                reject("StartCompensatingTask requires EndTask and an aborted saga")
            }
        }
        MessageType::EndCompensatingTask => {
            let task_id = msg.task_id.as_deref().unwrap_or_default();
            match state.task_status.get(task_id) {
                Some(task) if task.compensating_started && !task.compensating_ended => Ok(()),
                _ => reject("EndCompensatingTask requires a prior StartCompensatingTask with no matching EndCompensatingTask"),
            }
        }
        MessageType::AbortSaga => {
            if state.completed {
                reject("cannot abort a completed saga")
            } else {
                Ok(())
            }
        }
        MessageType::EndSaga => {
            if state.completed {
                reject("saga already completed")
            } else {
                Ok(())
            }
        }
        MessageType::UpdateSagaContext => Ok(()),
    }
}

/// Mutates `state` to reflect `msg`, WITHOUT validating it. Callers that
/// have already validated (e.g. via [`apply`]) use this directly; callers
/// replaying a log that is already known-good (rebuild) call [`apply`].
fn apply_unchecked(state: &mut SagaState, msg: &SagaMessage) {
    match msg.msg_type {
        MessageType::StartSaga => {
            // Handled by `SagaState::from_start_saga`; a well-formed log
            // never reaches this arm after the first message.
        }
        MessageType::EndSaga => {
            state.completed = true;
        }
        MessageType::AbortSaga => {
            state.aborted = true;
        }
        MessageType::StartTask => {
            let task_id = msg.task_id.clone().unwrap_or_default();
            let task = state.task_status.entry(task_id).or_default();
            task.started = true;
            task.start_data = Some(msg.data.clone());
            task.is_optional = msg.is_optional();
        }
        MessageType::EndTask => {
            let task_id = msg.task_id.clone().unwrap_or_default();
            let task = state.task_status.entry(task_id).or_default();
            task.ended = true;
            task.end_data = Some(msg.data.clone());
        }
        MessageType::StartCompensatingTask => {
            let task_id = msg.task_id.clone().unwrap_or_default();
            let task = state.task_status.entry(task_id).or_default();
            task.compensating_started = true;
        }
        MessageType::EndCompensatingTask => {
            let task_id = msg.task_id.clone().unwrap_or_default();
            let task = state.task_status.entry(task_id).or_default();
            task.compensating_ended = true;
            task.compensating_end_data = Some(msg.data.clone());
        }
        MessageType::UpdateSagaContext => {
            if let Value::Object(updates) = &msg.data {
                for (key, value) in updates {
                    state.context.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

/// Validates then applies `msg` to `state`. State is left unchanged if
/// validation rejects the message.
pub fn apply(state: &mut SagaState, msg: &SagaMessage) -> Result<(), SagaEngineError> {
    validate(state, msg)?;
    apply_unchecked(state, msg);
    Ok(())
}

/// Folds a complete message list into a `SagaState` from scratch.
///
/// `project(messages) == apply(project(messages[..n-1]), messages[n])`
/// for every prefix, by construction — this is the property tested in
/// the fold-equivalence suite.
pub fn project(messages: &[SagaMessage]) -> Result<SagaState, SagaEngineError> {
    let (first, rest) = messages
        .split_first()
        .ok_or_else(|| SagaEngineError::Corruption("<unknown>".to_string(), "empty log".to_string()))?;

    let mut state = SagaState::from_start_saga(first)?;
    for msg in rest {
        apply(&mut state, msg).map_err(|e| match e {
            SagaEngineError::InvalidSagaState { saga_id, reason, .. } => {
                SagaEngineError::Corruption(saga_id, reason)
            }
            other => other,
        })?;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType::*;

    fn start(saga_id: &str) -> SagaMessage {
        SagaMessage::new(saga_id, StartSaga, Value::Null)
    }

    #[test]
    fn fresh_state_rejects_everything_but_start_task_and_context() {
        let state = SagaState::from_start_saga(&start("s1")).unwrap();

        let start_task = SagaMessage::new("s1", StartTask, Value::Null).with_task_id("pay");
        assert!(validate(&state, &start_task).is_ok());

        let end_task = SagaMessage::new("s1", EndTask, Value::Null).with_task_id("pay");
        assert!(validate(&state, &end_task).is_err());
    }

    #[test]
    fn full_happy_path_sequence() {
        let mut state = SagaState::from_start_saga(&start("s1")).unwrap();

        apply(&mut state, &SagaMessage::new("s1", StartTask, Value::Null).with_task_id("pay")).unwrap();
        apply(&mut state, &SagaMessage::new("s1", EndTask, serde_json::json!({"ok": true})).with_task_id("pay")).unwrap();
        apply(&mut state, &SagaMessage::new("s1", EndSaga, Value::Null)).unwrap();

        assert!(state.completed);
        assert!(state.is_task_completed("pay"));
        assert_eq!(state.end_task_data("pay"), Some(&serde_json::json!({"ok": true})));
    }

    #[test]
    fn double_start_task_rejected() {
        let mut state = SagaState::from_start_saga(&start("s1")).unwrap();
        let msg = SagaMessage::new("s1", StartTask, Value::Null).with_task_id("pay");
        apply(&mut state, &msg).unwrap();
        assert!(apply(&mut state, &msg).is_err());
    }

    #[test]
    fn compensation_requires_end_task_and_abort() {
        let mut state = SagaState::from_start_saga(&start("s1")).unwrap();
        apply(&mut state, &SagaMessage::new("s1", StartTask, Value::Null).with_task_id("pay")).unwrap();

        let compensate = SagaMessage::new("s1", StartCompensatingTask, Value::Null).with_task_id("pay");
        // No EndTask yet, no AbortSaga yet.
        assert!(validate(&state, &compensate).is_err());

        apply(&mut state, &SagaMessage::new("s1", EndTask, Value::Null).with_task_id("pay")).unwrap();
        // Ended but not aborted.
        assert!(validate(&state, &compensate).is_err());

        apply(&mut state, &SagaMessage::new("s1", AbortSaga, Value::Null)).unwrap();
        assert!(validate(&state, &compensate).is_ok());
    }

    #[test]
    fn abort_saga_is_idempotent_by_rejection() {
        let mut state = SagaState::from_start_saga(&start("s1")).unwrap();
        let abort = SagaMessage::new("s1", AbortSaga, Value::Null);
        apply(&mut state, &abort).unwrap();
        assert!(state.aborted);

        // A second AbortSaga is rejected by the aborted-state exclusion
        // rule, leaving state untouched.
        assert!(apply(&mut state, &abort).is_err());
        assert!(state.aborted);
    }

    #[test]
    fn aborted_saga_rejects_new_start_task() {
        let mut state = SagaState::from_start_saga(&start("s1")).unwrap();
        apply(&mut state, &SagaMessage::new("s1", AbortSaga, Value::Null)).unwrap();

        let new_task = SagaMessage::new("s1", StartTask, Value::Null).with_task_id("reserve");
        assert!(apply(&mut state, &new_task).is_err());
    }

    #[test]
    fn completed_saga_rejects_all_further_messages() {
        let mut state = SagaState::from_start_saga(&start("s1")).unwrap();
        apply(&mut state, &SagaMessage::new("s1", EndSaga, Value::Null)).unwrap();

        let ctx = SagaMessage::new("s1", UpdateSagaContext, serde_json::json!({"a": 1}));
        assert!(apply(&mut state, &ctx).is_err());
    }

    #[test]
    fn update_context_merges_object_keys() {
        let mut state = SagaState::from_start_saga(&start("s1")).unwrap();
        apply(
            &mut state,
            &SagaMessage::new("s1", UpdateSagaContext, serde_json::json!({"a": 1})),
        )
        .unwrap();
        apply(
            &mut state,
            &SagaMessage::new("s1", UpdateSagaContext, serde_json::json!({"b": 2})),
        )
        .unwrap();

        assert_eq!(state.context.get("a"), Some(&serde_json::json!(1)));
        assert_eq!(state.context.get("b"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn safe_state_predicate() {
        let mut state = SagaState::from_start_saga(&start("s1")).unwrap();
        assert!(state.is_safe_state());

        apply(&mut state, &SagaMessage::new("s1", StartTask, Value::Null).with_task_id("pay")).unwrap();
        assert!(!state.is_safe_state(), "started-but-not-ended task is unsafe");

        apply(&mut state, &SagaMessage::new("s1", EndTask, Value::Null).with_task_id("pay")).unwrap();
        assert!(state.is_safe_state());
    }

    #[test]
    fn project_matches_incremental_application() {
        let messages = vec![
            start("s1"),
            SagaMessage::new("s1", StartTask, Value::Null).with_task_id("pay"),
            SagaMessage::new("s1", EndTask, serde_json::json!(1)).with_task_id("pay"),
            SagaMessage::new("s1", EndSaga, Value::Null),
        ];

        let folded = project(&messages).unwrap();

        let mut incremental = SagaState::from_start_saga(&messages[0]).unwrap();
        for msg in &messages[1..] {
            apply(&mut incremental, msg).unwrap();
        }

        assert_eq!(folded.completed, incremental.completed);
        assert_eq!(folded.task_status.len(), incremental.task_status.len());
        assert_eq!(
            folded.end_task_data("pay"),
            incremental.end_task_data("pay")
        );
    }

    #[test]
    fn project_rejects_log_not_starting_with_start_saga() {
        let messages = vec![SagaMessage::new("s1", EndSaga, Value::Null)];
        assert!(project(&messages).is_err());
    }
}
