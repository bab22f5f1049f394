//! The saga log's atomic unit: an immutable `SagaMessage`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Generates a fresh, globally-unique saga id for callers that have no
/// natural identifier of their own to use.
pub fn generate_saga_id() -> String {
    Uuid::new_v4().to_string()
}

/// Tag identifying what kind of durable fact a [`SagaMessage`] records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum MessageType {
    /// First message of every saga.
    StartSaga,
    /// Terminal success message.
    EndSaga,
    /// Marks the saga for compensation.
    AbortSaga,
    /// A task's forward invocation began.
    StartTask,
    /// A task's forward invocation ended (successfully or as a no-op for
    /// an optional task that failed).
    EndTask,
    /// A task's compensation began.
    StartCompensatingTask,
    /// A task's compensation ended.
    EndCompensatingTask,
    /// The saga context was updated outside of a task boundary.
    UpdateSagaContext,
}

impl MessageType {
    /// Returns whether this message type is scoped to a single task.
    pub fn is_task_scoped(self) -> bool {
        matches!(
            self,
            MessageType::StartTask
                | MessageType::EndTask
                | MessageType::StartCompensatingTask
                | MessageType::EndCompensatingTask
        )
    }
}

/// An immutable record appended to a saga's log.
///
/// `parent_saga_id` and `parent_task_id` are only ever populated on the
/// `StartSaga` message of a child saga; `task_id` is populated for every
/// task-scoped message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaMessage {
    /// Saga this message belongs to.
    pub saga_id: String,

    /// What kind of fact this message records.
    pub msg_type: MessageType,

    /// Task this message concerns, for task-scoped message types.
    pub task_id: Option<String>,

    /// Opaque payload: the job on StartSaga, the step's prior/end result
    /// on Start/EndTask, the compensation's end data, or the context
    /// patch on UpdateSagaContext.
    pub data: Value,

    /// Parent saga id, present only on a child saga's StartSaga.
    pub parent_saga_id: Option<String>,

    /// Parent task id, present only on a child saga's StartSaga.
    pub parent_task_id: Option<String>,

    /// When this message was appended.
    pub timestamp: DateTime<Utc>,

    /// Free-form metadata; carries `is_optional` on StartTask.
    pub metadata: HashMap<String, Value>,
}

impl SagaMessage {
    /// Creates a message with no metadata and no parent linkage. Most
    /// callers use this and set fields with the builder methods below.
    pub fn new(saga_id: impl Into<String>, msg_type: MessageType, data: Value) -> Self {
        Self {
            saga_id: saga_id.into(),
            msg_type,
            task_id: None,
            data,
            parent_saga_id: None,
            parent_task_id: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Sets the task id.
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Sets the parent saga/task linkage (StartSaga of a child saga only).
    pub fn with_parent(mut self, parent_saga_id: impl Into<String>, parent_task_id: impl Into<String>) -> Self {
        self.parent_saga_id = Some(parent_saga_id.into());
        self.parent_task_id = Some(parent_task_id.into());
        self
    }

    /// Marks the task started by this StartTask message as optional.
    pub fn with_is_optional(mut self, is_optional: bool) -> Self {
        self.metadata
            .insert("is_optional".to_string(), Value::Bool(is_optional));
        self
    }

    /// Returns whether this StartTask message carries `is_optional: true`.
    pub fn is_optional(&self) -> bool {
        self.metadata
            .get("is_optional")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
