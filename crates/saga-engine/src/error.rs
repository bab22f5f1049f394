//! Error types for the saga engine.

use thiserror::Error;

/// Result type for saga engine operations.
pub type Result<T> = std::result::Result<T, SagaEngineError>;

/// Comprehensive error types for saga orchestration, per the taxonomy
/// the engine's mutators and the orchestrator commit to.
#[derive(Error, Debug, Clone)]
pub enum SagaEngineError {
    /// `start_saga` called for a sagaId that already has a record.
    #[error("saga already running: {0}")]
    AlreadyRunning(String),

    /// A log operation referenced a sagaId with no record.
    #[error("saga not running: {0}")]
    NotRunning(String),

    /// The transition validator rejected a message.
    #[error("invalid saga state for {saga_id} task {task_id:?}: {reason}")]
    InvalidSagaState {
        /// Saga the rejected message targeted.
        saga_id: String,
        /// Task the rejected message targeted, if task-scoped.
        task_id: Option<String>,
        /// Which rule failed.
        reason: String,
    },

    /// A mailbox mutation exceeded its bound.
    #[error("mutation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Append/read failed in the underlying backend. Saga state is
    /// unchanged, assuming the backend's append is atomic.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// Raised from the user's invoke/compensate/middleware callback.
    #[error("user callback error: {0}")]
    UserCallbackError(String),

    /// Recovery found a log that violates an invariant: message 0 is not
    /// StartSaga, or a validator rejection surfaced during replay.
    #[error("saga log corrupted for {0}: {1}")]
    Corruption(String, String),

    /// A hierarchical traversal or append requested a transaction on a
    /// backend that does not support one.
    #[error("transactions are not supported by this saga log")]
    TransactionsUnsupported,

    /// The saga handle's mailbox has been closed (saga reached EndSaga).
    #[error("saga {0} is closed to further mutation")]
    Closed(String),

    /// Configuration failed validation.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl SagaEngineError {
    /// Creates an `InvalidSagaState` error for a saga-scoped rejection.
    pub fn invalid_state(
        saga_id: impl Into<String>,
        task_id: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidSagaState {
            saga_id: saga_id.into(),
            task_id,
            reason: reason.into(),
        }
    }

    /// Creates a `StorageFailure` from any displayable backend error.
    pub fn storage<E: std::fmt::Display>(error: E) -> Self {
        Self::StorageFailure(error.to_string())
    }

    /// Creates a `UserCallbackError` from any displayable cause.
    pub fn user_callback<E: std::fmt::Display>(error: E) -> Self {
        Self::UserCallbackError(error.to_string())
    }

    /// Creates a `Configuration` error from any displayable cause.
    pub fn configuration<E: std::fmt::Display>(error: E) -> Self {
        Self::Configuration(error.to_string())
    }
}

impl From<serde_json::Error> for SagaEngineError {
    fn from(error: serde_json::Error) -> Self {
        SagaEngineError::storage(error)
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for SagaEngineError {
    fn from(error: sqlx::Error) -> Self {
        SagaEngineError::storage(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_carries_task() {
        let err = SagaEngineError::invalid_state("s1", Some("pay".into()), "already started");
        match err {
            SagaEngineError::InvalidSagaState { saga_id, task_id, .. } => {
                assert_eq!(saga_id, "s1");
                assert_eq!(task_id.as_deref(), Some("pay"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn storage_wraps_display() {
        let err = SagaEngineError::storage("disk full");
        assert!(err.to_string().contains("disk full"));
    }
}
