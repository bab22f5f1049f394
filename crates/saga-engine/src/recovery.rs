//! Crash recovery: rebuilds a saga's state from its log and decides
//! whether to resume forward or roll back, before handing back a live
//! [`Saga`] handle.

use crate::error::Result;
use crate::log::SagaLog;
use crate::message::{MessageType, SagaMessage};
use crate::saga::Saga;
use crate::state;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// How recovery treats a saga found in an unsafe state (a `StartTask`
/// with no matching `EndTask`) at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Resume forward execution from the saga's log as-is; the caller's
    /// orchestrator is expected to re-drive the in-flight step.
    Forward,
    /// Append `AbortSaga` before resuming, so the orchestrator runs
    /// compensation instead of re-attempting the in-flight step.
    Rollback,
}

/// Rebuilds `saga_id`'s state from `log` and, under
/// [`RecoveryStrategy::Rollback`], appends `AbortSaga` if the rebuilt
/// state is unsafe. Returns a live handle either way.
///
/// A log that does not start with `StartSaga`, or that a replay
/// rejects, surfaces as [`crate::error::SagaEngineError::Corruption`].
pub async fn recover_saga_state(
    log: Arc<dyn SagaLog>,
    saga_id: &str,
    strategy: RecoveryStrategy,
    timeout: Duration,
) -> Result<Saga> {
    let messages = log.get_messages(saga_id).await?;
    let state = state::project(&messages)?;

    if strategy == RecoveryStrategy::Rollback && !state.is_safe_state() {
        warn!(saga_id, "unsafe state at recovery, aborting for rollback");
        log.log_message(SagaMessage::new(
            saga_id,
            MessageType::AbortSaga,
            serde_json::json!({ "reason": "crash recovery: unsafe state under rollback strategy" }),
        ))
        .await?;
    }

    Saga::rehydrate(log, saga_id, timeout).await
}
