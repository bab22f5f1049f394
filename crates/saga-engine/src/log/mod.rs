//! The saga log storage contract: an append-only, per-saga journal that
//! is the single source of truth for saga state.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod document;

use crate::error::{Result, SagaEngineError};
use crate::message::{MessageType, SagaMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;

/// A saga's full durable footprint: its ordered messages plus the
/// bookkeeping the log maintains around them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaRecord {
    /// Saga identifier.
    pub saga_id: String,
    /// Messages in append order; index 0 is always `StartSaga`.
    pub messages: Vec<SagaMessage>,
    /// Timestamp of the `StartSaga` message.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent append.
    pub updated_at: DateTime<Utc>,
    /// Parent saga id, carried from `StartSaga`.
    pub parent_saga_id: Option<String>,
    /// Parent task id, carried from `StartSaga`.
    pub parent_task_id: Option<String>,
}

impl SagaRecord {
    fn new(start: SagaMessage) -> Self {
        Self {
            saga_id: start.saga_id.clone(),
            created_at: start.timestamp,
            updated_at: start.timestamp,
            parent_saga_id: start.parent_saga_id.clone(),
            parent_task_id: start.parent_task_id.clone(),
            messages: vec![start],
        }
    }

    fn push(&mut self, msg: SagaMessage) {
        self.updated_at = msg.timestamp;
        self.messages.push(msg);
    }
}

/// A type-erased native transaction/session handle. Backends that support
/// transactions downcast this back to their concrete type internally;
/// callers only ever move it between `begin`/`commit`/`abort`.
pub type SagaTransaction = Box<dyn Any + Send>;

/// Storage contract a saga log implementation must satisfy. Appends to a
/// single sagaId are serialized and durable before returning; reads
/// following a successful append observe it. No cross-sagaId ordering is
/// guaranteed.
///
/// Transaction support is optional: the default `begin`/`commit`/`abort`
/// implementations return [`SagaEngineError::TransactionsUnsupported`].
/// A backend that supports transactions overrides all three plus
/// [`SagaLog::supports_transactions`] and hands back its native session
/// boxed as [`SagaTransaction`] (see `log::document` for the reference
/// implementation).
#[async_trait]
pub trait SagaLog: Send + Sync {
    /// Appends a `StartSaga` record. Fails with `AlreadyRunning` if
    /// `saga_id` already has a record.
    async fn start_saga(
        &self,
        saga_id: &str,
        job: Value,
        parent_saga_id: Option<String>,
        parent_task_id: Option<String>,
    ) -> Result<()> {
        let mut msg = SagaMessage::new(saga_id, MessageType::StartSaga, job);
        if let (Some(parent), Some(task)) = (parent_saga_id, parent_task_id) {
            msg = msg.with_parent(parent, task);
        }
        self.start_saga_with_message(msg).await
    }

    /// Appends a pre-built `StartSaga` message. Implementations provide
    /// this; [`SagaLog::start_saga`] is the ergonomic entry point above.
    async fn start_saga_with_message(&self, msg: SagaMessage) -> Result<()>;

    /// Appends `msg` to an existing saga. Fails with `NotRunning` if
    /// `msg.saga_id` is unknown.
    async fn log_message(&self, msg: SagaMessage) -> Result<()>;

    /// Returns all messages for `saga_id` in append order. Fails with
    /// `NotRunning` if absent.
    async fn get_messages(&self, saga_id: &str) -> Result<Vec<SagaMessage>>;

    /// Returns every sagaId with a record, including completed or
    /// aborted sagas that have not been deleted.
    async fn get_active_saga_ids(&self) -> Result<Vec<String>>;

    /// Returns every sagaId whose `StartSaga` declared `parent_saga_id`
    /// as its parent.
    async fn get_child_saga_ids(&self, parent_saga_id: &str) -> Result<Vec<String>>;

    /// Removes a saga's record entirely.
    async fn delete_saga(&self, saga_id: &str) -> Result<()>;

    /// Whether this backend supports [`SagaLog::begin_transaction`].
    fn supports_transactions(&self) -> bool {
        false
    }

    /// Begins a native transaction/session, if supported.
    async fn begin_transaction(&self) -> Result<SagaTransaction> {
        Err(SagaEngineError::TransactionsUnsupported)
    }

    /// Commits a transaction started with [`SagaLog::begin_transaction`].
    async fn commit_transaction(&self, _tx: SagaTransaction) -> Result<()> {
        Err(SagaEngineError::TransactionsUnsupported)
    }

    /// Aborts a transaction started with [`SagaLog::begin_transaction`].
    async fn abort_transaction(&self, _tx: SagaTransaction) -> Result<()> {
        Err(SagaEngineError::TransactionsUnsupported)
    }

    /// Appends `msg` using the connection held open by `tx`, so the write
    /// rolls back with everything else in that transaction. Only called
    /// against a `tx` this same backend produced from
    /// [`SagaLog::begin_transaction`]; the default is never reached in
    /// practice since callers only take this path after confirming
    /// [`SagaLog::supports_transactions`].
    async fn log_message_in_transaction(&self, _tx: &mut SagaTransaction, _msg: SagaMessage) -> Result<()> {
        Err(SagaEngineError::TransactionsUnsupported)
    }

    /// Deletes `saga_id` using the connection held open by `tx`. See
    /// [`SagaLog::log_message_in_transaction`].
    async fn delete_saga_in_transaction(&self, _tx: &mut SagaTransaction, _saga_id: &str) -> Result<()> {
        Err(SagaEngineError::TransactionsUnsupported)
    }
}

fn not_running(saga_id: &str) -> SagaEngineError {
    SagaEngineError::NotRunning(saga_id.to_string())
}

fn already_running(saga_id: &str) -> SagaEngineError {
    SagaEngineError::AlreadyRunning(saga_id.to_string())
}
