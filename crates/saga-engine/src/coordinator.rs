//! A thin factory over a shared [`SagaLog`] that knows how to traverse
//! parent/child saga hierarchies for abort and delete, and how to bring
//! up a saga handle whether it is new or being recovered.

use crate::error::{Result, SagaEngineError};
use crate::log::{SagaLog, SagaTransaction};
use crate::message::{MessageType, SagaMessage};
use crate::recovery::{self, RecoveryStrategy};
use crate::saga::Saga;
use crate::state;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Holds the shared log and exposes hierarchy-aware operations that a
/// single [`Saga`] handle cannot perform on its own.
#[derive(Clone)]
pub struct Coordinator {
    log: Arc<dyn SagaLog>,
}

impl Coordinator {
    /// Wraps a saga log.
    pub fn new(log: Arc<dyn SagaLog>) -> Self {
        Self { log }
    }

    /// The underlying log, for callers that need direct access (e.g. to
    /// construct a [`Saga`] handle themselves).
    pub fn log(&self) -> &Arc<dyn SagaLog> {
        &self.log
    }

    /// Aborts `saga_id` and every descendant, children before parents.
    /// With `use_tx`, every append happens through one native transaction
    /// covering the whole traversal, so a failure partway through rolls
    /// every earlier append in this call back out; this fails with
    /// [`SagaEngineError::TransactionsUnsupported`] up front if the
    /// backend does not support transactions, rather than silently
    /// running best-effort.
    pub async fn abort_saga_with_children(&self, saga_id: &str, reason: Value, use_tx: bool) -> Result<()> {
        let ids = self.descendants_then_self(saga_id).await?;

        if use_tx {
            if !self.log.supports_transactions() {
                return Err(SagaEngineError::TransactionsUnsupported);
            }
            let mut tx = self.log.begin_transaction().await?;
            match self.abort_ids(&ids, &reason, Some(&mut tx)).await {
                Ok(()) => self.log.commit_transaction(tx).await,
                Err(e) => {
                    let _ = self.log.abort_transaction(tx).await;
                    Err(e)
                }
            }
        } else {
            self.abort_ids(&ids, &reason, None).await
        }
    }

    async fn abort_ids(&self, ids: &[String], reason: &Value, mut tx: Option<&mut SagaTransaction>) -> Result<()> {
        for saga_id in ids {
            let messages = self.log.get_messages(saga_id).await?;
            let current = state::project(&messages)?;
            if current.aborted || current.completed {
                continue;
            }

            let msg = SagaMessage::new(saga_id.as_str(), MessageType::AbortSaga, reason.clone());
            match tx.as_deref_mut() {
                Some(tx) => self.log.log_message_in_transaction(tx, msg).await?,
                None => self.log.log_message(msg).await?,
            }
        }
        Ok(())
    }

    /// Deletes `saga_id` and every descendant, children before parents, so
    /// no record is ever left with a dangling `parent_saga_id`. With
    /// `use_tx`, every delete happens through one native transaction
    /// covering the whole traversal.
    pub async fn delete_saga_with_children(&self, saga_id: &str, use_tx: bool) -> Result<()> {
        let ids = self.descendants_then_self(saga_id).await?;

        if use_tx {
            if !self.log.supports_transactions() {
                return Err(SagaEngineError::TransactionsUnsupported);
            }
            let mut tx = self.log.begin_transaction().await?;
            match self.delete_ids(&ids, Some(&mut tx)).await {
                Ok(()) => self.log.commit_transaction(tx).await,
                Err(e) => {
                    let _ = self.log.abort_transaction(tx).await;
                    Err(e)
                }
            }
        } else {
            self.delete_ids(&ids, None).await
        }
    }

    async fn delete_ids(&self, ids: &[String], mut tx: Option<&mut SagaTransaction>) -> Result<()> {
        for saga_id in ids {
            match tx.as_deref_mut() {
                Some(tx) => self.log.delete_saga_in_transaction(tx, saga_id).await?,
                None => self.log.delete_saga(saga_id).await?,
            }
        }
        Ok(())
    }

    /// Walks the saga hierarchy rooted at `saga_id` and returns every id
    /// in an order where every descendant comes before its ancestors
    /// (`saga_id` itself is always last). The topology is read up front,
    /// outside of any transaction: nothing about it changes as a result
    /// of the abort/delete that follows, so reading it through the pool
    /// instead of the transaction's own connection is safe.
    async fn descendants_then_self(&self, saga_id: &str) -> Result<Vec<String>> {
        let mut by_depth: Vec<(String, usize)> = Vec::new();
        let mut queue: std::collections::VecDeque<(String, usize)> = std::collections::VecDeque::new();
        queue.push_back((saga_id.to_string(), 0));

        while let Some((id, depth)) = queue.pop_front() {
            for child in self.log.get_child_saga_ids(&id).await? {
                queue.push_back((child, depth + 1));
            }
            by_depth.push((id, depth));
        }

        by_depth.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(by_depth.into_iter().map(|(id, _)| id).collect())
    }

    /// Brings up a handle for `saga_id`: recovers it if a record already
    /// exists, otherwise starts it fresh with `job`.
    pub async fn recover_or_create(
        &self,
        saga_id: &str,
        job: Value,
        strategy: RecoveryStrategy,
        timeout: Duration,
    ) -> Result<Saga> {
        match self.log.get_messages(saga_id).await {
            Ok(_) => recovery::recover_saga_state(Arc::clone(&self.log), saga_id, strategy, timeout).await,
            Err(SagaEngineError::NotRunning(_)) => Saga::create(Arc::clone(&self.log), saga_id, job, None, timeout).await,
            Err(e) => Err(e),
        }
    }
}
