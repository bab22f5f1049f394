//! In-memory saga log, for testing and single-process deployments.

use super::{already_running, not_running, SagaLog, SagaRecord};
use crate::error::Result;
use crate::message::SagaMessage;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;

/// An in-memory [`SagaLog`] backed by a map from sagaId to record, with a
/// secondary parent→children index maintained on start/delete. Not
/// transactional.
#[derive(Clone, Default)]
pub struct InMemorySagaLog {
    records: Arc<DashMap<String, SagaRecord>>,
    children: Arc<DashMap<String, DashSet<String>>>,
}

impl InMemorySagaLog {
    /// Creates an empty in-memory saga log.
    pub fn new() -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            children: Arc::new(DashMap::new()),
        }
    }

    /// Returns the number of saga records currently held.
    pub fn total_sagas(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl SagaLog for InMemorySagaLog {
    async fn start_saga_with_message(&self, msg: SagaMessage) -> Result<()> {
        let saga_id = msg.saga_id.clone();
        if self.records.contains_key(&saga_id) {
            return Err(already_running(&saga_id));
        }

        if let Some(parent) = msg.parent_saga_id.clone() {
            self.children.entry(parent).or_default().insert(saga_id.clone());
        }

        self.records.insert(saga_id, SagaRecord::new(msg));
        Ok(())
    }

    async fn log_message(&self, msg: SagaMessage) -> Result<()> {
        let mut record = self
            .records
            .get_mut(&msg.saga_id)
            .ok_or_else(|| not_running(&msg.saga_id))?;
        record.push(msg);
        Ok(())
    }

    async fn get_messages(&self, saga_id: &str) -> Result<Vec<SagaMessage>> {
        self.records
            .get(saga_id)
            .map(|r| r.messages.clone())
            .ok_or_else(|| not_running(saga_id))
    }

    async fn get_active_saga_ids(&self) -> Result<Vec<String>> {
        Ok(self.records.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn get_child_saga_ids(&self, parent_saga_id: &str) -> Result<Vec<String>> {
        Ok(self
            .children
            .get(parent_saga_id)
            .map(|set| set.iter().map(|id| id.clone()).collect())
            .unwrap_or_default())
    }

    async fn delete_saga(&self, saga_id: &str) -> Result<()> {
        if let Some((_, record)) = self.records.remove(saga_id) {
            if let Some(parent) = record.parent_saga_id {
                if let Some(siblings) = self.children.get(&parent) {
                    siblings.remove(saga_id);
                }
            }
        }
        self.children.remove(saga_id);
        Ok(())
    }
}
