//! The saga handle: a single-writer mailbox actor that owns one saga's
//! in-memory state and serializes every validate-append-apply cycle
//! through it.

use crate::error::{Result, SagaEngineError};
use crate::log::SagaLog;
use crate::message::{MessageType, SagaMessage};
use crate::state::{self, SagaState};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Default bound on a single mailbox round trip, used when a caller does
/// not supply one via `SagaEngineConfig`.
pub const DEFAULT_MAILBOX_TIMEOUT: Duration = Duration::from_secs(5);

const MAILBOX_CAPACITY: usize = 64;

enum Command {
    Mutate(SagaMessage, oneshot::Sender<Result<()>>),
    Read(oneshot::Sender<SagaState>),
}

/// A handle to a single saga's live state. Clones share the same
/// background actor and mailbox; every mutation is applied strictly in
/// the order it is sent.
#[derive(Clone)]
pub struct Saga {
    saga_id: String,
    tx: mpsc::Sender<Command>,
    timeout: Duration,
}

impl Saga {
    /// Starts a brand-new saga: appends `StartSaga` to `log`, then spawns
    /// the actor that will own its state from here on.
    pub async fn create(
        log: Arc<dyn SagaLog>,
        saga_id: impl Into<String>,
        job: Value,
        parent: Option<(String, String)>,
        timeout: Duration,
    ) -> Result<Self> {
        let saga_id = saga_id.into();
        let (parent_saga_id, parent_task_id) = match parent {
            Some((saga, task)) => (Some(saga), Some(task)),
            None => (None, None),
        };

        log.start_saga(&saga_id, job, parent_saga_id, parent_task_id)
            .await?;

        let messages = log.get_messages(&saga_id).await?;
        let state = state::project(&messages)?;

        Ok(Self::spawn(log, state, timeout))
    }

    /// Rehydrates a handle for a saga that already has a log, by
    /// re-projecting its full message history. Used by recovery.
    pub async fn rehydrate(log: Arc<dyn SagaLog>, saga_id: impl Into<String>, timeout: Duration) -> Result<Self> {
        let saga_id = saga_id.into();
        let messages = log.get_messages(&saga_id).await?;
        let state = state::project(&messages)?;
        Ok(Self::spawn(log, state, timeout))
    }

    fn spawn(log: Arc<dyn SagaLog>, state: SagaState, timeout: Duration) -> Self {
        let saga_id = state.saga_id.clone();
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        tokio::spawn(run_actor(log, state, rx));
        Self { saga_id, tx, timeout }
    }

    /// The saga identifier this handle addresses.
    pub fn saga_id(&self) -> &str {
        &self.saga_id
    }

    /// Returns a read-only view sharing this saga's actor.
    pub fn as_read_only(&self) -> SagaReadOnly {
        SagaReadOnly {
            saga_id: self.saga_id.clone(),
            tx: self.tx.clone(),
            timeout: self.timeout,
        }
    }

    async fn mutate(&self, msg: SagaMessage) -> Result<()> {
        let (respond, recv) = oneshot::channel();

        // The whole round trip — waiting for mailbox capacity to send, and
        // waiting for the actor's reply — must fit inside one bound. A
        // separate timeout on just `recv` would let a caller block past
        // the configured deadline on `send` alone under backpressure.
        let round_trip = async {
            self.tx
                .send(Command::Mutate(msg, respond))
                .await
                .map_err(|_| SagaEngineError::Closed(self.saga_id.clone()))?;

            match recv.await {
                Ok(result) => result,
                Err(_) => Err(SagaEngineError::Closed(self.saga_id.clone())),
            }
        };

        match tokio::time::timeout(self.timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(SagaEngineError::Timeout(self.timeout)),
        }
    }

    /// Records the start of `task_id`'s forward invocation.
    pub async fn start_task(&self, task_id: impl Into<String>, data: Value, is_optional: bool) -> Result<()> {
        let msg = SagaMessage::new(&self.saga_id, MessageType::StartTask, data)
            .with_task_id(task_id)
            .with_is_optional(is_optional);
        self.mutate(msg).await
    }

    /// Records the end of `task_id`'s forward invocation.
    pub async fn end_task(&self, task_id: impl Into<String>, data: Value) -> Result<()> {
        let msg = SagaMessage::new(&self.saga_id, MessageType::EndTask, data).with_task_id(task_id);
        self.mutate(msg).await
    }

    /// Records the start of `task_id`'s compensation.
    pub async fn start_compensating_task(&self, task_id: impl Into<String>, data: Value) -> Result<()> {
        let msg = SagaMessage::new(&self.saga_id, MessageType::StartCompensatingTask, data).with_task_id(task_id);
        self.mutate(msg).await
    }

    /// Records the end of `task_id`'s compensation.
    pub async fn end_compensating_task(&self, task_id: impl Into<String>, data: Value) -> Result<()> {
        let msg = SagaMessage::new(&self.saga_id, MessageType::EndCompensatingTask, data).with_task_id(task_id);
        self.mutate(msg).await
    }

    /// Marks the saga for compensation.
    pub async fn abort_saga(&self, reason: Value) -> Result<()> {
        let msg = SagaMessage::new(&self.saga_id, MessageType::AbortSaga, reason);
        self.mutate(msg).await
    }

    /// Marks the saga as successfully completed.
    pub async fn end_saga(&self, data: Value) -> Result<()> {
        let msg = SagaMessage::new(&self.saga_id, MessageType::EndSaga, data);
        self.mutate(msg).await
    }

    /// Merges `patch`'s top-level keys into the saga context.
    pub async fn update_saga_context(&self, patch: Value) -> Result<()> {
        let msg = SagaMessage::new(&self.saga_id, MessageType::UpdateSagaContext, patch);
        self.mutate(msg).await
    }

    /// Returns a snapshot of the current state.
    pub async fn state(&self) -> Result<SagaState> {
        read_state(&self.tx, &self.saga_id, self.timeout).await
    }
}

/// A read-only view of a saga's state, sharing its actor with the
/// [`Saga`] handle it was derived from. Exposes no mutation methods.
#[derive(Clone)]
pub struct SagaReadOnly {
    saga_id: String,
    tx: mpsc::Sender<Command>,
    timeout: Duration,
}

impl SagaReadOnly {
    /// The saga identifier this view addresses.
    pub fn saga_id(&self) -> &str {
        &self.saga_id
    }

    /// Returns a snapshot of the current state.
    pub async fn state(&self) -> Result<SagaState> {
        read_state(&self.tx, &self.saga_id, self.timeout).await
    }
}

async fn read_state(tx: &mpsc::Sender<Command>, saga_id: &str, timeout: Duration) -> Result<SagaState> {
    let (respond, recv) = oneshot::channel();

    // Same reasoning as `Saga::mutate`: bound the send and the reply
    // together, not just the reply.
    let round_trip = async {
        tx.send(Command::Read(respond))
            .await
            .map_err(|_| SagaEngineError::Closed(saga_id.to_string()))?;

        match recv.await {
            Ok(state) => Ok(state),
            Err(_) => Err(SagaEngineError::Closed(saga_id.to_string())),
        }
    };

    match tokio::time::timeout(timeout, round_trip).await {
        Ok(result) => result,
        Err(_) => Err(SagaEngineError::Timeout(timeout)),
    }
}

async fn run_actor(log: Arc<dyn SagaLog>, mut state: SagaState, mut rx: mpsc::Receiver<Command>) {
    let saga_id = state.saga_id.clone();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Mutate(msg, respond) => {
                let result = apply_durably(&log, &mut state, msg).await;
                if let Err(ref e) = result {
                    warn!(saga_id = %saga_id, error = %e, "saga mutation rejected");
                }
                let _ = respond.send(result);
            }
            Command::Read(respond) => {
                let _ = respond.send(state.clone());
            }
        }
    }
    debug!(saga_id = %saga_id, "saga actor mailbox closed, shutting down");
}

async fn apply_durably(log: &Arc<dyn SagaLog>, state: &mut SagaState, msg: SagaMessage) -> Result<()> {
    state::validate(state, &msg)?;

    log.log_message(msg.clone()).await.map_err(|e| {
        error!(saga_id = %msg.saga_id, error = %e, "failed to durably log saga message");
        e
    })?;

    state::apply(state, &msg).expect("message already validated against identical state");
    debug!(saga_id = %msg.saga_id, msg_type = ?msg.msg_type, task_id = ?msg.task_id, "saga message applied");
    Ok(())
}
