//! Drives a [`SagaDefinition`] against a [`Saga`] handle: forward
//! execution, crash-resume, and best-effort reverse-order compensation,
//! emitting an ordered event taxonomy to registered subscribers.

use crate::error::Result;
use crate::saga::{Saga, SagaReadOnly};
use crate::state::SagaState;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

/// A writable handle onto a saga's context, handed to task and
/// compensation callbacks so they can read or extend it without going
/// through the rest of the [`Saga`] mutation surface.
#[derive(Clone)]
pub struct ContextHandle {
    saga: Saga,
}

impl ContextHandle {
    fn new(saga: Saga) -> Self {
        Self { saga }
    }

    /// Returns the saga context as of the time of the call (not
    /// necessarily the snapshot the callback started with — another
    /// concurrent mutation may have landed in between).
    pub async fn get(&self) -> Result<serde_json::Map<String, Value>> {
        Ok(self.saga.state().await?.context)
    }

    /// Appends an `UpdateSagaContext` message merging `patch`'s top-level
    /// keys into the saga's context.
    pub async fn update(&self, patch: Value) -> Result<()> {
        self.saga.update_saga_context(patch).await
    }
}

/// Context handed to a step's forward invocation.
pub struct TaskContext<Data> {
    /// Saga this task belongs to.
    pub saga_id: String,
    /// Parent saga id, if this is a child saga.
    pub parent_saga_id: Option<String>,
    /// Parent task id, if this is a child saga.
    pub parent_task_id: Option<String>,
    /// This step's name.
    pub task_id: String,
    /// The caller-supplied job data, constant across the whole saga.
    pub data: Data,
    /// The previous step's output (or the saga's job payload, for the
    /// first step).
    pub previous: Value,
    /// The saga context as of this step's start.
    pub context: serde_json::Map<String, Value>,
    /// Keys accumulated so far from middleware callbacks run ahead of this
    /// step, in registration order: each middleware that returns an object
    /// sees every earlier middleware's contribution and adds its own.
    pub middleware: serde_json::Map<String, Value>,
    /// Read-only view of the saga, safe to hand to the callback.
    pub api: SagaReadOnly,
    /// Writable handle onto the saga's context.
    pub ctx: ContextHandle,
}

/// Context handed to a step's compensation.
pub struct CompensationContext<Data> {
    /// Saga this compensation belongs to.
    pub saga_id: String,
    /// Parent saga id, if this is a child saga.
    pub parent_saga_id: Option<String>,
    /// Parent task id, if this is a child saga.
    pub parent_task_id: Option<String>,
    /// This step's name.
    pub task_id: String,
    /// The caller-supplied job data, constant across the whole saga.
    pub data: Data,
    /// This step's recorded forward-invocation output.
    pub end_data: Value,
    /// The saga context as of compensation start.
    pub context: serde_json::Map<String, Value>,
    /// Always empty: middleware does not run during compensation.
    pub middleware: serde_json::Map<String, Value>,
    /// Read-only view of the saga, safe to hand to the callback.
    pub api: SagaReadOnly,
    /// Writable handle onto the saga's context.
    pub ctx: ContextHandle,
}

type InvokeFn<Data> = Arc<dyn Fn(TaskContext<Data>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type CompensateFn<Data> = Arc<dyn Fn(CompensationContext<Data>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A middleware callback's outcome: `Ok(None)` is the void/true "pass"
/// case, `Ok(Some(object))` is the object case whose keys are merged into
/// the accumulating middleware map, and `Err(_)` is the false/throw case
/// that fails the step.
type MiddlewareFn<Data> = Arc<dyn Fn(&TaskContext<Data>) -> Result<Option<serde_json::Map<String, Value>>> + Send + Sync>;

/// One step of a saga: a named forward invocation with an optional
/// compensating action.
pub struct Step<Data> {
    /// Step name; doubles as the saga log's `task_id`.
    pub name: String,
    invoke: InvokeFn<Data>,
    compensate: Option<CompensateFn<Data>>,
    is_optional: bool,
}

impl<Data> Step<Data> {
    /// Whether this step is exempt from aborting the saga on failure.
    pub fn is_optional(&self) -> bool {
        self.is_optional
    }
}

/// An ordered list of steps, plus saga-wide middleware run before every
/// step's invocation.
pub struct SagaDefinition<Data> {
    steps: Vec<Step<Data>>,
    middleware: Vec<MiddlewareFn<Data>>,
}

impl<Data> SagaDefinition<Data> {
    /// This definition's steps, in execution order.
    pub fn steps(&self) -> &[Step<Data>] {
        &self.steps
    }
}

/// Minimal fluent constructor for [`SagaDefinition`].
pub struct SagaDefinitionBuilder<Data> {
    steps: Vec<Step<Data>>,
    middleware: Vec<MiddlewareFn<Data>>,
}

impl<Data> SagaDefinitionBuilder<Data> {
    /// Starts an empty definition.
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            middleware: Vec::new(),
        }
    }

    /// Appends a step with a forward invocation.
    pub fn step<F>(mut self, name: impl Into<String>, invoke: F) -> Self
    where
        F: Fn(TaskContext<Data>) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        self.steps.push(Step {
            name: name.into(),
            invoke: Arc::new(invoke),
            compensate: None,
            is_optional: false,
        });
        self
    }

    /// Attaches a compensating action to the most recently added step.
    pub fn with_compensation<F>(mut self, compensate: F) -> Self
    where
        F: Fn(CompensationContext<Data>) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        if let Some(last) = self.steps.last_mut() {
            last.compensate = Some(Arc::new(compensate));
        }
        self
    }

    /// Marks the most recently added step optional: its failure is
    /// stashed in the saga context instead of aborting the saga.
    pub fn optional(mut self) -> Self {
        if let Some(last) = self.steps.last_mut() {
            last.is_optional = true;
        }
        self
    }

    /// Adds saga-wide middleware, run before every step's invocation in
    /// registration order.
    pub fn middleware<F>(mut self, mw: F) -> Self
    where
        F: Fn(&TaskContext<Data>) -> Result<Option<serde_json::Map<String, Value>>> + Send + Sync + 'static,
    {
        self.middleware.push(Arc::new(mw));
        self
    }

    /// Finishes the definition.
    pub fn build(self) -> SagaDefinition<Data> {
        SagaDefinition {
            steps: self.steps,
            middleware: self.middleware,
        }
    }
}

impl<Data> Default for SagaDefinitionBuilder<Data> {
    fn default() -> Self {
        Self::new()
    }
}

/// An observable fact about a saga run, delivered to every subscriber in
/// registration order, synchronously, as it happens.
#[derive(Debug, Clone)]
pub enum SagaEvent {
    /// Orchestration began.
    SagaStarted { saga_id: String },
    /// Every step completed and `EndSaga` was appended.
    SagaSucceeded { saga_id: String },
    /// A required step failed; the saga was aborted.
    SagaFailed { saga_id: String, reason: String },
    /// A step's forward invocation began.
    TaskStarted { saga_id: String, task_id: String },
    /// A step's forward invocation succeeded.
    TaskSucceeded { saga_id: String, task_id: String },
    /// A required step's forward invocation failed.
    TaskFailed { saga_id: String, task_id: String, reason: String },
    /// An optional step's forward invocation failed; execution continued.
    OptionalTaskFailed { saga_id: String, task_id: String, reason: String },
    /// Middleware ran ahead of a step without error.
    MiddlewareSucceeded { saga_id: String, task_id: String },
    /// Middleware ahead of a step failed, aborting the saga.
    MiddlewareFailed { saga_id: String, task_id: String, reason: String },
    /// A step's compensation began.
    CompensationStarted { saga_id: String, task_id: String },
    /// A step's compensation succeeded.
    CompensationSucceeded { saga_id: String, task_id: String },
    /// A step's compensation failed; compensation continued best-effort.
    CompensationFailed { saga_id: String, task_id: String, reason: String },
}

/// Receives [`SagaEvent`]s from an [`Orchestrator`]. Subscribers are pure
/// sinks: their errors are not propagated back into the run.
#[async_trait]
pub trait SagaEventSubscriber: Send + Sync {
    /// Handles one event.
    async fn on_event(&self, event: &SagaEvent);
}

const OPTIONAL_TASK_ERRORS_KEY: &str = "__optionalTaskErrors__";

/// Distinguishes "every step ran" from "a step's own callback failed" so
/// `run` can apply the error propagation policy in §7: a callback failure
/// drives the saga into compensation but is not itself surfaced as an
/// `Err` from `run`, while a genuine infrastructure failure (a log append
/// that could not complete) still bubbles straight out.
enum ForwardOutcome {
    /// Every step's forward invocation succeeded.
    Completed,
    /// A step's invoke/middleware callback failed; the saga should be
    /// aborted and compensated, but the error itself is not `run`'s to
    /// return — see the call site in [`Orchestrator::run`].
    Failed(crate::error::SagaEngineError),
}

/// Executes [`SagaDefinition`]s against [`Saga`] handles.
#[derive(Default)]
pub struct Orchestrator {
    subscribers: RwLock<Vec<Arc<dyn SagaEventSubscriber>>>,
}

impl Orchestrator {
    /// Creates an orchestrator with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber; delivery order matches registration order.
    /// Shared via an `Arc<Orchestrator>`, subscription does not require
    /// exclusive access.
    pub fn subscribe(&self, subscriber: Arc<dyn SagaEventSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    async fn emit(&self, event: SagaEvent) {
        let subscribers = self.subscribers.read().clone();
        for subscriber in &subscribers {
            subscriber.on_event(&event).await;
        }
    }

    /// Runs `def` against `saga`, resuming from whatever prefix of steps
    /// the saga's log already shows completed. On a required step's
    /// failure, aborts the saga and runs compensation for every
    /// completed step in reverse order, best-effort.
    pub async fn run<Data>(&self, saga: &Saga, def: &SagaDefinition<Data>, data: &Data) -> Result<()>
    where
        Data: Clone + Send + Sync + 'static,
    {
        let saga_id = saga.saga_id().to_string();
        self.emit(SagaEvent::SagaStarted { saga_id: saga_id.clone() }).await;

        let state = saga.state().await?;

        if state.completed {
            self.emit(SagaEvent::SagaSucceeded { saga_id }).await;
            return Ok(());
        }

        if state.aborted {
            // Recovery (or an external abort) already decided this saga
            // cannot proceed forward; skip straight to compensation
            // instead of re-aborting an already-aborted saga.
            self.emit(SagaEvent::SagaFailed {
                saga_id: saga_id.clone(),
                reason: "saga was already aborted before this run started".to_string(),
            })
            .await;
            self.run_compensation(saga, def, data).await?;
            return Ok(());
        }

        let start_index = resume_index(&state, def);

        match self.run_forward(saga, def, data, &state, start_index).await {
            Ok(ForwardOutcome::Completed) => {
                saga.end_saga(Value::Null).await?;
                self.emit(SagaEvent::SagaSucceeded { saga_id }).await;
                Ok(())
            }
            // A step's invoke/compensate/middleware callback failed: per
            // the error propagation policy, this is not surfaced to the
            // caller of `run` — it triggers the forward→compensation
            // transition and `run` still returns `Ok`. Callers distinguish
            // success from a compensated saga via `is_saga_aborted`/
            // `is_saga_completed` on the state they read back.
            Ok(ForwardOutcome::Failed(e)) => {
                let reason = e.to_string();
                saga.abort_saga(serde_json::json!({ "reason": reason })).await?;
                self.emit(SagaEvent::SagaFailed { saga_id, reason }).await;
                self.run_compensation(saga, def, data).await?;
                Ok(())
            }
            // Anything else (storage failure, timeout, closed mailbox) is
            // an infrastructure failure, not a saga-level outcome; it
            // bubbles straight out since the saga's own state may not even
            // be known to be mutated.
            Err(e) => Err(e),
        }
    }

    async fn run_forward<Data>(
        &self,
        saga: &Saga,
        def: &SagaDefinition<Data>,
        data: &Data,
        state: &SagaState,
        start_index: usize,
    ) -> Result<ForwardOutcome>
    where
        Data: Clone + Send + Sync + 'static,
    {
        let mut previous = previous_output(state, def, start_index);
        let mut optional_errors = serde_json::Map::new();

        for step in &def.steps[start_index..] {
            if state.is_task_completed(&step.name) {
                previous = state.end_task_data(&step.name).cloned().unwrap_or(Value::Null);
                continue;
            }

            let saga_id = saga.saga_id().to_string();
            let mut middleware_acc = serde_json::Map::new();

            for mw in &def.middleware {
                let ctx = TaskContext {
                    saga_id: saga_id.clone(),
                    parent_saga_id: state.parent_saga_id.clone(),
                    parent_task_id: state.parent_task_id.clone(),
                    task_id: step.name.clone(),
                    data: data.clone(),
                    previous: previous.clone(),
                    context: state.context.clone(),
                    middleware: middleware_acc.clone(),
                    api: saga.as_read_only(),
                    ctx: ContextHandle::new(saga.clone()),
                };
                match mw(&ctx) {
                    Ok(merged) => {
                        if let Some(obj) = merged {
                            middleware_acc.extend(obj);
                        }
                        self.emit(SagaEvent::MiddlewareSucceeded {
                            saga_id: saga_id.clone(),
                            task_id: step.name.clone(),
                        })
                        .await
                    }
                    Err(e) => {
                        self.emit(SagaEvent::MiddlewareFailed {
                            saga_id: saga_id.clone(),
                            task_id: step.name.clone(),
                            reason: e.to_string(),
                        })
                        .await;
                        return Ok(ForwardOutcome::Failed(e));
                    }
                }
            }

            // A crash between this step's StartTask and EndTask resumes
            // here under forward recovery: the step is re-invoked, but the
            // durable log must not see a second StartTask for it.
            if !state.is_task_started(&step.name) {
                saga.start_task(step.name.clone(), previous.clone(), step.is_optional).await?;
                self.emit(SagaEvent::TaskStarted {
                    saga_id: saga_id.clone(),
                    task_id: step.name.clone(),
                })
                .await;
            }

            let ctx = TaskContext {
                saga_id: saga_id.clone(),
                parent_saga_id: state.parent_saga_id.clone(),
                parent_task_id: state.parent_task_id.clone(),
                task_id: step.name.clone(),
                data: data.clone(),
                previous: previous.clone(),
                context: state.context.clone(),
                middleware: middleware_acc,
                api: saga.as_read_only(),
                ctx: ContextHandle::new(saga.clone()),
            };

            match (step.invoke)(ctx).await {
                Ok(result) => {
                    saga.end_task(step.name.clone(), result.clone()).await?;
                    self.emit(SagaEvent::TaskSucceeded {
                        saga_id: saga_id.clone(),
                        task_id: step.name.clone(),
                    })
                    .await;
                    previous = result;
                }
                Err(e) if step.is_optional => {
                    self.emit(SagaEvent::OptionalTaskFailed {
                        saga_id: saga_id.clone(),
                        task_id: step.name.clone(),
                        reason: e.to_string(),
                    })
                    .await;
                    saga.end_task(step.name.clone(), Value::Null).await?;
                    optional_errors.insert(step.name.clone(), Value::String(e.to_string()));
                    previous = Value::Null;
                }
                Err(e) => {
                    self.emit(SagaEvent::TaskFailed {
                        saga_id: saga_id.clone(),
                        task_id: step.name.clone(),
                        reason: e.to_string(),
                    })
                    .await;
                    if !optional_errors.is_empty() {
                        let _ = saga
                            .update_saga_context(serde_json::json!({ OPTIONAL_TASK_ERRORS_KEY: optional_errors }))
                            .await;
                    }
                    return Ok(ForwardOutcome::Failed(e));
                }
            }
        }

        if !optional_errors.is_empty() {
            saga.update_saga_context(serde_json::json!({ OPTIONAL_TASK_ERRORS_KEY: optional_errors }))
                .await?;
        }

        Ok(ForwardOutcome::Completed)
    }

    async fn run_compensation<Data>(&self, saga: &Saga, def: &SagaDefinition<Data>, data: &Data) -> Result<()>
    where
        Data: Clone + Send + Sync + 'static,
    {
        let state = saga.state().await?;
        let saga_id = saga.saga_id().to_string();

        for step in def.steps.iter().rev() {
            if !state.is_task_completed(&step.name) {
                continue;
            }
            let Some(compensate) = &step.compensate else {
                continue;
            };
            let end_data = state.end_task_data(&step.name).cloned().unwrap_or(Value::Null);

            saga.start_compensating_task(step.name.clone(), end_data.clone()).await?;
            self.emit(SagaEvent::CompensationStarted {
                saga_id: saga_id.clone(),
                task_id: step.name.clone(),
            })
            .await;

            let ctx = CompensationContext {
                saga_id: saga_id.clone(),
                parent_saga_id: state.parent_saga_id.clone(),
                parent_task_id: state.parent_task_id.clone(),
                task_id: step.name.clone(),
                data: data.clone(),
                end_data,
                context: state.context.clone(),
                middleware: serde_json::Map::new(),
                api: saga.as_read_only(),
                ctx: ContextHandle::new(saga.clone()),
            };

            match compensate(ctx).await {
                Ok(result) => {
                    saga.end_compensating_task(step.name.clone(), result).await?;
                    self.emit(SagaEvent::CompensationSucceeded {
                        saga_id: saga_id.clone(),
                        task_id: step.name.clone(),
                    })
                    .await;
                }
                Err(e) => {
                    self.emit(SagaEvent::CompensationFailed {
                        saga_id: saga_id.clone(),
                        task_id: step.name.clone(),
                        reason: e.to_string(),
                    })
                    .await;
                    saga.end_compensating_task(step.name.clone(), serde_json::json!({ "error": e.to_string() }))
                        .await?;
                }
            }
        }

        Ok(())
    }
}

fn resume_index<Data>(state: &SagaState, def: &SagaDefinition<Data>) -> usize {
    def.steps
        .iter()
        .position(|step| !state.is_task_completed(&step.name))
        .unwrap_or(def.steps.len())
}

fn previous_output<Data>(state: &SagaState, def: &SagaDefinition<Data>, start_index: usize) -> Value {
    if start_index == 0 {
        state.job.clone()
    } else {
        state
            .end_task_data(&def.steps[start_index - 1].name)
            .cloned()
            .unwrap_or(Value::Null)
    }
}
