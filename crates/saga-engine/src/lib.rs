//! Durable distributed-saga orchestration engine.
//!
//! An application decomposes a long-running workflow into an ordered
//! sequence of local steps, each with a compensating action; this crate
//! guarantees forward progress or consistent rollback across process
//! restarts. Three subsystems make that guarantee:
//!
//! - [`log`] — an append-only, per-saga message journal: the single
//!   source of truth.
//! - [`state`] — a pure, derived in-memory projection of that journal,
//!   with transition validation.
//! - [`orchestrator`] — drives a [`orchestrator::SagaDefinition`] against
//!   a [`saga::Saga`] handle: normal execution, crash recovery, and
//!   compensation, including hierarchical parent/child sagas via
//!   [`coordinator::Coordinator`].
//!
//! Non-goals: no distributed two-phase commit across heterogeneous
//! resources, no exactly-once side effects, no multi-node scheduling
//! with leader election, no built-in authorization. This is an embedded
//! library — it installs no `tracing` subscriber and reads no
//! environment variables; the embedding application owns both.
//!
//! # Example
//!
//! ```rust,no_run
//! use saga_engine::{log::memory::InMemorySagaLog, saga::{Saga, DEFAULT_MAILBOX_TIMEOUT}};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let log = Arc::new(InMemorySagaLog::new());
//! let saga = Saga::create(log, "order-42", serde_json::json!({"amount": 10}), None, DEFAULT_MAILBOX_TIMEOUT).await?;
//!
//! saga.start_task("reserve", serde_json::Value::Null, false).await?;
//! saga.end_task("reserve", serde_json::json!({"ok": true})).await?;
//! saga.end_saga(serde_json::Value::Null).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - `message`: the log's atomic unit, `SagaMessage`.
//! - `state`: the pure state projection and transition validator.
//! - `log`: the `SagaLog` storage contract, plus in-memory and
//!   (behind `postgres`) document-store backends.
//! - `saga`: the mailbox-actor handle that owns one saga's live state.
//! - `coordinator`: hierarchy-aware abort/delete and recover-or-create.
//! - `recovery`: rebuilds state from the log at process start.
//! - `orchestrator`: drives a saga definition's steps to completion.
//! - `config`: `SagaEngineConfig` for backend, mailbox, and recovery
//!   defaults.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod log;
pub mod message;
pub mod orchestrator;
pub mod recovery;
pub mod saga;
pub mod state;

pub use config::SagaEngineConfig;
pub use error::{Result, SagaEngineError};
pub use log::SagaLog;
pub use message::{MessageType, SagaMessage};
pub use saga::{Saga, SagaReadOnly};
pub use state::SagaState;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::SagaEngineConfig;
    pub use crate::coordinator::Coordinator;
    pub use crate::error::{Result, SagaEngineError};
    pub use crate::log::{SagaLog, SagaRecord};
    pub use crate::message::{MessageType, SagaMessage};
    pub use crate::orchestrator::{
        CompensationContext, ContextHandle, Orchestrator, SagaDefinition, SagaDefinitionBuilder, SagaEvent,
        SagaEventSubscriber, Step, TaskContext,
    };
    pub use crate::recovery::RecoveryStrategy;
    pub use crate::saga::{Saga, SagaReadOnly};
    pub use crate::state::{SagaState, TaskStatus};

    #[cfg(feature = "memory")]
    pub use crate::log::memory::InMemorySagaLog;

    #[cfg(feature = "postgres")]
    pub use crate::log::document::DocumentSagaLog;
}

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the version string.
pub fn version() -> &'static str {
    VERSION
}
