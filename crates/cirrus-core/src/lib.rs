//! Planning and execution engine for Cirrus.
//!
//! This crate turns a normalized desired spec into a validated
//! [`ResourceGraph`], resolves permission grants, diffs the graph against the
//! last committed [`Snapshot`](cirrus_store::Snapshot) into a level-ordered
//! [`Plan`], and drives the plan through provider adapters with the
//! [`Executor`]. [`Engine`] wraps the whole pipeline with state locking and
//! journal recovery.

pub mod concurrency;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod lifecycle;
pub mod permissions;
pub mod plan;
pub mod retry;
pub mod settings;

pub use concurrency::{install_signal_handler, shutdown_requested, LockHolder, StateLock};
pub use engine::{ApplyResult, Engine};
pub use executor::{ExecutionReport, Executor, RunOutcome, StepReport};
pub use graph::{Node, ResourceGraph, ValidationError};
pub use lifecycle::{validate_transition, StepState};
pub use permissions::resolve_grants;
pub use plan::{plan, plan_destroy, Action, Plan, PlanStep, PlanSummary, StepSubject};
pub use retry::RetryPolicy;
pub use settings::{EngineSettings, RetrySettings};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("manifest error: {0}")]
    Manifest(#[from] cirrus_schema::ManifestError),
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("state error: {0}")]
    Store(#[from] cirrus_store::StoreError),
    #[error("provider error: {0}")]
    Provider(#[from] cirrus_provider::ProviderError),
    #[error("invalid step transition for '{step}': {from} -> {to}")]
    InvalidTransition {
        step: String,
        from: StepState,
        to: StepState,
    },
    #[error("state directory is locked by another run: {0}")]
    StateLocked(String),
    #[error("settings error: {0}")]
    Settings(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
