//! The workflow engine and its collaborators.
//!
//! - `state` — the runtime state record threaded through phases
//! - `graph` — the phase graph and custom-document compiler
//! - `schema` — the custom workflow YAML schema
//! - `runner` — per-phase execution against agent sessions
//! - `engine` — the state machine tying it all together

pub mod engine;
pub mod graph;
pub mod runner;
pub mod schema;
pub mod state;

pub use engine::{BudgetGuard, EngineOutcome, WorkflowEngine};
pub use graph::{CompiledPhase, PhaseGraph, RetryPolicy};
pub use runner::PhaseRunner;
pub use state::{
    create_initial_state, new_workflow_id, Evaluation, Phase, PhaseResult, PhaseStatus,
    WorkflowState,
};
