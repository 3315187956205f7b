//! FABER: a multi-phase AI workflow engine.
//!
//! Drives a work item through the Frame, Architect, Build, Evaluate,
//! Release pipeline: each phase runs an LLM agent with declarative tools,
//! gated by human approval where configured, checkpointed for resumption,
//! and bounded by a token-cost budget.

pub mod agent;
pub mod api;
pub mod approval;
pub mod checkpoint;
pub mod config;
pub mod cost;
pub mod definitions;
pub mod errors;
pub mod llm;
pub mod logs;
pub mod tools;
pub mod util;
pub mod workflow;

pub use api::{
    list_workflows, resume_workflow, run_workflow, view_workflow, WorkflowOptions, WorkflowResult,
    WorkflowSummary,
};
pub use errors::{ConfigError, RegistryError, ToolError, WorkflowError};
