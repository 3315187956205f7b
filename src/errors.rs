//! Typed error hierarchy for the FABER engine.
//!
//! Four top-level enums cover the four subsystems:
//! - `ConfigError` — configuration and custom-workflow compilation failures
//! - `RegistryError` — definition discovery and validation failures
//! - `ToolError` — tool execution failures (never fatal to the engine)
//! - `WorkflowError` — engine, phase, budget, and checkpoint failures

use thiserror::Error;

/// Errors from configuration loading and custom-workflow compilation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML in {path}: {message}")]
    InvalidYaml {
        path: std::path::PathBuf,
        message: String,
    },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Cannot resolve reference '{reference}' at {location}: {message}")]
    UnresolvedReference {
        reference: String,
        location: String,
        message: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the definition registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Agent '{name}' not found. Available agents: {available}")]
    AgentNotFound { name: String, available: String },

    #[error("Tool '{name}' not found. Available tools: {available}")]
    ToolNotFound { name: String, available: String },

    #[error("Invalid definition in {path}: {message}")]
    InvalidDefinition {
        path: std::path::PathBuf,
        message: String,
    },

    #[error("Empty YAML file: {path}")]
    EmptyFile { path: std::path::PathBuf },

    #[error("Failed to write definition to {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from tool execution. These are surfaced to the agent as tool-call
/// failures; they never terminate the workflow directly.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid parameters for tool '{tool}': {message}")]
    InvalidParameters { tool: String, message: String },

    #[error("Command '{command}' not in sandbox allowlist")]
    CommandNotAllowed { command: String },

    #[error("Empty command after template expansion")]
    EmptyCommand,

    #[error("Unbalanced quote in command template: {template}")]
    UnbalancedQuote { template: String },

    #[error("Tool '{tool}' timed out after {seconds}s")]
    Timeout { tool: String, seconds: u64 },

    #[error("Failed to spawn tool process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Module '{module}' is not in the function allowlist")]
    ModuleNotAllowed { module: String },

    #[error("Function '{module}.{function}' is not registered")]
    FunctionNotFound { module: String, function: String },

    #[error("Blocked URL {url}: {reason}")]
    BlockedUrl { url: String, reason: String },

    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("HTTP response too large: {size} bytes exceeds limit of {limit}")]
    ResponseTooLarge { size: u64, limit: u64 },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Tool '{tool}' failed: {message}")]
    ExecutionFailed { tool: String, message: String },
}

/// Errors from the workflow engine and its collaborators.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Budget exceeded: ${spent:.2} / ${limit:.2}")]
    BudgetExceeded { spent: f64, limit: f64 },

    #[error("Budget approval rejected at ${spent:.2} / ${limit:.2}")]
    BudgetRejected { spent: f64, limit: f64 },

    #[error("Approval {decision} for phase {phase}")]
    ApprovalDenied { phase: String, decision: String },

    #[error("Agent loop exceeded {max_iterations} iterations without a final reply")]
    AgentLoopExceeded { max_iterations: u32 },

    #[error("LLM provider error: {0}")]
    Provider(String),

    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("No checkpoint found for workflow {workflow_id}")]
    CheckpointNotFound { workflow_id: String },

    #[error("Workflow cancelled")]
    Cancelled,

    #[error("Phase {phase} failed: {message}")]
    PhaseFailed { phase: String, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
