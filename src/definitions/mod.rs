//! Declarative agent and tool definitions.
//!
//! Definitions live as YAML files under `.fractary/agents/` and
//! `.fractary/tools/` in a project root. The `schema` module defines the
//! validated record types; the `registry` module discovers, indexes, and
//! persists them.

pub mod registry;
pub mod schema;

pub use registry::DefinitionRegistry;
pub use schema::{
    AgentDefinition, CacheSource, CachingConfig, HttpMethod, LlmConfig, LlmProvider, ParamType,
    SandboxPolicy, ToolDefinition, ToolImplementation, ToolParameter,
};
