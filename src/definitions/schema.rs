//! Schema types for YAML agent and tool definitions.
//!
//! Each type carries a `validate` method returning field-path-qualified
//! problems ("llm.temperature: must be within 0..=1") so the registry can
//! report precise errors alongside the offending file path.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Supported LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Anthropic,
    Openai,
    Google,
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProvider::Anthropic => write!(f, "anthropic"),
            LlmProvider::Openai => write!(f, "openai"),
            LlmProvider::Google => write!(f, "google"),
        }
    }
}

impl std::str::FromStr for LlmProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" => Ok(LlmProvider::Anthropic),
            "openai" => Ok(LlmProvider::Openai),
            "google" => Ok(LlmProvider::Google),
            _ => anyhow::bail!(
                "Unsupported LLM provider '{}'. Valid values: anthropic, openai, google",
                s
            ),
        }
    }
}

/// LLM selector for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: String,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    4096
}

impl LlmConfig {
    /// The `provider:model` selector string.
    pub fn selector(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.model.trim().is_empty() {
            errors.push("llm.model: model must not be empty".to_string());
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            errors.push(format!(
                "llm.temperature: must be within 0..=1, got {}",
                self.temperature
            ));
        }
        if self.max_tokens == 0 || self.max_tokens > 200_000 {
            errors.push(format!(
                "llm.max_tokens: must be within 1..=200000, got {}",
                self.max_tokens
            ));
        }
    }
}

/// A content source eligible for provider-side prompt caching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheSource {
    /// A single file, read relative to the project root.
    File { path: String, label: String },
    /// All files matching a glob pattern, concatenated.
    Glob { pattern: String, label: String },
    /// Literal text.
    Inline { content: String, label: String },
    /// External codex document. The provider hook is unconfigured; sources
    /// of this kind are warned about and skipped at load time.
    Codex { uri: String, label: String },
}

impl CacheSource {
    fn validate(&self, index: usize, errors: &mut Vec<String>) {
        match self {
            CacheSource::File { path, .. } => {
                if path.trim().is_empty() {
                    errors.push(format!(
                        "caching.cache_sources[{}].path: path is required for file sources",
                        index
                    ));
                }
            }
            CacheSource::Glob { pattern, .. } => {
                if pattern.trim().is_empty() {
                    errors.push(format!(
                        "caching.cache_sources[{}].pattern: pattern is required for glob sources",
                        index
                    ));
                }
            }
            CacheSource::Inline { content, .. } => {
                if content.trim().is_empty() {
                    errors.push(format!(
                        "caching.cache_sources[{}].content: content is required for inline sources",
                        index
                    ));
                }
            }
            CacheSource::Codex { uri, .. } => {
                if !uri.starts_with("codex://") {
                    errors.push(format!(
                        "caching.cache_sources[{}].uri: must start with codex://, got '{}'",
                        index, uri
                    ));
                }
            }
        }
    }
}

/// Prompt-caching configuration for an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cache_sources: Vec<CacheSource>,
}

/// A declarative agent: system prompt, LLM selector, and tool bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    pub description: String,
    pub llm: LlmConfig,
    pub system_prompt: String,
    /// Tool names resolved through the registry (built-in or custom).
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form agent metadata.
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caching: Option<CachingConfig>,
    /// Inline tool definitions scoped to this agent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_tools: Vec<ToolDefinition>,
}

impl AgentDefinition {
    /// Validate the definition, returning field-path-qualified problems.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name: name must not be empty".to_string());
        }
        self.llm.validate(&mut errors);
        if let Some(caching) = &self.caching {
            for (i, source) in caching.cache_sources.iter().enumerate() {
                source.validate(i, &mut errors);
            }
        }
        for tool in &self.custom_tools {
            for err in tool.validate() {
                errors.push(format!("custom_tools.{}.{}", tool.name, err));
            }
        }

        errors
    }
}

/// Parameter types accepted by tool definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    /// Check a JSON value against this parameter type.
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
        }
    }
}

/// A typed tool parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Enumerated allowed values, when restricted.
    #[serde(
        rename = "enum",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub enum_values: Option<Vec<serde_json::Value>>,
}

/// Sandbox policy for the shell tool variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxPolicy {
    #[serde(default = "default_sandbox_enabled")]
    pub enabled: bool,
    /// Executable basenames allowed to run. Empty means allow any.
    #[serde(default)]
    pub allowlisted_commands: Vec<String>,
    /// Environment variables forwarded into the child. All others are
    /// discarded.
    #[serde(default)]
    pub allowed_env_vars: Vec<String>,
    /// Wall-clock limit in seconds; the child is killed and reaped on expiry.
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time: u64,
    /// Per-stream output cap in bytes.
    #[serde(default = "default_max_output_size")]
    pub max_output_size: usize,
}

fn default_sandbox_enabled() -> bool {
    true
}

fn default_max_execution_time() -> u64 {
    120
}

fn default_max_output_size() -> usize {
    1024 * 1024
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            enabled: default_sandbox_enabled(),
            allowlisted_commands: Vec::new(),
            allowed_env_vars: Vec::new(),
            max_execution_time: default_max_execution_time(),
            max_output_size: default_max_output_size(),
        }
    }
}

/// HTTP methods accepted by the http tool variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    GET,
    POST,
    PUT,
    DELETE,
}

/// Tool implementation variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolImplementation {
    /// A command template executed by direct process spawn (no shell).
    /// `${param}` placeholders are substituted after tokenization.
    Shell {
        command: String,
        #[serde(default)]
        sandbox: SandboxPolicy,
    },
    /// An in-process function resolved through the trusted registry.
    Function {
        module: String,
        function: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
    },
    /// An outbound HTTP call with templated URL, headers, and body.
    Http {
        method: HttpMethod,
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
}

/// A declarative tool: typed parameters plus one implementation variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, ToolParameter>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub implementation: ToolImplementation,
}

impl ToolDefinition {
    /// Validate the definition, returning field-path-qualified problems.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name: name must not be empty".to_string());
        } else if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
        {
            errors.push(format!(
                "name: '{}' may only contain alphanumerics, '-', '_', ':'",
                self.name
            ));
        }

        for (param_name, param) in &self.parameters {
            if let (Some(default), false) = (&param.default, param.required) {
                if !param.param_type.matches(default) {
                    errors.push(format!(
                        "parameters.{}.default: does not match declared type",
                        param_name
                    ));
                }
            }
        }

        match &self.implementation {
            ToolImplementation::Shell { command, sandbox } => {
                if command.trim().is_empty() {
                    errors.push("implementation.command: command is required".to_string());
                }
                if sandbox.max_execution_time == 0 {
                    errors.push(
                        "implementation.sandbox.max_execution_time: must be >= 1".to_string(),
                    );
                }
            }
            ToolImplementation::Function {
                module, function, ..
            } => {
                if module.trim().is_empty() {
                    errors.push("implementation.module: module is required".to_string());
                }
                if function.trim().is_empty() {
                    errors.push("implementation.function: function is required".to_string());
                }
            }
            ToolImplementation::Http { url, .. } => {
                if url.trim().is_empty() {
                    errors.push("implementation.url: url is required".to_string());
                }
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_agent() -> AgentDefinition {
        AgentDefinition {
            name: "test-agent".to_string(),
            description: "Test agent".to_string(),
            llm: LlmConfig {
                provider: LlmProvider::Anthropic,
                model: "claude-sonnet-4-20250514".to_string(),
                temperature: 0.5,
                max_tokens: 2048,
            },
            system_prompt: "You are a test agent.".to_string(),
            tools: Vec::new(),
            tags: Vec::new(),
            config: BTreeMap::new(),
            caching: None,
            custom_tools: Vec::new(),
        }
    }

    fn echo_tool() -> ToolDefinition {
        let mut parameters = BTreeMap::new();
        parameters.insert(
            "message".to_string(),
            ToolParameter {
                param_type: ParamType::String,
                description: "Message to echo".to_string(),
                required: true,
                default: None,
                enum_values: None,
            },
        );
        ToolDefinition {
            name: "test-echo".to_string(),
            description: "Echo test".to_string(),
            parameters,
            tags: Vec::new(),
            implementation: ToolImplementation::Shell {
                command: "echo ${message}".to_string(),
                sandbox: SandboxPolicy {
                    allowlisted_commands: vec!["echo".to_string()],
                    ..Default::default()
                },
            },
        }
    }

    #[test]
    fn test_minimal_agent_is_valid() {
        let agent = minimal_agent();
        assert!(agent.validate().is_empty());
        assert!(agent.tools.is_empty());
        assert!(agent.caching.is_none());
    }

    #[test]
    fn test_empty_model_name_fails() {
        let mut agent = minimal_agent();
        agent.llm.model = String::new();
        let errors = agent.validate();
        assert!(errors.iter().any(|e| e.contains("llm.model")));
    }

    #[test]
    fn test_temperature_bounds() {
        let mut agent = minimal_agent();
        agent.llm.temperature = 0.0;
        assert!(agent.validate().is_empty());
        agent.llm.temperature = 1.0;
        assert!(agent.validate().is_empty());

        agent.llm.temperature = -0.1;
        assert!(!agent.validate().is_empty());
        agent.llm.temperature = 1.1;
        assert!(!agent.validate().is_empty());
    }

    #[test]
    fn test_max_tokens_bounds() {
        let mut agent = minimal_agent();
        agent.llm.max_tokens = 0;
        assert!(agent
            .validate()
            .iter()
            .any(|e| e.contains("llm.max_tokens")));
        agent.llm.max_tokens = 200_001;
        assert!(!agent.validate().is_empty());
        agent.llm.max_tokens = 200_000;
        assert!(agent.validate().is_empty());
    }

    #[test]
    fn test_cache_source_validation() {
        let mut agent = minimal_agent();
        agent.caching = Some(CachingConfig {
            enabled: true,
            cache_sources: vec![
                CacheSource::File {
                    path: ".fractary/docs/STANDARDS.md".to_string(),
                    label: "Standards".to_string(),
                },
                CacheSource::Codex {
                    uri: "http://example.com/doc".to_string(),
                    label: "Bad".to_string(),
                },
            ],
        });

        let errors = agent.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("must start with codex://"));
        assert!(errors[0].contains("cache_sources[1]"));
    }

    #[test]
    fn test_shell_tool_is_valid() {
        let tool = echo_tool();
        assert!(tool.validate().is_empty());
        match &tool.implementation {
            ToolImplementation::Shell { command, .. } => {
                assert_eq!(command, "echo ${message}");
            }
            _ => panic!("Expected shell implementation"),
        }
    }

    #[test]
    fn test_shell_tool_empty_command_fails() {
        let mut tool = echo_tool();
        tool.implementation = ToolImplementation::Shell {
            command: String::new(),
            sandbox: SandboxPolicy::default(),
        };
        let errors = tool.validate();
        assert!(errors.iter().any(|e| e.contains("command is required")));
    }

    #[test]
    fn test_tool_name_charset() {
        let mut tool = echo_tool();
        tool.name = "repo:create_branch".to_string();
        assert!(tool.validate().is_empty());

        tool.name = "bad name!".to_string();
        assert!(!tool.validate().is_empty());
    }

    #[test]
    fn test_function_tool_requires_module_and_function() {
        let mut tool = echo_tool();
        tool.implementation = ToolImplementation::Function {
            module: String::new(),
            function: "run".to_string(),
            timeout_seconds: None,
        };
        let errors = tool.validate();
        assert!(errors.iter().any(|e| e.contains("module is required")));
    }

    #[test]
    fn test_param_default_type_mismatch() {
        let mut tool = echo_tool();
        tool.parameters.insert(
            "count".to_string(),
            ToolParameter {
                param_type: ParamType::Integer,
                description: String::new(),
                required: false,
                default: Some(json!("three")),
                enum_values: None,
            },
        );
        let errors = tool.validate();
        assert!(errors
            .iter()
            .any(|e| e.contains("parameters.count.default")));
    }

    #[test]
    fn test_yaml_roundtrip_tool() {
        let yaml = r#"
name: deploy
description: Deploy a target
parameters:
  environment:
    type: string
    description: Target environment
    required: true
    enum: [test, staging, prod]
  auto_approve:
    type: boolean
    default: false
implementation:
  type: shell
  command: deploy --env ${environment}
  sandbox:
    enabled: true
    allowlisted_commands: [deploy]
    max_execution_time: 300
"#;
        let tool: ToolDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(tool.validate().is_empty());
        assert_eq!(
            tool.parameters.get("environment").unwrap().enum_values,
            Some(vec![json!("test"), json!("staging"), json!("prod")])
        );

        let dumped = serde_yaml::to_string(&tool).unwrap();
        let reparsed: ToolDefinition = serde_yaml::from_str(&dumped).unwrap();
        assert_eq!(tool, reparsed);
    }

    #[test]
    fn test_yaml_roundtrip_agent() {
        let yaml = r#"
name: cached-agent
description: Agent with caching
llm:
  provider: anthropic
  model: claude-sonnet-4-20250514
  temperature: 0.2
system_prompt: You are a cached agent.
tools: [fetch_issue]
tags: [pipeline]
caching:
  enabled: true
  cache_sources:
    - type: file
      path: .fractary/docs/STANDARDS.md
      label: Standards
    - type: inline
      content: Some conventions
      label: Conventions
"#;
        let agent: AgentDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(agent.validate().is_empty());
        assert_eq!(agent.llm.max_tokens, 4096);
        assert_eq!(agent.caching.as_ref().unwrap().cache_sources.len(), 2);

        let dumped = serde_yaml::to_string(&agent).unwrap();
        let reparsed: AgentDefinition = serde_yaml::from_str(&dumped).unwrap();
        assert_eq!(agent, reparsed);
    }

    #[test]
    fn test_http_implementation_parses() {
        let yaml = r#"
name: notify
description: Post a notification
implementation:
  type: http
  method: POST
  url: https://hooks.example.com/notify
  headers:
    Content-Type: application/json
  body: '{"text": "${message}"}'
"#;
        let tool: ToolDefinition = serde_yaml::from_str(yaml).unwrap();
        match &tool.implementation {
            ToolImplementation::Http { method, url, .. } => {
                assert_eq!(*method, HttpMethod::POST);
                assert!(url.starts_with("https://"));
            }
            _ => panic!("Expected http implementation"),
        }
    }

    #[test]
    fn test_llm_selector_format() {
        let agent = minimal_agent();
        assert_eq!(agent.llm.selector(), "anthropic:claude-sonnet-4-20250514");
    }
}
