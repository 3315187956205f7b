//! Agent sessions: a declarative agent definition bound to a live LLM
//! client and executable tool handles, driven through a tool-use loop.

pub mod context;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::definitions::schema::{AgentDefinition, ToolDefinition};
use crate::definitions::DefinitionRegistry;
use crate::errors::{ToolError, WorkflowError};
use crate::llm::{
    ContentBlock, LlmClient, LlmFactory, LlmRequest, Message, ModelSelector, SystemBlock,
    TokenUsage, ToolSpec,
};
use crate::tools::ToolExecutor;

/// Receives usage from every LLM call in a session. The engine's budget
/// guard implements this to enforce thresholds after each call.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(
        &self,
        model: &str,
        usage: TokenUsage,
        phase: &str,
    ) -> Result<(), WorkflowError>;
}

/// Sink that ignores usage. Used where no budget applies.
pub struct NullUsageSink;

#[async_trait]
impl UsageSink for NullUsageSink {
    async fn record(
        &self,
        _model: &str,
        _usage: TokenUsage,
        _phase: &str,
    ) -> Result<(), WorkflowError> {
        Ok(())
    }
}

/// An executable tool bound into a session.
struct ToolHandle {
    spec: ToolSpec,
    definition: ToolDefinition,
}

/// Build the JSON Schema the model sees for a tool's parameters.
fn input_schema(definition: &ToolDefinition) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for (name, param) in &definition.parameters {
        let mut prop = Map::new();
        prop.insert(
            "type".to_string(),
            json!(match param.param_type {
                crate::definitions::schema::ParamType::String => "string",
                crate::definitions::schema::ParamType::Integer => "integer",
                crate::definitions::schema::ParamType::Number => "number",
                crate::definitions::schema::ParamType::Boolean => "boolean",
                crate::definitions::schema::ParamType::Object => "object",
                crate::definitions::schema::ParamType::Array => "array",
            }),
        );
        if !param.description.is_empty() {
            prop.insert("description".to_string(), json!(param.description));
        }
        if let Some(values) = &param.enum_values {
            prop.insert("enum".to_string(), json!(values));
        }
        properties.insert(name.clone(), Value::Object(prop));
        if param.required {
            required.push(name.clone());
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Outcome of a completed session run.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub final_text: String,
    pub iterations: u32,
    pub duration_ms: u64,
}

/// A live agent: system blocks, tool handles, and an LLM client, driven to
/// completion through the tool-use loop.
pub struct AgentSession {
    agent_name: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    max_iterations: u32,
    system: Vec<SystemBlock>,
    tools: Vec<ToolHandle>,
    client: Arc<dyn LlmClient>,
    executor: Arc<ToolExecutor>,
}

impl AgentSession {
    /// Construct a session from an agent definition.
    ///
    /// Tool names resolve through the registry; unknown names are warned
    /// about and skipped, matching definition-registry semantics elsewhere.
    /// Inline custom tools are bound directly. `model_override` replaces the
    /// definition's selector (per-phase model routing).
    pub fn build(
        agent_def: &AgentDefinition,
        project_root: &Path,
        registry: &DefinitionRegistry,
        executor: Arc<ToolExecutor>,
        llm_factory: &dyn LlmFactory,
        model_override: Option<&ModelSelector>,
        max_iterations: u32,
    ) -> Result<Self, WorkflowError> {
        let (provider, model) = match model_override {
            Some(selector) => (selector.provider, selector.model.clone()),
            None => (agent_def.llm.provider, agent_def.llm.model.clone()),
        };
        let client = llm_factory.create(provider)?;

        let mut system = vec![SystemBlock::text(agent_def.system_prompt.clone())];
        if let Some(caching) = &agent_def.caching {
            system.extend(context::build_cached_blocks(project_root, caching));
        }

        let mut tools = Vec::new();
        for tool_name in &agent_def.tools {
            match registry.get_tool(tool_name) {
                Some(definition) => tools.push(ToolHandle {
                    spec: ToolSpec {
                        name: definition.name.clone(),
                        description: definition.description.clone(),
                        input_schema: input_schema(&definition),
                    },
                    definition,
                }),
                None => warn!(
                    tool = %tool_name,
                    agent = %agent_def.name,
                    "Tool not found in registry; skipping"
                ),
            }
        }
        for definition in &agent_def.custom_tools {
            tools.push(ToolHandle {
                spec: ToolSpec {
                    name: definition.name.clone(),
                    description: definition.description.clone(),
                    input_schema: input_schema(definition),
                },
                definition: definition.clone(),
            });
        }

        Ok(Self {
            agent_name: agent_def.name.clone(),
            model,
            temperature: agent_def.llm.temperature,
            max_tokens: agent_def.llm.max_tokens,
            max_iterations,
            system,
            tools,
            client,
            executor,
        })
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Drive the tool-use loop to completion: call the model, execute any
    /// requested tools, feed the results back, and repeat until the model
    /// answers with plain text or the iteration cap is hit. Usage is
    /// recorded with the sink after every call, which is where budget
    /// enforcement interrupts the loop.
    pub async fn run(
        &self,
        task: &str,
        phase: &str,
        usage_sink: &dyn UsageSink,
    ) -> Result<SessionOutcome, WorkflowError> {
        let started = Instant::now();
        let mut messages = vec![Message::user_text(task)];

        for iteration in 0..self.max_iterations {
            let request = LlmRequest {
                model: self.model.clone(),
                system: self.system.clone(),
                messages: messages.clone(),
                tools: self.tools.iter().map(|t| t.spec.clone()).collect(),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            };

            let response = self.client.complete(&request).await?;
            usage_sink.record(&self.model, response.usage, phase).await?;

            let tool_uses: Vec<(String, String, Value)> = response
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();

            if tool_uses.is_empty() {
                return Ok(SessionOutcome {
                    final_text: response.text(),
                    iterations: iteration + 1,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }

            messages.push(Message::assistant(response.content));

            // Multiple tool uses in one assistant turn execute concurrently;
            // their results are joined before the next call.
            let executions = tool_uses.iter().map(|(id, name, input)| {
                let id = id.clone();
                async move {
                    let result = self.execute_tool(name, input, phase).await;
                    match result {
                        Ok(value) => ContentBlock::ToolResult {
                            tool_use_id: id,
                            content: value.to_string(),
                            is_error: None,
                        },
                        Err(e) => ContentBlock::ToolResult {
                            tool_use_id: id,
                            content: e.to_string(),
                            is_error: Some(true),
                        },
                    }
                }
            });
            let results = join_all(executions).await;
            messages.push(Message::tool_results(results));
        }

        Err(WorkflowError::AgentLoopExceeded {
            max_iterations: self.max_iterations,
        })
    }

    async fn execute_tool(
        &self,
        name: &str,
        input: &Value,
        phase: &str,
    ) -> Result<Value, ToolError> {
        let handle = self
            .tools
            .iter()
            .find(|t| t.definition.name == name)
            .ok_or_else(|| ToolError::ExecutionFailed {
                tool: name.to_string(),
                message: "tool is not bound to this agent".to_string(),
            })?;

        let params = match input {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(ToolError::InvalidParameters {
                    tool: name.to_string(),
                    message: format!("tool input must be an object, got {}", other),
                });
            }
        };

        debug!(tool = name, phase = phase, "Executing tool call");
        self.executor.execute(&handle.definition, &params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::schema::{
        LlmConfig, LlmProvider, ParamType, SandboxPolicy, ToolImplementation, ToolParameter,
    };
    use crate::llm::mock::{MockFactory, MockLlm};
    use crate::llm::StopReason;
    use crate::tools::FunctionRegistry;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn echo_tool() -> ToolDefinition {
        let mut parameters = BTreeMap::new();
        parameters.insert(
            "message".to_string(),
            ToolParameter {
                param_type: ParamType::String,
                description: "text".to_string(),
                required: true,
                default: None,
                enum_values: None,
            },
        );
        ToolDefinition {
            name: "echo".to_string(),
            description: "Echo a message".to_string(),
            parameters,
            tags: Vec::new(),
            implementation: ToolImplementation::Shell {
                command: "echo ${message}".to_string(),
                sandbox: SandboxPolicy {
                    enabled: false,
                    ..Default::default()
                },
            },
        }
    }

    fn agent_with_tools(custom_tools: Vec<ToolDefinition>) -> AgentDefinition {
        AgentDefinition {
            name: "test-agent".to_string(),
            description: "test".to_string(),
            llm: LlmConfig {
                provider: LlmProvider::Anthropic,
                model: "mock-model".to_string(),
                temperature: 0.0,
                max_tokens: 1024,
            },
            system_prompt: "You are a test agent.".to_string(),
            tools: Vec::new(),
            tags: Vec::new(),
            config: BTreeMap::new(),
            caching: None,
            custom_tools,
        }
    }

    fn build_session(
        agent: &AgentDefinition,
        mock: Arc<MockLlm>,
        root: &Path,
    ) -> AgentSession {
        let registry = DefinitionRegistry::new(root);
        let executor = Arc::new(ToolExecutor::new(Arc::new(FunctionRegistry::new())));
        AgentSession::build(
            agent,
            root,
            &registry,
            executor,
            &MockFactory::new(mock),
            None,
            10,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_plain_reply_completes_in_one_iteration() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockLlm::new());
        mock.push_text("All done here.");

        let agent = agent_with_tools(vec![]);
        let session = build_session(&agent, Arc::clone(&mock), dir.path());

        let outcome = session
            .run("Do the thing", "frame", &NullUsageSink)
            .await
            .unwrap();
        assert_eq!(outcome.final_text, "All done here.");
        assert_eq!(outcome.iterations, 1);
    }

    #[tokio::test]
    async fn test_tool_use_loop_feeds_results_back() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockLlm::new());
        mock.push_tool_use("tu_1", "echo", json!({"message": "ping"}));
        mock.push_text("The tool said ping.");

        let agent = agent_with_tools(vec![echo_tool()]);
        let session = build_session(&agent, Arc::clone(&mock), dir.path());

        let outcome = session
            .run("Use the echo tool", "build", &NullUsageSink)
            .await
            .unwrap();
        assert_eq!(outcome.final_text, "The tool said ping.");
        assert_eq!(outcome.iterations, 2);

        // The second request carries the assistant turn and the tool result.
        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        let followup = &requests[1];
        assert_eq!(followup.messages.len(), 3);
        match &followup.messages[2].content[0] {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, "tu_1");
                assert!(content.contains("ping"));
                assert!(is_error.is_none());
            }
            other => panic!("Expected tool result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tool_failure_is_surfaced_not_fatal() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockLlm::new());
        // The agent calls an unbound tool, then concludes.
        mock.push_tool_use("tu_1", "nonexistent", json!({}));
        mock.push_text("Could not use the tool.");

        let agent = agent_with_tools(vec![]);
        let session = build_session(&agent, Arc::clone(&mock), dir.path());

        let outcome = session
            .run("Try a tool", "build", &NullUsageSink)
            .await
            .unwrap();
        assert_eq!(outcome.final_text, "Could not use the tool.");

        let followup = &mock.requests()[1];
        match &followup.messages[2].content[0] {
            ContentBlock::ToolResult { is_error, .. } => assert_eq!(*is_error, Some(true)),
            other => panic!("Expected tool result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_iteration_cap() {
        let dir = tempdir().unwrap();
        // Always requests another tool call; the loop must bail at the cap.
        let mock = Arc::new(MockLlm::with_handler(|_| crate::llm::LlmResponse {
            content: vec![ContentBlock::ToolUse {
                id: "tu".to_string(),
                name: "echo".to_string(),
                input: json!({"message": "again"}),
            }],
            usage: TokenUsage::default(),
            stop_reason: StopReason::ToolUse,
        }));

        let agent = agent_with_tools(vec![echo_tool()]);
        let session = build_session(&agent, mock, dir.path());

        let err = session
            .run("Loop forever", "build", &NullUsageSink)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::AgentLoopExceeded { max_iterations: 10 }
        ));
    }

    #[tokio::test]
    async fn test_system_blocks_include_prompt_and_cache() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("standards.md"), "Always test.").unwrap();

        let mut agent = agent_with_tools(vec![]);
        agent.caching = Some(crate::definitions::schema::CachingConfig {
            enabled: true,
            cache_sources: vec![crate::definitions::schema::CacheSource::File {
                path: "standards.md".to_string(),
                label: "Standards".to_string(),
            }],
        });

        let mock = Arc::new(MockLlm::new());
        let session = build_session(&agent, Arc::clone(&mock), dir.path());
        session.run("go", "frame", &NullUsageSink).await.unwrap();

        let request = &mock.requests()[0];
        assert_eq!(request.system.len(), 2);
        assert!(!request.system[0].cached);
        assert!(request.system[1].cached);
        assert!(request.system[1].text.contains("Always test."));
    }

    #[test]
    fn test_input_schema_shape() {
        let schema = input_schema(&echo_tool());
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["message"]["type"], "string");
        assert_eq!(schema["required"][0], "message");
    }
}
