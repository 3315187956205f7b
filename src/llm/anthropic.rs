//! Anthropic Messages API client.
//!
//! Supports prompt caching: system blocks flagged as cache-eligible are
//! sent with an ephemeral `cache_control` marker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::WorkflowError;

use super::{
    ContentBlock, LlmClient, LlmRequest, LlmResponse, MessageRole, StopReason, TokenUsage,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    control_type: &'static str,
}

#[derive(Serialize)]
struct SystemContentBlock<'a> {
    #[serde(rename = "type")]
    block_type: &'static str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: Vec<WireBlock<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock<'a> {
    Text {
        text: &'a str,
    },
    ToolUse {
        id: &'a str,
        name: &'a str,
        input: &'a serde_json::Value,
    },
    ToolResult {
        tool_use_id: &'a str,
        content: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Serialize)]
struct WireTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a serde_json::Value,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    system: Vec<SystemContentBlock<'a>>,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

#[derive(Deserialize)]
struct WireResponse {
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct WireUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Deserialize)]
struct WireError {
    error: WireErrorBody,
}

#[derive(Deserialize)]
struct WireErrorBody {
    message: String,
}

fn to_wire_message(message: &super::Message) -> WireMessage<'_> {
    let role = match message.role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    };
    let content = message
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => WireBlock::Text { text },
            ContentBlock::ToolUse { id, name, input } => WireBlock::ToolUse { id, name, input },
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => WireBlock::ToolResult {
                tool_use_id,
                content,
                is_error: *is_error,
            },
        })
        .collect();
    WireMessage { role, content }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, WorkflowError> {
        let system = request
            .system
            .iter()
            .map(|block| SystemContentBlock {
                block_type: "text",
                text: &block.text,
                cache_control: block.cached.then_some(CacheControl {
                    control_type: "ephemeral",
                }),
            })
            .collect();

        let wire = WireRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system,
            messages: request.messages.iter().map(to_wire_message).collect(),
            tools: request
                .tools
                .iter()
                .map(|t| WireTool {
                    name: &t.name,
                    description: &t.description,
                    input_schema: &t.input_schema,
                })
                .collect(),
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .timeout(REQUEST_TIMEOUT)
            .json(&wire)
            .send()
            .await
            .map_err(|e| WorkflowError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response
                .json::<WireError>()
                .await
                .map(|e| e.error.message)
                .unwrap_or_else(|_| status.to_string());
            return Err(WorkflowError::Provider(format!(
                "Anthropic API error ({}): {}",
                status, message
            )));
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| WorkflowError::Provider(e.to_string()))?;

        let content = wire
            .content
            .into_iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(ContentBlock::Text { text }),
                ResponseBlock::ToolUse { id, name, input } => {
                    Some(ContentBlock::ToolUse { id, name, input })
                }
                ResponseBlock::Unknown => None,
            })
            .collect();

        let stop_reason = match wire.stop_reason.as_deref() {
            Some("end_turn") => StopReason::EndTurn,
            Some("tool_use") => StopReason::ToolUse,
            Some("max_tokens") => StopReason::MaxTokens,
            _ => StopReason::Other,
        };

        Ok(LlmResponse {
            content,
            usage: TokenUsage {
                input_tokens: wire.usage.input_tokens,
                output_tokens: wire.usage.output_tokens,
            },
            stop_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Message, SystemBlock, ToolSpec};

    fn sample_request() -> LlmRequest {
        LlmRequest {
            model: "claude-sonnet-4-20250514".to_string(),
            system: vec![
                SystemBlock::text("You are an agent."),
                SystemBlock::cached_text("## Standards\n\nLots of standards."),
            ],
            messages: vec![Message::user_text("Frame work item #42")],
            tools: vec![ToolSpec {
                name: "fetch_issue".to_string(),
                description: "Fetch an issue".to_string(),
                input_schema: serde_json::json!({"type": "object", "properties": {}}),
            }],
            temperature: 0.2,
            max_tokens: 4096,
        }
    }

    #[test]
    fn test_cache_control_only_on_cached_blocks() {
        let request = sample_request();
        let system: Vec<SystemContentBlock> = request
            .system
            .iter()
            .map(|block| SystemContentBlock {
                block_type: "text",
                text: &block.text,
                cache_control: block.cached.then_some(CacheControl {
                    control_type: "ephemeral",
                }),
            })
            .collect();

        let json = serde_json::to_value(&system).unwrap();
        assert!(json[0].get("cache_control").is_none());
        assert_eq!(json[1]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn test_wire_request_shape() {
        let request = sample_request();
        let wire = WireRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: Vec::new(),
            messages: request.messages.iter().map(to_wire_message).collect(),
            tools: request
                .tools
                .iter()
                .map(|t| WireTool {
                    name: &t.name,
                    description: &t.description,
                    input_schema: &t.input_schema,
                })
                .collect(),
        };

        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["model"], "claude-sonnet-4-20250514");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"][0]["type"], "text");
        assert_eq!(json["tools"][0]["name"], "fetch_issue");
    }

    #[test]
    fn test_response_parsing() {
        let body = r#"{
            "content": [
                {"type": "text", "text": "Using a tool"},
                {"type": "tool_use", "id": "tu_1", "name": "fetch_issue", "input": {"id": "42"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 120, "output_tokens": 45}
        }"#;
        let wire: WireResponse = serde_json::from_str(body).unwrap();
        assert_eq!(wire.usage.input_tokens, 120);
        assert_eq!(wire.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(wire.content.len(), 2);
    }

    #[test]
    fn test_tool_result_wire_shape() {
        let message = Message::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: "tu_1".to_string(),
            content: "{\"ok\":true}".to_string(),
            is_error: Some(false),
        }]);
        let json = serde_json::to_value(to_wire_message(&message)).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "tool_result");
        assert_eq!(json["content"][0]["tool_use_id"], "tu_1");
    }
}
