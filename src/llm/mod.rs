//! LLM provider abstraction.
//!
//! The engine treats providers as black-box endpoints returning text and
//! tool-use requests. Conversations are expressed in a shared block model
//! (text, tool_use, tool_result); each provider client maps it onto its
//! wire format. System blocks may be marked cache-eligible; providers
//! without prompt caching send them as ordinary system text.

pub mod anthropic;
pub mod google;
pub mod mock;
pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::definitions::schema::LlmProvider;
use crate::errors::WorkflowError;

pub use mock::MockLlm;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Content block in a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// A message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user_text(text: &str) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
        }
    }

    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self {
            role: MessageRole::User,
            content: results,
        }
    }
}

/// A system prompt block, optionally eligible for provider-side caching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemBlock {
    pub text: String,
    pub cached: bool,
}

impl SystemBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cached: false,
        }
    }

    pub fn cached_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cached: true,
        }
    }
}

/// A tool made available to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool input.
    pub input_schema: serde_json::Value,
}

/// Token usage for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other,
}

/// A single completion request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub system: Vec<SystemBlock>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// A single completion response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: Vec<ContentBlock>,
    pub usage: TokenUsage,
    pub stop_reason: StopReason,
}

impl LlmResponse {
    /// Tool-use requests in this response, if any.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }

    /// Concatenated text content of this response.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A provider client.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, WorkflowError>;
}

/// Parsed `provider:model` selector.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSelector {
    pub provider: LlmProvider,
    pub model: String,
}

impl std::str::FromStr for ModelSelector {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (provider, model) = s.split_once(':').ok_or_else(|| {
            WorkflowError::Provider(format!(
                "model selector must be 'provider:model', got '{}'",
                s
            ))
        })?;
        let provider: LlmProvider = provider
            .parse()
            .map_err(|e: anyhow::Error| WorkflowError::Provider(e.to_string()))?;
        if model.is_empty() {
            return Err(WorkflowError::Provider(format!(
                "model selector '{}' is missing a model name",
                s
            )));
        }
        Ok(Self {
            provider,
            model: model.to_string(),
        })
    }
}

/// Creates provider clients for model selectors.
pub trait LlmFactory: Send + Sync {
    fn create(&self, provider: LlmProvider) -> Result<Arc<dyn LlmClient>, WorkflowError>;
}

/// Factory backed by the real provider APIs, with keys read from each
/// provider's standard environment variable.
#[derive(Default)]
pub struct ProviderFactory;

impl LlmFactory for ProviderFactory {
    fn create(&self, provider: LlmProvider) -> Result<Arc<dyn LlmClient>, WorkflowError> {
        let env_var = match provider {
            LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
            LlmProvider::Openai => "OPENAI_API_KEY",
            LlmProvider::Google => "GOOGLE_API_KEY",
        };
        let api_key = std::env::var(env_var).map_err(|_| {
            WorkflowError::Provider(format!(
                "{} is not set; required for provider '{}'",
                env_var, provider
            ))
        })?;

        Ok(match provider {
            LlmProvider::Anthropic => Arc::new(anthropic::AnthropicClient::new(api_key)),
            LlmProvider::Openai => Arc::new(openai::OpenAiClient::new(api_key)),
            LlmProvider::Google => Arc::new(google::GoogleClient::new(api_key)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_selector_parse() {
        let selector: ModelSelector = "anthropic:claude-sonnet-4-20250514".parse().unwrap();
        assert_eq!(selector.provider, LlmProvider::Anthropic);
        assert_eq!(selector.model, "claude-sonnet-4-20250514");
    }

    #[test]
    fn test_model_selector_requires_colon() {
        assert!("gpt-4o".parse::<ModelSelector>().is_err());
        assert!("openai:".parse::<ModelSelector>().is_err());
        assert!("unknown:model".parse::<ModelSelector>().is_err());
    }

    #[test]
    fn test_response_tool_uses() {
        let response = LlmResponse {
            content: vec![
                ContentBlock::Text {
                    text: "Running the tool".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "tu_1".to_string(),
                    name: "fetch_issue".to_string(),
                    input: serde_json::json!({"id": "42"}),
                },
            ],
            usage: TokenUsage::default(),
            stop_reason: StopReason::ToolUse,
        };

        let uses = response.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].1, "fetch_issue");
        assert_eq!(response.text(), "Running the tool");
    }

    #[test]
    fn test_content_block_serde_tagging() {
        let block = ContentBlock::ToolResult {
            tool_use_id: "tu_1".to_string(),
            content: "{\"ok\":true}".to_string(),
            is_error: None,
        };
        let json = serde_json::to_string(&block).unwrap();
        assert!(json.contains("\"type\":\"tool_result\""));

        let parsed: ContentBlock = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, block);
    }

    #[test]
    fn test_message_constructors() {
        let msg = Message::user_text("hello");
        assert_eq!(msg.role, MessageRole::User);
        assert_eq!(msg.content.len(), 1);

        let results = Message::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: "tu_1".to_string(),
            content: "done".to_string(),
            is_error: None,
        }]);
        assert_eq!(results.role, MessageRole::User);
    }
}
