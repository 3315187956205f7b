//! Google Generative Language API client (generateContent).
//!
//! Gemini has no caller-visible prompt-cache markers, so cache-eligible
//! system blocks join the system instruction. Gemini function calls carry
//! no ids; the function name doubles as the tool-use id, and the phase
//! runner echoes it back in the matching function response.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::errors::WorkflowError;

use super::{
    ContentBlock, LlmClient, LlmRequest, LlmResponse, MessageRole, StopReason, TokenUsage,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub struct GoogleClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GoogleClient {
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

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireCandidate {
    content: WireContent,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Deserialize)]
struct WirePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "functionCall")]
    function_call: Option<WireFunctionCall>,
}

#[derive(Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default, rename = "promptTokenCount")]
    prompt_token_count: u64,
    #[serde(default, rename = "candidatesTokenCount")]
    candidates_token_count: u64,
}

fn to_contents(request: &LlmRequest) -> Vec<serde_json::Value> {
    request
        .messages
        .iter()
        .map(|message| {
            let role = match message.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "model",
            };
            let parts: Vec<serde_json::Value> = message
                .content
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => json!({"text": text}),
                    ContentBlock::ToolUse { name, input, .. } => {
                        json!({"functionCall": {"name": name, "args": input}})
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        let response: serde_json::Value = serde_json::from_str(content)
                            .unwrap_or_else(|_| json!({"result": content}));
                        json!({
                            "functionResponse": {
                                "name": tool_use_id,
                                "response": response,
                            }
                        })
                    }
                })
                .collect();
            json!({"role": role, "parts": parts})
        })
        .collect()
}

#[async_trait]
impl LlmClient for GoogleClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, WorkflowError> {
        let system_text = request
            .system
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut body = json!({
            "contents": to_contents(request),
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_tokens,
            },
        });
        if !system_text.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system_text}]});
        }
        if !request.tools.is_empty() {
            let declarations: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!([{"functionDeclarations": declarations}]);
        }

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, request.model
        );
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| WorkflowError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(WorkflowError::Provider(format!(
                "Google API error ({}): {}",
                status, detail
            )));
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| WorkflowError::Provider(e.to_string()))?;

        let candidate = wire
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| WorkflowError::Provider("Google returned no candidates".to_string()))?;

        let mut content = Vec::new();
        let mut saw_function_call = false;
        for part in candidate.content.parts {
            if let Some(text) = part.text {
                if !text.is_empty() {
                    content.push(ContentBlock::Text { text });
                }
            }
            if let Some(call) = part.function_call {
                saw_function_call = true;
                content.push(ContentBlock::ToolUse {
                    id: call.name.clone(),
                    name: call.name,
                    input: call.args,
                });
            }
        }

        let stop_reason = if saw_function_call {
            StopReason::ToolUse
        } else {
            match candidate.finish_reason.as_deref() {
                Some("STOP") => StopReason::EndTurn,
                Some("MAX_TOKENS") => StopReason::MaxTokens,
                _ => StopReason::Other,
            }
        };

        let usage = wire.usage_metadata.map_or(TokenUsage::default(), |u| {
            TokenUsage {
                input_tokens: u.prompt_token_count,
                output_tokens: u.candidates_token_count,
            }
        });

        Ok(LlmResponse {
            content,
            usage,
            stop_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;

    #[test]
    fn test_roles_map_to_user_and_model() {
        let request = LlmRequest {
            model: "gemini-2.0-flash".to_string(),
            system: Vec::new(),
            messages: vec![
                Message::user_text("hello"),
                Message::assistant(vec![ContentBlock::Text {
                    text: "hi".to_string(),
                }]),
            ],
            tools: Vec::new(),
            temperature: 0.0,
            max_tokens: 1024,
        };

        let contents = to_contents(&request);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn test_tool_result_becomes_function_response() {
        let request = LlmRequest {
            model: "gemini-2.0-flash".to_string(),
            system: Vec::new(),
            messages: vec![Message::tool_results(vec![ContentBlock::ToolResult {
                tool_use_id: "fetch_issue".to_string(),
                content: "{\"state\": \"open\"}".to_string(),
                is_error: None,
            }])],
            tools: Vec::new(),
            temperature: 0.0,
            max_tokens: 1024,
        };

        let contents = to_contents(&request);
        let part = &contents[0]["parts"][0];
        assert_eq!(part["functionResponse"]["name"], "fetch_issue");
        assert_eq!(part["functionResponse"]["response"]["state"], "open");
    }

    #[test]
    fn test_response_parsing_with_function_call() {
        let body = r#"{
            "candidates": [{
                "content": {
                    "parts": [{"functionCall": {"name": "fetch", "args": {"id": "42"}}}]
                },
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 50, "candidatesTokenCount": 10}
        }"#;
        let wire: WireResponse = serde_json::from_str(body).unwrap();
        let call = wire.candidates[0].content.parts[0]
            .function_call
            .as_ref()
            .unwrap();
        assert_eq!(call.name, "fetch");
        assert_eq!(wire.usage_metadata.as_ref().unwrap().prompt_token_count, 50);
    }
}
