//! Scripted mock provider for tests and dry runs.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::definitions::schema::LlmProvider;
use crate::errors::WorkflowError;

use super::{
    ContentBlock, LlmClient, LlmFactory, LlmRequest, LlmResponse, StopReason, TokenUsage,
};

type Handler = dyn Fn(&LlmRequest) -> LlmResponse + Send + Sync;

#[derive(Default)]
struct Inner {
    scripted: VecDeque<LlmResponse>,
    requests: Vec<LlmRequest>,
}

/// Mock client that replays scripted responses in order, or answers through
/// a handler. With no script and no handler, every call completes with a
/// plain "Done." reply.
pub struct MockLlm {
    inner: Mutex<Inner>,
    handler: Option<Box<Handler>>,
    usage_per_call: TokenUsage,
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            handler: None,
            usage_per_call: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
        }
    }

    /// Answer every request through `handler` instead of the script.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&LlmRequest) -> LlmResponse + Send + Sync + 'static,
    {
        Self {
            inner: Mutex::new(Inner::default()),
            handler: Some(Box::new(handler)),
            usage_per_call: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
        }
    }

    /// Fixed usage reported for every call.
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage_per_call = TokenUsage {
            input_tokens,
            output_tokens,
        };
        self
    }

    /// Queue a plain-text reply.
    pub fn push_text(&self, text: &str) {
        self.push_response(LlmResponse {
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
            usage: self.usage_per_call,
            stop_reason: StopReason::EndTurn,
        });
    }

    /// Queue a tool-use reply.
    pub fn push_tool_use(&self, id: &str, name: &str, input: serde_json::Value) {
        self.push_response(LlmResponse {
            content: vec![ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            }],
            usage: self.usage_per_call,
            stop_reason: StopReason::ToolUse,
        });
    }

    /// Queue an arbitrary response.
    pub fn push_response(&self, response: LlmResponse) {
        self.inner
            .lock()
            .expect("mock llm lock poisoned")
            .scripted
            .push_back(response);
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.inner
            .lock()
            .expect("mock llm lock poisoned")
            .requests
            .clone()
    }

    /// Build a plain-text response value (for handlers).
    pub fn text_response(text: &str) -> LlmResponse {
        LlmResponse {
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            stop_reason: StopReason::EndTurn,
        }
    }
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, WorkflowError> {
        if let Some(handler) = &self.handler {
            let mut response = handler(request);
            response.usage = self.usage_per_call;
            self.inner
                .lock()
                .expect("mock llm lock poisoned")
                .requests
                .push(request.clone());
            return Ok(response);
        }

        let mut inner = self.inner.lock().expect("mock llm lock poisoned");
        inner.requests.push(request.clone());
        Ok(inner
            .scripted
            .pop_front()
            .unwrap_or_else(|| LlmResponse {
                content: vec![ContentBlock::Text {
                    text: "Done.".to_string(),
                }],
                usage: self.usage_per_call,
                stop_reason: StopReason::EndTurn,
            }))
    }
}

/// Factory handing the same mock client to every provider.
pub struct MockFactory {
    client: Arc<MockLlm>,
}

impl MockFactory {
    pub fn new(client: Arc<MockLlm>) -> Self {
        Self { client }
    }
}

impl LlmFactory for MockFactory {
    fn create(&self, _provider: LlmProvider) -> Result<Arc<dyn LlmClient>, WorkflowError> {
        Ok(Arc::clone(&self.client) as Arc<dyn LlmClient>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;

    fn request() -> LlmRequest {
        LlmRequest {
            model: "mock".to_string(),
            system: Vec::new(),
            messages: vec![Message::user_text("go")],
            tools: Vec::new(),
            temperature: 0.0,
            max_tokens: 100,
        }
    }

    #[tokio::test]
    async fn test_scripted_responses_in_order() {
        let mock = MockLlm::new();
        mock.push_text("first");
        mock.push_text("second");

        assert_eq!(mock.complete(&request()).await.unwrap().text(), "first");
        assert_eq!(mock.complete(&request()).await.unwrap().text(), "second");
        // Script exhausted: falls back to the default reply.
        assert_eq!(mock.complete(&request()).await.unwrap().text(), "Done.");
    }

    #[tokio::test]
    async fn test_records_requests() {
        let mock = MockLlm::new();
        mock.complete(&request()).await.unwrap();
        mock.complete(&request()).await.unwrap();
        assert_eq!(mock.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_handler_mode() {
        let mock = MockLlm::with_handler(|request| {
            let text = format!("model was {}", request.model);
            MockLlm::text_response(&text)
        });
        let response = mock.complete(&request()).await.unwrap();
        assert_eq!(response.text(), "model was mock");
    }

    #[tokio::test]
    async fn test_usage_override() {
        let mock = MockLlm::new().with_usage(1000, 500);
        let response = mock.complete(&request()).await.unwrap();
        assert_eq!(response.usage.input_tokens, 1000);
        assert_eq!(response.usage.output_tokens, 500);
    }
}
