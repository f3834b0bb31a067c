use async_trait::async_trait;
use bastion_core::types::{
    parse_arguments, ChatMessage, ProviderRequest, ProviderResponse, ToolCallRequest, Usage,
};
use bastion_core::ProviderError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::client::{build_http_client, classify_reqwest_error, ProxySettings};
use crate::Provider;

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Find the largest byte index <= `max_bytes` that is a valid char boundary.
pub(crate) fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Chat-completions adapter for OpenAI and compatible endpoints
/// (OpenRouter, DeepSeek, Groq, local vLLM and so on).
pub struct OpenAIProvider {
    name: String,
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
}

impl OpenAIProvider {
    pub fn new(
        name: &str,
        api_key: &str,
        api_base: Option<&str>,
        model: &str,
        proxy: &ProxySettings,
        timeout: Duration,
    ) -> Self {
        let resolved_base = api_base
            .unwrap_or(OPENAI_API_BASE)
            .trim_end_matches('/')
            .to_string();
        let client = build_http_client(proxy, &resolved_base, timeout);
        Self {
            name: name.to_string(),
            client,
            api_key: api_key.to_string(),
            api_base: resolved_base,
            model: model.to_string(),
        }
    }

    fn build_request<'a>(&'a self, request: &'a ProviderRequest) -> ChatRequest<'a> {
        ChatRequest {
            model: request.params.model.as_deref().unwrap_or(&self.model),
            messages: &request.messages,
            tools: &request.tools,
            tool_choice: if request.tools.is_empty() { None } else { Some("auto") },
            max_tokens: request.params.max_tokens,
            temperature: request.params.temperature,
        }
    }

    fn into_response(chat: ChatResponse) -> Result<ProviderResponse, ProviderError> {
        let usage = chat
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens.unwrap_or(0),
                completion_tokens: u.completion_tokens.unwrap_or(0),
            })
            .unwrap_or_default();

        let choice = chat
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Transient("no choices in response".to_string()))?;

        let calls: Vec<ToolCallRequest> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCallRequest {
                id: tc.id,
                name: tc.function.name,
                arguments: parse_arguments(&tc.function.arguments),
            })
            .collect();
        let content = choice.message.content.filter(|c| !c.is_empty());

        if calls.is_empty() {
            Ok(ProviderResponse::Reply {
                content: content.unwrap_or_default(),
                usage,
            })
        } else {
            Ok(ProviderResponse::ToolCalls {
                content,
                calls,
                usage,
            })
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [Value],
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
    max_tokens: u32,
    temperature: f32,
}

fn no_tools(tools: &&[Value]) -> bool {
    tools.is_empty()
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    id: String,
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = self.build_request(request);

        info!(
            provider = %self.name,
            model = %body.model,
            tools_count = request.tools.len(),
            messages_count = request.messages.len(),
            "Calling chat completions API"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        let raw_body = response
            .text()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        if !status.is_success() {
            error!(provider = %self.name, status = %status, body = %raw_body, "LLM API error");
            return Err(ProviderError::from_status(status.as_u16(), &raw_body));
        }

        {
            let end = truncate_at_char_boundary(&raw_body, 500);
            debug!(body_len = raw_body.len(), preview = %&raw_body[..end], "LLM raw response");
        }

        // A 200 with an unreadable body is a gateway hiccup more often than a
        // contract change, so it stays retryable.
        let chat: ChatResponse = serde_json::from_str(&raw_body).map_err(|e| {
            let end = truncate_at_char_boundary(&raw_body, 500);
            ProviderError::Transient(format!(
                "failed to parse response: {}. Body: {}",
                e,
                &raw_body[..end]
            ))
        })?;

        Self::into_response(chat)
    }
}
