use async_trait::async_trait;
use bastion_core::types::{ChatMessage, ProviderRequest, ProviderResponse, ToolCallRequest, Usage};
use bastion_core::ProviderError;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::client::{build_http_client, classify_reqwest_error, ProxySettings};
use crate::openai::truncate_at_char_boundary;
use crate::Provider;

pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    name: String,
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(
        name: &str,
        api_key: &str,
        api_base: Option<&str>,
        model: &str,
        proxy: &ProxySettings,
        timeout: Duration,
    ) -> Self {
        let api_base = api_base
            .unwrap_or(ANTHROPIC_API_BASE)
            .trim_end_matches('/')
            .to_string();
        Self {
            name: name.to_string(),
            client: build_http_client(proxy, &api_base, timeout),
            api_key: api_key.to_string(),
            api_base,
            model: model.to_string(),
        }
    }

    /// OpenAI `{type, function: {name, description, parameters}}` to
    /// Anthropic `{name, description, input_schema}`.
    fn convert_tools(tools: &[Value]) -> Vec<Value> {
        tools
            .iter()
            .filter_map(|tool| {
                let func = tool.get("function")?;
                let name = func.get("name")?.as_str()?;
                let description = func.get("description").and_then(|v| v.as_str()).unwrap_or("");
                let parameters = func
                    .get("parameters")
                    .cloned()
                    .unwrap_or_else(|| json!({ "type": "object", "properties": {} }));
                Some(json!({
                    "name": name,
                    "description": description,
                    "input_schema": parameters,
                }))
            })
            .collect()
    }

    /// System messages move to the top-level `system` field; tool results
    /// become `tool_result` blocks inside user messages.
    fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
        let mut system_text: Option<String> = None;
        let mut converted: Vec<Value> = Vec::new();

        for msg in messages {
            match msg.role.as_str() {
                "system" => {
                    let text = msg.text_content().to_string();
                    system_text = Some(match system_text {
                        Some(existing) => format!("{}\n\n{}", existing, text),
                        None => text,
                    });
                }
                "assistant" => {
                    let mut blocks: Vec<Value> = Vec::new();
                    let text = msg.text_content();
                    if !text.is_empty() {
                        blocks.push(json!({ "type": "text", "text": text }));
                    }
                    for tc in msg.tool_calls.iter().flatten() {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.arguments,
                        }));
                    }
                    if blocks.is_empty() {
                        blocks.push(json!({ "type": "text", "text": "" }));
                    }
                    converted.push(json!({ "role": "assistant", "content": blocks }));
                }
                "tool" => {
                    let block = json!({
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id.as_deref().unwrap_or(""),
                        "content": msg.text_content(),
                    });
                    converted.push(json!({ "role": "user", "content": [block] }));
                }
                _ => {
                    converted.push(json!({ "role": "user", "content": msg.text_content() }));
                }
            }
        }

        (system_text, Self::merge_consecutive_roles(converted))
    }

    /// Anthropic requires strictly alternating roles.
    fn merge_consecutive_roles(messages: Vec<Value>) -> Vec<Value> {
        let mut result: Vec<Value> = Vec::new();

        for msg in messages {
            let role = msg.get("role").and_then(|v| v.as_str()).unwrap_or("");
            let same_role = result
                .last()
                .and_then(|v| v.get("role"))
                .and_then(|v| v.as_str())
                == Some(role);

            if !same_role {
                result.push(msg);
                continue;
            }
            if let Some(last) = result.last_mut() {
                let previous = last.get("content").cloned().unwrap_or(Value::Null);
                let next = msg.get("content").cloned().unwrap_or(Value::Null);
                last["content"] = match (previous, next) {
                    (Value::Array(mut a), Value::Array(b)) => {
                        a.extend(b);
                        Value::Array(a)
                    }
                    (Value::Array(mut a), Value::String(s)) => {
                        a.push(json!({ "type": "text", "text": s }));
                        Value::Array(a)
                    }
                    (Value::String(s1), Value::String(s2)) => {
                        Value::String(format!("{}\n\n{}", s1, s2))
                    }
                    (Value::String(s), Value::Array(a)) => {
                        let mut blocks = vec![json!({ "type": "text", "text": s })];
                        blocks.extend(a);
                        Value::Array(blocks)
                    }
                    (existing, _) => existing,
                };
            }
        }

        result
    }

    /// Config may carry "anthropic/claude-..."; the API wants the bare id.
    fn normalize_model(model: &str) -> &str {
        model.strip_prefix("anthropic/").unwrap_or(model)
    }

    fn into_response(resp: AnthropicResponse) -> ProviderResponse {
        let mut text_parts: Vec<String> = Vec::new();
        let mut calls: Vec<ToolCallRequest> = Vec::new();

        for block in resp.content {
            match block.block_type.as_str() {
                "text" => {
                    if let Some(text) = block.text.filter(|t| !t.is_empty()) {
                        text_parts.push(text);
                    }
                }
                "tool_use" => {
                    if let (Some(id), Some(name)) = (block.id, block.name) {
                        calls.push(ToolCallRequest {
                            id,
                            name,
                            arguments: block
                                .input
                                .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
                        });
                    }
                }
                _ => {}
            }
        }

        let usage = resp
            .usage
            .map(|u| Usage {
                prompt_tokens: u.input_tokens.unwrap_or(0),
                completion_tokens: u.output_tokens.unwrap_or(0),
            })
            .unwrap_or_default();

        if calls.is_empty() {
            ProviderResponse::Reply {
                content: text_parts.join("\n"),
                usage,
            }
        } else {
            ProviderResponse::ToolCalls {
                content: if text_parts.is_empty() {
                    None
                } else {
                    Some(text_parts.join("\n"))
                },
                calls,
                usage,
            }
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}/messages", self.api_base);
        let model = Self::normalize_model(request.params.model.as_deref().unwrap_or(&self.model));

        let (system, messages) = Self::convert_messages(&request.messages);
        let tools = Self::convert_tools(&request.tools);

        let mut body = json!({
            "model": model,
            "max_tokens": request.params.max_tokens,
            "temperature": request.params.temperature,
            "messages": messages,
        });
        if let Some(sys) = system {
            body["system"] = Value::String(sys);
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }

        info!(
            provider = %self.name,
            model = %model,
            tools_count = request.tools.len(),
            messages_count = request.messages.len(),
            "Calling Anthropic API"
        );

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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
            error!(provider = %self.name, status = %status, body = %raw_body, "Anthropic API error");
            // 529 is Anthropic's "overloaded".
            return Err(ProviderError::from_status(status.as_u16(), &raw_body));
        }

        debug!(body_len = raw_body.len(), "Anthropic raw response");

        let resp: AnthropicResponse = serde_json::from_str(&raw_body).map_err(|e| {
            let end = truncate_at_char_boundary(&raw_body, 500);
            ProviderError::Transient(format!(
                "failed to parse Anthropic response: {}. Body: {}",
                e,
                &raw_body[..end]
            ))
        })?;

        Ok(Self::into_response(resp))
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}
