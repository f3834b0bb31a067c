use async_trait::async_trait;
use bastion_core::ToolError;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use crate::{safe_truncate, Tool, ToolContext, ToolSchema};

pub struct WebFetchTool {
    max_bytes: usize,
    timeout: Duration,
}

impl WebFetchTool {
    pub fn new(max_bytes: usize, timeout_secs: u64) -> Self {
        Self {
            max_bytes,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

fn parse_url(params: &Value) -> Result<url::Url, ToolError> {
    let raw = params
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::invalid("missing url"))?;
    let url = url::Url::parse(raw).map_err(|e| ToolError::invalid(format!("invalid url: {}", e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ToolError::invalid(format!("unsupported scheme '{}'", other))),
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "web_fetch".to_string(),
            description: "Fetch a web page. 'text' mode strips HTML to readable text, 'raw' returns the body unchanged.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "URL to fetch (must be http or https)"
                    },
                    "extractMode": {
                        "type": "string",
                        "enum": ["text", "raw"]
                    },
                    "maxChars": {
                        "type": "integer",
                        "minimum": 1,
                        "description": "Maximum characters to return (default: 50000)"
                    }
                },
                "required": ["url"],
                "additionalProperties": false
            }),
        }
    }

    fn action(&self) -> String {
        "net.fetch".to_string()
    }

    fn validate(&self, params: &Value) -> Result<(), ToolError> {
        parse_url(params).map(|_| ())
    }

    fn resource(&self, params: &Value) -> Option<String> {
        params.get("url").and_then(Value::as_str).map(str::to_string)
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value, ToolError> {
        ctx.check_network()?;
        let url = parse_url(&params)?;
        let extract_mode = params
            .get("extractMode")
            .and_then(Value::as_str)
            .unwrap_or("text");
        let max_chars = params
            .get("maxChars")
            .and_then(Value::as_u64)
            .unwrap_or(50_000) as usize;

        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(self.timeout.min(ctx.limits.timeout))
            .build()
            .map_err(|e| ToolError::fault(format!("failed to create HTTP client: {}", e)))?;

        let user_agent = format!("bastion/{} (agent)", env!("CARGO_PKG_VERSION"));
        let fetch = client.get(url.clone()).header("User-Agent", user_agent).send();
        let mut response = tokio::select! {
            r = fetch => r.map_err(|e| ToolError::fault(format!("fetch failed: {}", e)))?,
            _ = ctx.cancel.cancelled() => return Err(ToolError::fault("fetch cancelled")),
        };

        let final_url = response.url().to_string();
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        // Stop reading once the byte budget is spent.
        let mut body = Vec::new();
        let mut body_truncated = false;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ToolError::fault(format!("failed to read body: {}", e)))?
        {
            let room = self.max_bytes.saturating_sub(body.len());
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                body_truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&body).into_owned();

        let text = if extract_mode == "text" && content_type.contains("text/html") {
            extract_text_from_html(&body)
        } else {
            body
        };
        let truncated = body_truncated || text.len() > max_chars;
        let text = safe_truncate(&text, max_chars).to_string();

        Ok(json!({
            "url": url.as_str(),
            "finalUrl": final_url,
            "status": status,
            "content_type": content_type,
            "format": extract_mode,
            "truncated": truncated,
            "length": text.len(),
            "text": text
        }))
    }
}

fn extract_text_from_html(html: &str) -> String {
    use scraper::{Html, Selector};

    let document = Html::parse_document(html);

    for sel in ["article", "main", "body"] {
        if let Ok(selector) = Selector::parse(sel) {
            if let Some(element) = document.select(&selector).next() {
                let text = element
                    .text()
                    .flat_map(str::split_whitespace)
                    .collect::<Vec<_>>()
                    .join(" ");
                if !text.is_empty() {
                    return text;
                }
            }
        }
    }

    document
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
