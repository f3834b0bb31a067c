use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use tracing::warn;

use crate::error::{ToolError, ToolErrorKind};

/// Who is asking: the channel a message came from and the user on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub channel: String,
    pub user: String,
}

impl Subject {
    pub fn new(channel: &str, user: &str) -> Self {
        Self {
            channel: channel.to_string(),
            user: user.to_string(),
        }
    }

    /// `channel:user`, the string policy subject patterns match against.
    pub fn id(&self) -> String {
        format!("{}:{}", self.channel, self.user)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.user)
    }
}

/// A tool call request that serializes to the OpenAI-compatible format:
/// `{id, type: "function", function: {name, arguments}}`
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl Serialize for ToolCallRequest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("type", "function")?;
        map.serialize_entry(
            "function",
            &serde_json::json!({
                "name": self.name,
                "arguments": self.arguments.to_string()
            }),
        )?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ToolCallRequest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let obj = value
            .as_object()
            .ok_or_else(|| serde::de::Error::custom("expected object"))?;

        let id = obj
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        // Nested format: {id, type, function: {name, arguments}}
        if let Some(func) = obj.get("function").and_then(|v| v.as_object()) {
            let name = func
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let arguments = match func.get("arguments") {
                Some(Value::String(s)) => parse_arguments(s),
                Some(v) => v.clone(),
                None => Value::Object(serde_json::Map::new()),
            };
            return Ok(ToolCallRequest { id, name, arguments });
        }

        // Flat format: {id, name, arguments}
        let name = obj
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let arguments = obj
            .get("arguments")
            .cloned()
            .unwrap_or(Value::Object(serde_json::Map::new()));

        Ok(ToolCallRequest { id, name, arguments })
    }
}

/// Parse a JSON-encoded argument string. Unparseable arguments are kept as a
/// raw string so schema validation rejects them instead of silently running
/// the tool with no parameters.
pub fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(error = %e, raw = %raw, "Failed to parse tool call arguments as JSON");
        Value::String(raw.to_string())
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Value::String(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: &str) -> Self {
        Self::text("system", content)
    }

    pub fn user(content: &str) -> Self {
        Self::text("user", content)
    }

    pub fn assistant(content: &str) -> Self {
        Self::text("assistant", content)
    }

    pub fn assistant_tool_calls(content: Option<&str>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content
                .map(|c| Value::String(c.to_string()))
                .unwrap_or(Value::Null),
            tool_calls: Some(calls),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool_result(tool_call_id: &str, name: &str, content: &str) -> Self {
        Self {
            role: "tool".to_string(),
            content: Value::String(content.to_string()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.to_string()),
            name: Some(name.to_string()),
        }
    }

    pub fn text_content(&self) -> &str {
        self.content.as_str().unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationParams {
    #[serde(default)]
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

/// Normalized request handed to the provider router.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderRequest {
    pub messages: Vec<ChatMessage>,
    /// Tool schemas in OpenAI function format.
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default)]
    pub params: GenerationParams,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// What a provider produced: a final reply or a batch of tool calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderResponse {
    Reply {
        content: String,
        #[serde(default)]
        usage: Usage,
    },
    ToolCalls {
        #[serde(default)]
        content: Option<String>,
        calls: Vec<ToolCallRequest>,
        #[serde(default)]
        usage: Usage,
    },
}

impl ProviderResponse {
    pub fn reply(content: &str) -> Self {
        ProviderResponse::Reply {
            content: content.to_string(),
            usage: Usage::default(),
        }
    }

    pub fn usage(&self) -> Usage {
        match self {
            ProviderResponse::Reply { usage, .. } | ProviderResponse::ToolCalls { usage, .. } => *usage,
        }
    }
}

/// One requested tool execution, correlated back to its turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub turn_id: String,
    /// Provider-side tool call id, echoed back with the result.
    pub call_id: String,
    pub name: String,
    pub params: Value,
}

impl ToolInvocation {
    pub fn new(turn_id: &str, call: &ToolCallRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            turn_id: turn_id.to_string(),
            call_id: call.id.clone(),
            name: call.name.clone(),
            params: call.arguments.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success,
    Failure { kind: ToolErrorKind, message: String },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionUsage {
    pub started_at_ms: i64,
    pub duration_ms: u64,
    pub output_bytes: usize,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub invocation_id: String,
    pub tool: String,
    pub outcome: ToolOutcome,
    pub output: Value,
    #[serde(default)]
    pub truncated: bool,
    /// The policy decision that authorized execution, if one was made.
    #[serde(default)]
    pub decision_id: Option<String>,
    #[serde(default)]
    pub usage: ExecutionUsage,
}

impl ToolResult {
    pub fn success(invocation: &ToolInvocation, output: Value) -> Self {
        Self {
            invocation_id: invocation.id.clone(),
            tool: invocation.name.clone(),
            outcome: ToolOutcome::Success,
            output,
            truncated: false,
            decision_id: None,
            usage: ExecutionUsage::default(),
        }
    }

    pub fn failure(invocation: &ToolInvocation, error: ToolError) -> Self {
        Self {
            invocation_id: invocation.id.clone(),
            tool: invocation.name.clone(),
            outcome: ToolOutcome::Failure {
                kind: error.kind,
                message: error.message,
            },
            output: Value::Null,
            truncated: false,
            decision_id: None,
            usage: ExecutionUsage::default(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success)
    }

    pub fn error_kind(&self) -> Option<ToolErrorKind> {
        match &self.outcome {
            ToolOutcome::Success => None,
            ToolOutcome::Failure { kind, .. } => Some(*kind),
        }
    }

    /// Text fed back to the model as the tool message content.
    pub fn to_model_content(&self) -> String {
        match &self.outcome {
            ToolOutcome::Success => match &self.output {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            ToolOutcome::Failure { kind, message } => serde_json::json!({
                "error": kind.as_str(),
                "message": message,
            })
            .to_string(),
        }
    }
}

/// Restrictions attached to an `AllowWithConstraints` decision. The sandbox
/// and the runtime adapters enforce these, they are not hints.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Constraints {
    /// Filesystem access is limited to these absolute prefixes.
    #[serde(default)]
    pub path_prefixes: Vec<PathBuf>,
    #[serde(default)]
    pub deny_network: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_output_bytes: Option<usize>,
    /// Force a specific runtime adapter.
    #[serde(default)]
    pub runtime: Option<String>,
}

impl Constraints {
    pub fn is_empty(&self) -> bool {
        self == &Constraints::default()
    }
}

/// One tool round inside a turn: what the model asked for and what came back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolRound {
    #[serde(default)]
    pub assistant_content: Option<String>,
    pub invocations: Vec<ToolInvocation>,
    pub results: Vec<ToolResult>,
}

/// One exchange unit of a session. Never modified once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub id: String,
    pub input: String,
    #[serde(default)]
    pub rounds: Vec<ToolRound>,
    pub reply: String,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    #[serde(default)]
    pub budget_exhausted: bool,
}

impl Turn {
    pub fn tool_calls(&self) -> usize {
        self.rounds.iter().map(|r| r.invocations.len()).sum()
    }

    /// Replays the turn as chat messages for model context.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::user(&self.input)];
        for round in &self.rounds {
            messages.extend(round.to_messages());
        }
        messages.push(ChatMessage::assistant(&self.reply));
        messages
    }
}

impl ToolRound {
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        let calls = self
            .invocations
            .iter()
            .map(|inv| ToolCallRequest {
                id: inv.call_id.clone(),
                name: inv.name.clone(),
                arguments: inv.params.clone(),
            })
            .collect();
        let mut messages = vec![ChatMessage::assistant_tool_calls(
            self.assistant_content.as_deref(),
            calls,
        )];
        for (inv, result) in self.invocations.iter().zip(&self.results) {
            messages.push(ChatMessage::tool_result(
                &inv.call_id,
                &inv.name,
                &result.to_model_content(),
            ));
        }
        messages
    }
}
