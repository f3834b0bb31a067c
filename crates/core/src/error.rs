use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::CapabilityKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure classification reported by a model provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Timeouts, rate limits, 5xx and connection problems. Worth retrying.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// Auth failures and malformed requests. Retrying cannot help.
    #[error("permanent provider failure: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// Classify an unsuccessful HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let msg = format!("HTTP {}: {}", status, truncate_chars(body, 300));
        match status {
            408 | 425 | 429 => ProviderError::Transient(msg),
            500..=599 => ProviderError::Transient(msg),
            _ => ProviderError::Permanent(msg),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("all providers exhausted after {attempts} attempt(s), {skipped} skipped: {}", .last_error.as_deref().unwrap_or("no eligible provider"))]
    AllProvidersExhausted {
        attempts: u32,
        skipped: u32,
        last_error: Option<String>,
    },

    #[error("no providers configured")]
    NoProviders,

    #[error("provider request cancelled")]
    Cancelled,
}

/// Failure classes a tool invocation can end in. Always reported through a
/// `ToolResult`, never raised past the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    UnknownTool,
    InvalidParameters,
    PolicyDenied,
    ExecutionTimeout,
    ExecutionFault,
    ResourceLimitExceeded,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::UnknownTool => "unknown_tool",
            ToolErrorKind::InvalidParameters => "invalid_parameters",
            ToolErrorKind::PolicyDenied => "policy_denied",
            ToolErrorKind::ExecutionTimeout => "execution_timeout",
            ToolErrorKind::ExecutionFault => "execution_fault",
            ToolErrorKind::ResourceLimitExceeded => "resource_limit_exceeded",
        }
    }
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::InvalidParameters, message)
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::PolicyDenied, message)
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::ExecutionFault, message)
    }
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        ToolError::fault(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("memory capacity of {capacity} records exceeded")]
    CapacityExceeded { capacity: usize },

    #[error("memory backend unavailable: {0}")]
    BackendUnavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no {kind} registered under '{key}'")]
    UnknownKey { kind: CapabilityKind, key: String },

    #[error("failed to construct {kind} '{key}': {reason}")]
    ConstructionError {
        kind: CapabilityKind,
        key: String,
        reason: String,
    },

    #[error("{kind} '{key}' is already registered")]
    DuplicateKey { kind: CapabilityKind, key: String },
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(ProviderError::from_status(429, "slow down").is_transient());
        assert!(ProviderError::from_status(503, "").is_transient());
        assert!(ProviderError::from_status(408, "").is_transient());
        assert!(!ProviderError::from_status(401, "bad key").is_transient());
        assert!(!ProviderError::from_status(400, "malformed").is_transient());
    }

    #[test]
    fn test_status_body_is_truncated() {
        let body = "x".repeat(1000);
        match ProviderError::from_status(500, &body) {
            ProviderError::Transient(msg) => assert!(msg.len() < 400),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_exhausted_display() {
        let err = RouterError::AllProvidersExhausted {
            attempts: 3,
            skipped: 1,
            last_error: Some("boom".to_string()),
        };
        let text = err.to_string();
        assert!(text.contains("3 attempt"));
        assert!(text.contains("boom"));
    }
}
