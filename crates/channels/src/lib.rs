pub mod cli;
pub mod manager;
pub mod rate_limit;

use async_trait::async_trait;
use bastion_core::{InboundMessage, OutboundMessage, Registry, RegistryError, Result};
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

pub use cli::CliChannel;
pub use manager::{Backoff, ChannelManager};
pub use rate_limit::ChannelRateLimiter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ChannelHealth {
    Healthy,
    Unhealthy(String),
}

impl ChannelHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ChannelHealth::Healthy)
    }
}

/// A chat transport. `listen` yields inbound messages indefinitely and may be
/// called again after the stream ends to reconnect.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, msg: &OutboundMessage) -> Result<()>;

    async fn listen(&self) -> Result<BoxStream<'static, InboundMessage>>;

    async fn health_check(&self) -> ChannelHealth;
}

/// Register the built-in channel adapters.
pub fn register_builtin(registry: &mut Registry<dyn Channel>) -> std::result::Result<(), RegistryError> {
    registry.register("cli", |params: &Value| {
        let user = params.get("user").and_then(Value::as_str).unwrap_or("user");
        let chat_id = params.get("chatId").and_then(Value::as_str).unwrap_or("default");
        Ok(Arc::new(CliChannel::stdio(user, chat_id)) as Arc<dyn Channel>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::CapabilityKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_cli_channel_from_registry() {
        let mut reg: Registry<dyn Channel> = Registry::new(CapabilityKind::Channel);
        register_builtin(&mut reg).unwrap();
        let channel = reg.resolve("cli", &json!({"user": "ops"})).unwrap();
        assert_eq!(channel.name(), "cli");
        assert!(channel.health_check().await.is_healthy());
        assert!(reg.resolve("telegram", &Value::Null).is_err());
    }
}
