pub mod anthropic;
pub mod circuit;
pub mod client;
pub mod factory;
pub mod openai;
pub mod router;

use async_trait::async_trait;
use bastion_core::types::{ProviderRequest, ProviderResponse};
use bastion_core::ProviderError;

/// A language-model backend. Implementations classify every failure as
/// transient or permanent; retries and fallback belong to the router.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}

pub use anthropic::AnthropicProvider;
pub use circuit::{CircuitBreaker, CircuitSnapshot, CircuitStatus, CircuitTransition};
pub use factory::register_builtin;
pub use openai::OpenAIProvider;
pub use router::{ProviderRouter, RoutedResponse, RouterSettings};
