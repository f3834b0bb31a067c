use bastion_core::{Registry, RegistryError};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::client::ProxySettings;
use crate::{AnthropicProvider, OpenAIProvider, Provider};

/// OpenAI-compatible flavors and their default endpoints.
const OPENAI_COMPATIBLE: &[(&str, &str)] = &[
    ("openai", "https://api.openai.com/v1"),
    ("openrouter", "https://openrouter.ai/api/v1"),
    ("deepseek", "https://api.deepseek.com/v1"),
    ("groq", "https://api.groq.com/openai/v1"),
    ("vllm", "http://localhost:8000/v1"),
];

/// Construction parameters shared by every HTTP provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderParams {
    /// Display name for logs. Defaults to the factory key.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the key, read at construction.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(flatten)]
    pub proxy: ProxySettings,
}

fn default_timeout_secs() -> u64 {
    120
}

impl ProviderParams {
    fn parse(params: &Value) -> anyhow::Result<Self> {
        Ok(serde_json::from_value(params.clone())?)
    }

    /// Explicit key first, then the named environment variable. Local
    /// endpoints (vLLM) may legitimately run without one.
    fn resolve_api_key(&self, require: bool) -> anyhow::Result<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(key.clone());
        }
        if let Some(var) = &self.api_key_env {
            if let Ok(key) = std::env::var(var) {
                if !key.is_empty() {
                    return Ok(key);
                }
            }
            if require {
                anyhow::bail!("environment variable {} is not set", var);
            }
        } else if require {
            anyhow::bail!("no apiKey or apiKeyEnv configured");
        }
        Ok(String::new())
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Register the built-in provider adapters under their type keys.
pub fn register_builtin(registry: &mut Registry<dyn Provider>) -> Result<(), RegistryError> {
    for (key, default_base) in OPENAI_COMPATIBLE {
        let key = *key;
        let default_base = *default_base;
        registry.register(key, move |params: &Value| {
            let p = ProviderParams::parse(params)?;
            let api_key = p.resolve_api_key(key != "vllm")?;
            let provider = OpenAIProvider::new(
                p.name.as_deref().unwrap_or(key),
                &api_key,
                Some(p.api_base.as_deref().unwrap_or(default_base)),
                &p.model,
                &p.proxy,
                p.timeout(),
            );
            Ok(Arc::new(provider) as Arc<dyn Provider>)
        })?;
    }

    registry.register("anthropic", |params: &Value| {
        let p = ProviderParams::parse(params)?;
        let api_key = p.resolve_api_key(true)?;
        let provider = AnthropicProvider::new(
            p.name.as_deref().unwrap_or("anthropic"),
            &api_key,
            p.api_base.as_deref(),
            &p.model,
            &p.proxy,
            p.timeout(),
        );
        Ok(Arc::new(provider) as Arc<dyn Provider>)
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::CapabilityKind;
    use serde_json::json;

    fn registry() -> Registry<dyn Provider> {
        let mut reg: Registry<dyn Provider> = Registry::new(CapabilityKind::Provider);
        register_builtin(&mut reg).unwrap();
        reg
    }

    #[test]
    fn test_builtin_keys() {
        let keys = registry().keys();
        for k in ["anthropic", "deepseek", "groq", "openai", "openrouter", "vllm"] {
            assert!(keys.contains(&k.to_string()), "missing {}", k);
        }
    }

    #[test]
    fn test_explicit_key_and_name() {
        let p = registry()
            .resolve(
                "openai",
                &json!({ "apiKey": "sk-test", "model": "gpt-4o-mini", "name": "primary" }),
            )
            .unwrap();
        assert_eq!(p.name(), "primary");
    }

    #[test]
    fn test_missing_env_key_is_construction_error() {
        let err = registry()
            .resolve(
                "anthropic",
                &json!({ "apiKeyEnv": "BASTION_TEST_SURELY_UNSET_KEY", "model": "claude-3-5-haiku" }),
            )
            .err()
            .unwrap();
        match err {
            RegistryError::ConstructionError { reason, .. } => {
                assert!(reason.contains("BASTION_TEST_SURELY_UNSET_KEY"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_vllm_needs_no_key() {
        let p = registry().resolve("vllm", &json!({ "model": "qwen" })).unwrap();
        assert_eq!(p.name(), "vllm");
    }

    #[test]
    fn test_missing_model_rejected() {
        assert!(registry().resolve("openai", &json!({ "apiKey": "k" })).is_err());
    }

    #[test]
    fn test_proxy_params_flatten() {
        let p: ProviderParams = serde_json::from_value(json!({
            "model": "m",
            "proxy": "http://127.0.0.1:7890",
            "noProxy": ["localhost"]
        }))
        .unwrap();
        assert_eq!(p.proxy.proxy.as_deref(), Some("http://127.0.0.1:7890"));
        assert_eq!(p.proxy.no_proxy, vec!["localhost".to_string()]);
    }
}
