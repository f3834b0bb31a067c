use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::RegistryError;

/// The families of swappable subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Provider,
    Channel,
    Tool,
    Memory,
    /// Execution sandbox (runtime adapter).
    Runtime,
    Policy,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Provider => "provider",
            CapabilityKind::Channel => "channel",
            CapabilityKind::Tool => "tool",
            CapabilityKind::Memory => "memory backend",
            CapabilityKind::Runtime => "runtime adapter",
            CapabilityKind::Policy => "policy engine",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Constructor closure turning construction parameters into a live capability.
pub type Factory<T> = Arc<dyn Fn(&Value) -> anyhow::Result<Arc<T>> + Send + Sync>;

/// Named factories for one capability kind.
///
/// Registration happens during bootstrap through `&mut self`; afterwards the
/// registry is shared read-only and `resolve` never touches other entries.
pub struct Registry<T: ?Sized> {
    kind: CapabilityKind,
    factories: BTreeMap<String, Factory<T>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new(kind: CapabilityKind) -> Self {
        Self {
            kind,
            factories: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> CapabilityKind {
        self.kind
    }

    pub fn register<F>(&mut self, key: &str, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&Value) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        if self.factories.contains_key(key) {
            return Err(RegistryError::DuplicateKey {
                kind: self.kind,
                key: key.to_string(),
            });
        }
        debug!(kind = %self.kind, key = %key, "Registering capability factory");
        self.factories.insert(key.to_string(), Arc::new(factory));
        Ok(())
    }

    /// Register or replace. Returns `true` when an existing factory was replaced.
    pub fn register_override<F>(&mut self, key: &str, factory: F) -> bool
    where
        F: Fn(&Value) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        debug!(kind = %self.kind, key = %key, "Overriding capability factory");
        self.factories
            .insert(key.to_string(), Arc::new(factory))
            .is_some()
    }

    pub fn resolve(&self, key: &str, config: &Value) -> Result<Arc<T>, RegistryError> {
        let factory = self
            .factories
            .get(key)
            .ok_or_else(|| RegistryError::UnknownKey {
                kind: self.kind,
                key: key.to_string(),
            })?;

        factory(config).map_err(|e| RegistryError::ConstructionError {
            kind: self.kind,
            key: key.to_string(),
            reason: format!("{:#}", e),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Registered keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}
