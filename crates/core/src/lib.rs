pub mod capability;
pub mod config;
pub mod error;
pub mod message;
pub mod paths;
pub mod types;

pub use capability::{CapabilityKind, Factory, Registry};
pub use config::Config;
pub use error::{
    Error, MemoryError, ProviderError, RegistryError, Result, RouterError, ToolError, ToolErrorKind,
};
pub use message::{InboundMessage, OutboundMessage};
pub use paths::Paths;
pub use types::Subject;
