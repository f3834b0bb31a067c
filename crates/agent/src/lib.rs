pub mod bootstrap;
pub mod bus;
pub mod context;
pub mod manager;
pub mod orchestrator;
pub mod session;

pub use bootstrap::{build_runtime, AgentRuntime, CapabilityFailure, CapabilityRegistry, StartupReport};
pub use bus::{AgentEnds, ChannelEnds, MessageBus};
pub use context::ContextBuilder;
pub use manager::SessionManager;
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use session::{AgentSession, Budget, Phase, SessionState};
