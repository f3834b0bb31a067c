use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{CommandSpec, ExecutionLimits, ExecutionOutput, RuntimeAdapter, RuntimeFault};

/// Refuses every run. Selecting it for a tool switches that tool off.
pub struct DisabledRuntime;

#[async_trait]
impl RuntimeAdapter for DisabledRuntime {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn run(
        &self,
        spec: CommandSpec,
        _limits: &ExecutionLimits,
        _cancel: CancellationToken,
    ) -> Result<ExecutionOutput, RuntimeFault> {
        Err(RuntimeFault::Unsupported(format!(
            "execution disabled (refused '{}')",
            spec.program
        )))
    }
}
