//! Runtime adapters: the only code that actually starts processes on behalf
//! of tools. Each adapter enforces the wall-clock timeout, the output cap,
//! the memory limit and whatever fs/network isolation the limits ask for.

mod container;
mod disabled;
mod native;

pub use container::ContainerRuntime;
pub use disabled::DisabledRuntime;
pub use native::NativeRuntime;

use async_trait::async_trait;
use bastion_core::config::LimitsConfig;
use bastion_core::types::Constraints;
use bastion_core::{Registry, RegistryError, ToolError, ToolErrorKind};
use serde_json::Value;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What to run. Adapters decide how and where.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// `<shell> -c <command>`
    pub fn shell(shell: &str, command: &str) -> Self {
        Self::new(shell).arg("-c").arg(command)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn stdin(mut self, data: Vec<u8>) -> Self {
        self.stdin = Some(data);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Effective limits for one execution: the configured defaults tightened by
/// whatever constraints the authorizing decision carried.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub memory_bytes: Option<u64>,
    /// Empty means unrestricted.
    pub path_prefixes: Vec<PathBuf>,
    pub deny_network: bool,
}

impl ExecutionLimits {
    pub fn from_config(cfg: &LimitsConfig) -> Self {
        Self {
            timeout: Duration::from_secs(cfg.timeout_secs),
            max_output_bytes: cfg.max_output_bytes,
            memory_bytes: cfg.memory_mb.map(|mb| mb * 1024 * 1024),
            path_prefixes: Vec::new(),
            deny_network: false,
        }
    }

    /// Constraints can only narrow limits, never widen them.
    pub fn tighten(&self, constraints: &Constraints) -> Self {
        let mut limits = self.clone();
        if let Some(secs) = constraints.timeout_secs {
            limits.timeout = limits.timeout.min(Duration::from_secs(secs));
        }
        if let Some(max) = constraints.max_output_bytes {
            limits.max_output_bytes = limits.max_output_bytes.min(max);
        }
        if !constraints.path_prefixes.is_empty() {
            limits.path_prefixes = if limits.path_prefixes.is_empty() {
                constraints.path_prefixes.clone()
            } else {
                limits
                    .path_prefixes
                    .iter()
                    .filter(|p| constraints.path_prefixes.iter().any(|c| p.starts_with(c)))
                    .cloned()
                    .collect()
            };
        }
        limits.deny_network |= constraints.deny_network;
        limits
    }

    /// True when fs or network isolation is required.
    pub fn is_isolated(&self) -> bool {
        !self.path_prefixes.is_empty() || self.deny_network
    }

    /// Lexical check; callers canonicalize first when the path exists.
    pub fn allows_path(&self, path: &Path) -> bool {
        self.path_prefixes.is_empty() || self.path_prefixes.iter().any(|p| path.starts_with(p))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl ExecutionOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn output_bytes(&self) -> usize {
        self.stdout.len() + self.stderr.len()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeFault {
    #[error("execution timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("execution cancelled")]
    Cancelled,

    #[error("output exceeded {limit} bytes; process killed")]
    OutputLimit { limit: usize },

    #[error("process killed after exceeding its memory limit")]
    MemoryLimit,

    #[error("process terminated by signal {signal}")]
    Signaled { signal: i32 },

    #[error("path outside allowed prefixes: {}", .0.display())]
    PathDenied(PathBuf),

    #[error("failed to start process: {0}")]
    Spawn(String),

    #[error("runtime cannot satisfy request: {0}")]
    Unsupported(String),
}

impl From<RuntimeFault> for ToolError {
    fn from(fault: RuntimeFault) -> Self {
        let kind = match &fault {
            RuntimeFault::Timeout(_) => ToolErrorKind::ExecutionTimeout,
            RuntimeFault::OutputLimit { .. } | RuntimeFault::MemoryLimit => {
                ToolErrorKind::ResourceLimitExceeded
            }
            RuntimeFault::PathDenied(_) => ToolErrorKind::PolicyDenied,
            RuntimeFault::Cancelled
            | RuntimeFault::Signaled { .. }
            | RuntimeFault::Spawn(_)
            | RuntimeFault::Unsupported(_) => ToolErrorKind::ExecutionFault,
        };
        ToolError::new(kind, fault.to_string())
    }
}

#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        spec: CommandSpec,
        limits: &ExecutionLimits,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutput, RuntimeFault>;
}

/// Register the `native`, `container` and `disabled` adapters.
pub fn register_builtin(
    registry: &mut Registry<dyn RuntimeAdapter>,
    workspace: PathBuf,
) -> Result<(), RegistryError> {
    registry.register("native", |_params: &Value| {
        Ok(Arc::new(NativeRuntime::new()) as Arc<dyn RuntimeAdapter>)
    })?;
    registry.register("container", move |params: &Value| {
        Ok(Arc::new(ContainerRuntime::from_params(params, &workspace)?) as Arc<dyn RuntimeAdapter>)
    })?;
    registry.register("disabled", |_params: &Value| {
        Ok(Arc::new(DisabledRuntime) as Arc<dyn RuntimeAdapter>)
    })?;
    Ok(())
}

pub(crate) fn stdin_mode(spec: &CommandSpec) -> Stdio {
    if spec.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

async fn read_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    used: &AtomicUsize,
    cap: usize,
    overflow: &CancellationToken,
) -> Vec<u8> {
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => return buf,
            Ok(n) => n,
        };
        let total = used.fetch_add(n, Ordering::SeqCst) + n;
        if total > cap {
            let keep = n.saturating_sub(total - cap);
            buf.extend_from_slice(&chunk[..keep]);
            overflow.cancel();
            return buf;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Only a SIGKILL under a memory limit is read as an OOM kill. Any other
/// signal is a crash.
fn abnormal_exit(status: &ExitStatus, limits: &ExecutionLimits) -> Option<RuntimeFault> {
    let limited = limits.memory_bytes.is_some();
    // 137 = 128 + SIGKILL, what container runtimes report after an OOM kill.
    if limited && status.code() == Some(137) {
        return Some(RuntimeFault::MemoryLimit);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            if limited && signal == libc::SIGKILL {
                return Some(RuntimeFault::MemoryLimit);
            }
            return Some(RuntimeFault::Signaled { signal });
        }
    }
    None
}

enum Stop {
    Timeout,
    Cancelled,
    Overflow,
}

/// Feed stdin, collect capped output and wait, racing the timeout and the
/// cancellation token. `on_kill` runs before the child itself is killed and
/// is where adapters tear down process groups or containers.
pub(crate) async fn drive<K>(
    mut child: Child,
    stdin: Option<Vec<u8>>,
    limits: &ExecutionLimits,
    cancel: CancellationToken,
    on_kill: K,
) -> Result<ExecutionOutput, RuntimeFault>
where
    K: Future<Output = ()>,
{
    let started = Instant::now();
    let used = AtomicUsize::new(0);
    let overflow = CancellationToken::new();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdin_pipe = child.stdin.take();

    let result = {
        let collect = async {
            let feed = async {
                if let (Some(mut pipe), Some(data)) = (stdin_pipe, stdin) {
                    let _ = pipe.write_all(&data).await;
                    let _ = pipe.shutdown().await;
                }
            };
            let (_, out, err) = tokio::join!(
                feed,
                read_capped(stdout, &used, limits.max_output_bytes, &overflow),
                read_capped(stderr, &used, limits.max_output_bytes, &overflow),
            );
            let status = child.wait().await;
            (out, err, status)
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Stop::Cancelled),
            _ = overflow.cancelled() => Err(Stop::Overflow),
            _ = tokio::time::sleep(limits.timeout) => Err(Stop::Timeout),
            collected = collect => Ok(collected),
        }
    };

    match result {
        Ok((out, err, status)) => {
            let status = status.map_err(|e| RuntimeFault::Spawn(e.to_string()))?;
            if overflow.is_cancelled() {
                return Err(RuntimeFault::OutputLimit {
                    limit: limits.max_output_bytes,
                });
            }
            if let Some(fault) = abnormal_exit(&status, limits) {
                return Err(fault);
            }
            Ok(ExecutionOutput {
                stdout: String::from_utf8_lossy(&out).into_owned(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
                exit_code: status.code(),
                duration_ms: started.elapsed().as_millis() as u64,
            })
        }
        Err(stop) => {
            on_kill.await;
            let _ = child.start_kill();
            let _ = child.wait().await;
            let fault = match stop {
                Stop::Timeout => RuntimeFault::Timeout(limits.timeout),
                Stop::Cancelled => RuntimeFault::Cancelled,
                Stop::Overflow => RuntimeFault::OutputLimit {
                    limit: limits.max_output_bytes,
                },
            };
            debug!(fault = %fault, "Killed runtime process");
            Err(fault)
        }
    }
}
