use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{drive, stdin_mode, CommandSpec, ExecutionLimits, ExecutionOutput, RuntimeAdapter, RuntimeFault};

/// Read-only system directories exposed inside a bubblewrap jail.
const SYSTEM_DIRS: &[&str] = &["/usr", "/bin", "/sbin", "/lib", "/lib64", "/etc"];

/// Runs processes directly on the host in their own process group.
/// Isolation requests are delegated to bubblewrap; without it they are refused.
pub struct NativeRuntime {
    bwrap: Option<PathBuf>,
}

impl NativeRuntime {
    pub fn new() -> Self {
        Self::with_bwrap(which::which("bwrap").ok())
    }

    pub fn with_bwrap(bwrap: Option<PathBuf>) -> Self {
        Self { bwrap }
    }

    fn check_working_dir(spec: &CommandSpec, limits: &ExecutionLimits) -> Result<(), RuntimeFault> {
        if let Some(dir) = &spec.working_dir {
            let resolved = dir.canonicalize().unwrap_or_else(|_| dir.clone());
            if !limits.allows_path(&resolved) {
                return Err(RuntimeFault::PathDenied(resolved));
            }
        }
        Ok(())
    }

    fn bwrap_args(spec: &CommandSpec, limits: &ExecutionLimits) -> Vec<String> {
        let mut args = vec!["--die-with-parent".to_string()];
        if limits.path_prefixes.is_empty() {
            args.extend(["--bind", "/", "/"].map(String::from));
        } else {
            for dir in SYSTEM_DIRS {
                if Path::new(dir).exists() {
                    args.extend(["--ro-bind".to_string(), dir.to_string(), dir.to_string()]);
                }
            }
            args.extend(["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp"].map(String::from));
            for prefix in &limits.path_prefixes {
                let p = prefix.display().to_string();
                args.extend(["--bind".to_string(), p.clone(), p]);
            }
        }
        if limits.deny_network {
            args.push("--unshare-net".to_string());
        }
        if let Some(dir) = &spec.working_dir {
            args.extend(["--chdir".to_string(), dir.display().to_string()]);
        }
        args.push("--".to_string());
        args.push(spec.program.clone());
        args.extend(spec.args.iter().cloned());
        args
    }

    fn build_command(&self, spec: &CommandSpec, limits: &ExecutionLimits) -> Result<Command, RuntimeFault> {
        let mut cmd = if limits.is_isolated() {
            let Some(bwrap) = &self.bwrap else {
                warn!(program = %spec.program, "Isolation requested but bwrap is not installed");
                return Err(RuntimeFault::Unsupported(
                    "fs/network isolation requires bubblewrap (bwrap)".to_string(),
                ));
            };
            let mut cmd = Command::new(bwrap);
            cmd.args(Self::bwrap_args(spec, limits));
            cmd
        } else {
            let mut cmd = Command::new(&spec.program);
            cmd.args(&spec.args);
            if let Some(dir) = &spec.working_dir {
                cmd.current_dir(dir);
            }
            cmd
        };

        cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(stdin_mode(spec))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
            if let Some(bytes) = limits.memory_bytes {
                // SAFETY: only async-signal-safe libc calls between fork and exec.
                unsafe {
                    cmd.pre_exec(move || {
                        let lim = libc::rlimit {
                            rlim_cur: bytes as libc::rlim_t,
                            rlim_max: bytes as libc::rlim_t,
                        };
                        if libc::setrlimit(libc::RLIMIT_AS, &lim) != 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }
            }
        }

        Ok(cmd)
    }
}

impl Default for NativeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // The child leads its own group, so -pid reaches every descendant.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[async_trait]
impl RuntimeAdapter for NativeRuntime {
    fn name(&self) -> &str {
        "native"
    }

    async fn run(
        &self,
        spec: CommandSpec,
        limits: &ExecutionLimits,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutput, RuntimeFault> {
        Self::check_working_dir(&spec, limits)?;
        let mut cmd = self.build_command(&spec, limits)?;
        let child = cmd
            .spawn()
            .map_err(|e| RuntimeFault::Spawn(format!("{}: {}", spec.program, e)))?;
        let pid = child.id();
        debug!(program = %spec.program, pid = ?pid, isolated = limits.is_isolated(), "Spawned native process");

        drive(child, spec.stdin, limits, cancel, async move { kill_group(pid) }).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits() -> ExecutionLimits {
        ExecutionLimits {
            timeout: Duration::from_secs(10),
            max_output_bytes: 4096,
            memory_bytes: None,
            path_prefixes: Vec::new(),
            deny_network: false,
        }
    }

    fn runtime() -> NativeRuntime {
        NativeRuntime::with_bwrap(None)
    }

    #[tokio::test]
    async fn test_runs_and_captures_output() {
        let out = runtime()
            .run(CommandSpec::shell("sh", "echo hi; echo err >&2"), &limits(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.stderr.trim(), "err");
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_stdin_is_fed() {
        let spec = CommandSpec::new("cat").stdin(b"payload".to_vec());
        let out = runtime().run(spec, &limits(), CancellationToken::new()).await.unwrap();
        assert_eq!(out.stdout, "payload");
    }

    #[tokio::test]
    async fn test_timeout_kills() {
        let mut l = limits();
        l.timeout = Duration::from_millis(200);
        let err = runtime()
            .run(CommandSpec::shell("sh", "sleep 30"), &l, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeFault::Timeout(_)));
    }

    #[tokio::test]
    async fn test_cancel_kills() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = runtime()
            .run(CommandSpec::shell("sh", "sleep 30"), &limits(), cancel)
            .await
            .unwrap_err();
        assert_eq!(err, RuntimeFault::Cancelled);
    }

    #[tokio::test]
    async fn test_output_cap_kills() {
        let mut l = limits();
        l.max_output_bytes = 100;
        let err = runtime()
            .run(CommandSpec::shell("sh", "yes"), &l, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, RuntimeFault::OutputLimit { limit: 100 });
    }

    #[tokio::test]
    async fn test_isolation_without_bwrap_refused() {
        let mut l = limits();
        l.deny_network = true;
        let err = runtime()
            .run(CommandSpec::shell("sh", "true"), &l, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeFault::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_working_dir_outside_prefix_denied() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut l = limits();
        l.path_prefixes = vec![dir.path().canonicalize().unwrap()];
        let spec = CommandSpec::shell("sh", "pwd").current_dir("/");
        let err = runtime().run(spec, &l, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RuntimeFault::PathDenied(_)));
    }

    #[test]
    fn test_bwrap_args_bind_prefixes_and_unshare() {
        let mut l = limits();
        l.path_prefixes = vec![PathBuf::from("/srv/data")];
        l.deny_network = true;
        let args = NativeRuntime::bwrap_args(&CommandSpec::shell("sh", "ls"), &l);
        let joined = args.join(" ");
        assert!(joined.contains("--bind /srv/data /srv/data"));
        assert!(joined.contains("--unshare-net"));
        assert!(!joined.contains("--bind / /"));
        assert!(joined.ends_with("-- sh -c ls"));
    }
}
