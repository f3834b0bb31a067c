use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{drive, stdin_mode, CommandSpec, ExecutionLimits, ExecutionOutput, RuntimeAdapter, RuntimeFault};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerParams {
    #[serde(default = "default_cli")]
    cli: String,
    #[serde(default = "default_image")]
    image: String,
    #[serde(default = "default_pids_limit")]
    pids_limit: u32,
}

fn default_cli() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "alpine:3".to_string()
}

fn default_pids_limit() -> u32 {
    256
}

/// One throwaway container per run (`run --rm -i`).
pub struct ContainerRuntime {
    cli: String,
    image: String,
    pids_limit: u32,
    workspace: PathBuf,
}

impl ContainerRuntime {
    pub fn new(cli: &str, image: &str, pids_limit: u32, workspace: &Path) -> Self {
        Self {
            cli: cli.to_string(),
            image: image.to_string(),
            pids_limit,
            workspace: workspace.to_path_buf(),
        }
    }

    pub fn from_params(params: &Value, workspace: &Path) -> anyhow::Result<Self> {
        let p: ContainerParams = if params.is_null() {
            serde_json::from_value(serde_json::json!({}))?
        } else {
            serde_json::from_value(params.clone())?
        };
        if p.cli != "docker" && p.cli != "podman" {
            anyhow::bail!("unsupported container cli '{}' (docker or podman)", p.cli);
        }
        Ok(Self::new(&p.cli, &p.image, p.pids_limit, workspace))
    }

    fn run_args(&self, name: &str, spec: &CommandSpec, limits: &ExecutionLimits) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        if limits.deny_network {
            args.extend(["--network".to_string(), "none".to_string()]);
        }
        if let Some(bytes) = limits.memory_bytes {
            args.extend(["--memory".to_string(), format!("{}b", bytes)]);
        }
        args.extend(["--pids-limit".to_string(), self.pids_limit.to_string()]);

        let mounts: Vec<&Path> = if limits.path_prefixes.is_empty() {
            vec![self.workspace.as_path()]
        } else {
            limits.path_prefixes.iter().map(PathBuf::as_path).collect()
        };
        for mount in mounts {
            let m = mount.display().to_string();
            args.extend(["-v".to_string(), format!("{}:{}:rw", m, m)]);
        }
        for (k, v) in &spec.env {
            args.extend(["-e".to_string(), format!("{}={}", k, v)]);
        }
        if let Some(dir) = &spec.working_dir {
            args.extend(["-w".to_string(), dir.display().to_string()]);
        }
        args.push(self.image.clone());
        args.push(spec.program.clone());
        args.extend(spec.args.iter().cloned());
        args
    }
}

#[async_trait]
impl RuntimeAdapter for ContainerRuntime {
    fn name(&self) -> &str {
        "container"
    }

    async fn run(
        &self,
        spec: CommandSpec,
        limits: &ExecutionLimits,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutput, RuntimeFault> {
        if let Some(dir) = &spec.working_dir {
            if !limits.allows_path(dir) {
                return Err(RuntimeFault::PathDenied(dir.clone()));
            }
        }
        if which::which(&self.cli).is_err() {
            return Err(RuntimeFault::Unsupported(format!("'{}' is not installed", self.cli)));
        }

        let name = format!("bastion-{}", uuid::Uuid::new_v4().simple());
        let child = Command::new(&self.cli)
            .args(self.run_args(&name, &spec, limits))
            .stdin(stdin_mode(&spec))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeFault::Spawn(format!("{}: {}", self.cli, e)))?;
        debug!(cli = %self.cli, container = %name, image = %self.image, "Started container");

        let cli = self.cli.clone();
        let kill_name = name.clone();
        drive(child, spec.stdin, limits, cancel, async move {
            // Killing the client alone can leave the container running.
            if let Err(e) = Command::new(&cli).args(["kill", &kill_name]).output().await {
                warn!(container = %kill_name, error = %e, "Failed to kill container");
            }
        })
        .await
    }
}
