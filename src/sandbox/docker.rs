//! Container-backed sandboxes driven through the `docker` CLI.

use super::{SandboxConfig, SandboxRuntime, ShellCommand, TERM};
use crate::error::RuntimeError;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Label put on every container this service starts.
pub const MANAGED_LABEL: &str = "sandterm.managed=true";

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker_bin: String,
}

impl DockerRuntime {
    pub fn new(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }

    async fn docker(&self, args: &[String]) -> Result<std::process::Output, RuntimeError> {
        Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                program: self.docker_bin.clone(),
                source,
            })
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// Arguments for `docker run` that start a detached, hardened keep-alive
/// container. The container's own entrypoint sleeps for the sandbox timeout,
/// so it disappears on its own even if this process dies.
pub fn run_args(name: &str, config: &SandboxConfig) -> Vec<String> {
    let tmpfs = format!(
        "/tmp:rw,noexec,nosuid,nodev,size={}",
        config.tmp_size_bytes
    );
    let memory = format!("{}b", config.memory_bytes);

    let mut args: Vec<String> = vec![
        "run".into(),
        "--detach".into(),
        "--rm".into(),
        "--name".into(),
        name.into(),
        "--network".into(),
        config.network.as_str().into(),
        "--cpus".into(),
        format!("{}", config.cpus),
        "--memory".into(),
        memory.clone(),
        "--memory-swap".into(),
        memory,
        "--pids-limit".into(),
        config.pids_limit.to_string(),
        // Security options
        "--security-opt".into(),
        "no-new-privileges:true".into(),
        "--cap-drop".into(),
        "ALL".into(),
        // Read-only root filesystem with a small scratch /tmp
        "--read-only".into(),
        "--tmpfs".into(),
        tmpfs,
        "--workdir".into(),
        "/tmp".into(),
        "--env".into(),
        format!("TERM={}", TERM),
        "--env".into(),
        format!("USER_ID={}", config.user_id),
        "--label".into(),
        MANAGED_LABEL.into(),
        "--label".into(),
        format!("sandterm.user={}", config.user_id),
        "--entrypoint".into(),
        "sleep".into(),
    ];
    args.push(config.image.clone());
    args.push(config.timeout.as_secs().max(1).to_string());
    args
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, name: &str, config: &SandboxConfig) -> Result<(), RuntimeError> {
        let args = run_args(name, config);
        debug!(sandbox = %name, ?args, "docker run");
        let output = self.docker(&args).await?;
        if output.status.success() {
            return Ok(());
        }

        // A half-created container must not linger.
        let _ = self.docker(&["rm".into(), "--force".into(), name.into()]).await;
        Err(RuntimeError::Command {
            program: format!("{} run", self.docker_bin),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let output = self
            .docker(&["rm".into(), "--force".into(), name.into()])
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || stderr.contains("No such container") {
            return Ok(());
        }
        Err(RuntimeError::Command {
            program: format!("{} rm", self.docker_bin),
            status: output.status.to_string(),
            stderr: stderr.trim().to_string(),
        })
    }

    fn shell_command(&self, name: &str, _config: &SandboxConfig, shell: &[String]) -> ShellCommand {
        let mut cmd = ShellCommand::new(&self.docker_bin)
            .args(["exec", "--interactive", "--tty", "--env"])
            .arg(format!("TERM={}", TERM))
            .args(["--workdir", "/tmp"])
            .arg(name)
            .args(shell.iter().cloned())
            .env("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin")
            .cwd("/tmp");
        // The CLI itself needs to find the engine.
        for key in ["DOCKER_HOST", "DOCKER_CONFIG", "DOCKER_CONTEXT", "HOME"] {
            if let Ok(value) = std::env::var(key) {
                cmd = cmd.env(key, value);
            }
        }
        cmd
    }
}
