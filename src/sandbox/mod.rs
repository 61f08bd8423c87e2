//! Sandbox configuration, handles and the runtime abstraction.
//!
//! A sandbox is an isolated process group (a container, or a namespaced chroot)
//! that hosts exactly one interactive shell. Runtimes only create and remove
//! sandboxes; bookkeeping lives in [`lifecycle::SandboxManager`].

pub mod docker;
pub mod isolate;
pub mod lifecycle;

pub use docker::DockerRuntime;
pub use isolate::IsolateRuntime;
pub use lifecycle::{SandboxManager, SandboxStats};

use crate::error::{ProvisionError, RuntimeError};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

pub const MIB: u64 = 1024 * 1024;

/// Terminal type forced on every shell.
pub const TERM: &str = "xterm-256color";

/// Network attachment of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network interfaces besides loopback.
    #[default]
    None,
    /// Default bridged network of the runtime.
    Bridge,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::None => "none",
            NetworkMode::Bridge => "bridge",
        }
    }
}

/// Operator defaults applied when a caller does not override a setting.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxDefaults {
    pub image: String,
    pub cpus: f64,
    pub memory_bytes: u64,
    pub pids_limit: u32,
    pub network: NetworkMode,
    pub timeout: Duration,
    pub tmp_size_bytes: u64,
}

impl Default for SandboxDefaults {
    fn default() -> Self {
        Self {
            image: "terminal-sandbox".to_string(),
            cpus: 0.5,
            memory_bytes: 128 * MIB,
            pids_limit: 50,
            network: NetworkMode::None,
            timeout: Duration::from_secs(10 * 60),
            tmp_size_bytes: 64 * MIB,
        }
    }
}

/// Hard ceilings no sandbox may exceed, whatever its overrides say.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxCaps {
    pub max_cpus: f64,
    pub max_memory_bytes: u64,
    pub max_pids: u32,
    pub max_timeout: Duration,
    pub max_tmp_size_bytes: u64,
    /// Only trusted configuration may enable networking.
    pub allow_network: bool,
}

impl Default for SandboxCaps {
    fn default() -> Self {
        Self {
            max_cpus: 1.0,
            max_memory_bytes: 512 * MIB,
            max_pids: 256,
            max_timeout: Duration::from_secs(30 * 60),
            max_tmp_size_bytes: 256 * MIB,
            allow_network: false,
        }
    }
}

/// Per-sandbox overrides layered over [`SandboxDefaults`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxOverrides {
    pub image: Option<String>,
    pub cpus: Option<f64>,
    pub memory_bytes: Option<u64>,
    pub pids_limit: Option<u32>,
    pub network: Option<NetworkMode>,
    pub timeout: Option<Duration>,
    pub tmp_size_bytes: Option<u64>,
}

impl SandboxOverrides {
    #[must_use]
    pub fn with_cpus(mut self, cpus: f64) -> Self {
        self.cpus = Some(cpus);
        self
    }

    #[must_use]
    pub fn with_memory_bytes(mut self, bytes: u64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub fn with_pids_limit(mut self, pids: u32) -> Self {
        self.pids_limit = Some(pids);
        self
    }

    #[must_use]
    pub fn with_network(mut self, network: NetworkMode) -> Self {
        self.network = Some(network);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// Effective, validated settings of one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxConfig {
    pub user_id: String,
    pub image: String,
    pub cpus: f64,
    pub memory_bytes: u64,
    pub pids_limit: u32,
    pub network: NetworkMode,
    #[serde(rename = "timeout_secs", serialize_with = "serialize_secs")]
    pub timeout: Duration,
    pub tmp_size_bytes: u64,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

impl SandboxConfig {
    /// Merge `overrides` over `defaults` and clamp the result into `caps`.
    ///
    /// Values above a cap are lowered to the cap. Non-positive or non-finite
    /// values are rejected.
    pub fn resolve(
        user_id: &str,
        defaults: &SandboxDefaults,
        caps: &SandboxCaps,
        overrides: &SandboxOverrides,
    ) -> Result<Self, ProvisionError> {
        let image = overrides.image.clone().unwrap_or_else(|| defaults.image.clone());
        if image.trim().is_empty() {
            return Err(ProvisionError::InvalidConfig("image must not be empty".into()));
        }

        let cpus = overrides.cpus.unwrap_or(defaults.cpus);
        if !cpus.is_finite() || cpus <= 0.0 {
            return Err(ProvisionError::InvalidConfig(format!(
                "cpus must be positive, got {}",
                cpus
            )));
        }
        let memory_bytes = positive("memory", overrides.memory_bytes.unwrap_or(defaults.memory_bytes))?;
        let pids_limit = positive("pids_limit", overrides.pids_limit.unwrap_or(defaults.pids_limit) as u64)? as u32;
        let tmp_size_bytes =
            positive("tmp_size", overrides.tmp_size_bytes.unwrap_or(defaults.tmp_size_bytes))?;
        let timeout = overrides.timeout.unwrap_or(defaults.timeout);
        if timeout.is_zero() {
            return Err(ProvisionError::InvalidConfig("timeout must be positive".into()));
        }

        let network = match overrides.network.unwrap_or(defaults.network) {
            NetworkMode::Bridge if !caps.allow_network => {
                tracing::warn!(user_id, "Network requested but not allowed, isolating");
                NetworkMode::None
            }
            mode => mode,
        };

        Ok(Self {
            user_id: user_id.to_string(),
            image,
            cpus: cpus.min(caps.max_cpus),
            memory_bytes: memory_bytes.min(caps.max_memory_bytes),
            pids_limit: pids_limit.min(caps.max_pids),
            network,
            timeout: timeout.min(caps.max_timeout),
            tmp_size_bytes: tmp_size_bytes.min(caps.max_tmp_size_bytes),
        })
    }
}

fn positive(field: &str, value: u64) -> Result<u64, ProvisionError> {
    if value == 0 {
        return Err(ProvisionError::InvalidConfig(format!("{} must be positive", field)));
    }
    Ok(value)
}

/// Registry record of a live sandbox.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub name: String,
    pub user_id: String,
    pub config: SandboxConfig,
    /// Pid of the attached shell process, once a terminal is attached.
    pub process_id: Option<u32>,
    pub created_at: Instant,
    /// Wall-clock creation time in Unix milliseconds, for reporting.
    pub created_at_unix_ms: u64,
}

impl SandboxHandle {
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.created_at)
    }
}

/// Serializable view of a handle for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxSummary {
    pub name: String,
    pub user_id: String,
    pub process_id: Option<u32>,
    pub age_secs: u64,
    pub created_at_unix_ms: u64,
    pub config: SandboxConfig,
}

impl From<&SandboxHandle> for SandboxSummary {
    fn from(h: &SandboxHandle) -> Self {
        Self {
            name: h.name.clone(),
            user_id: h.user_id.clone(),
            process_id: h.process_id,
            age_secs: h.age().as_secs(),
            created_at_unix_ms: h.created_at_unix_ms,
            config: h.config.clone(),
        }
    }
}

/// Generate a collision-resistant sandbox name:
/// `terminal-<user>-<unix millis>-<random>`.
pub fn generate_name(user_id: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("terminal-{}-{}-{}", sanitize_user_id(user_id), millis, &random[..8])
}

/// Reduce a user id to characters valid in container and cgroup names.
fn sanitize_user_id(user_id: &str) -> String {
    let cleaned: String = user_id
        .chars()
        .filter_map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '.' | '-' => Some(c),
            'A'..='Z' => Some(c.to_ascii_lowercase()),
            _ => None,
        })
        .take(32)
        .collect();
    if cleaned.is_empty() {
        "user".to_string()
    } else {
        cleaned
    }
}

/// A program to start on a pty in order to get a shell inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Complete environment of the spawned process; nothing is inherited.
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Backend that materializes sandboxes.
///
/// `create` and `remove` may be slow; callers never hold locks across them.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Create the isolated process group `name` with the mandatory hardening.
    async fn create(&self, name: &str, config: &SandboxConfig) -> Result<(), RuntimeError>;

    /// Force-stop and remove `name`. Removing an unknown sandbox succeeds.
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;

    /// Command that, run on a pty, yields `shell` inside sandbox `name`.
    fn shell_command(&self, name: &str, config: &SandboxConfig, shell: &[String]) -> ShellCommand;
}
