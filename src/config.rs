//! Operator configuration: command-line flags with environment fallbacks,
//! validated into a [`Config`].

use crate::error::{ConfigError, LedgerError};
use crate::gateway::{LedgerFailurePolicy, RatePolicy, SessionPolicy};
use crate::ledger::{HttpLedger, Ledger, MemoryLedger};
use crate::sandbox::{
    DockerRuntime, IsolateRuntime, NetworkMode, SandboxCaps, SandboxDefaults, SandboxRuntime, MIB,
};
use crate::terminal::DimensionBounds;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Extra time past a sandbox's timeout before the sweep reaps it, so a
/// session's own timeout path gets to run first.
const SWEEP_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RuntimeKind {
    /// Containers through the docker CLI
    Docker,
    /// Namespaces, cgroup v2 and a read-only chroot (requires root)
    Isolate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LedgerKind {
    /// In-process store; limits are per server instance
    Memory,
    /// Remote KV store over HTTP
    Http,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Shared secret the upstream gateway sends in X-Origin-Secret
    #[arg(long, env = "ORIGIN_SECRET_KEY", hide_env_values = true)]
    pub origin_secret: Option<String>,

    /// Sandbox backend
    #[arg(long, env = "SANDBOX_RUNTIME", value_enum, default_value_t = RuntimeKind::Docker)]
    pub runtime: RuntimeKind,

    /// Container image for sandboxes
    #[arg(long, env = "SANDBOX_IMAGE", default_value = "terminal-sandbox")]
    pub image: String,

    /// docker executable
    #[arg(long, env = "DOCKER_BIN", default_value = "docker")]
    pub docker_bin: String,

    /// Shell started inside each sandbox, split on whitespace
    #[arg(long, env = "SANDBOX_SHELL", default_value = "/bin/sh")]
    pub shell: String,

    /// CPU share per sandbox, in cores
    #[arg(long, default_value = "0.5")]
    pub cpus: f64,

    /// Memory per sandbox in MiB
    #[arg(long, default_value = "128")]
    pub memory_mb: u64,

    /// Process limit per sandbox
    #[arg(long, default_value = "50")]
    pub pids_limit: u32,

    /// Sandbox network
    #[arg(long, value_enum, default_value_t = NetworkMode::None)]
    pub network: NetworkMode,

    /// Session and sandbox lifetime in seconds
    #[arg(long, env = "SESSION_TIMEOUT_SECS", default_value = "600")]
    pub session_timeout_secs: u64,

    /// Size of the writable /tmp in MiB
    #[arg(long, default_value = "64")]
    pub tmp_size_mb: u64,

    #[arg(long, default_value = "1.0")]
    pub max_cpus: f64,

    #[arg(long, default_value = "512")]
    pub max_memory_mb: u64,

    #[arg(long, default_value = "256")]
    pub max_pids: u32,

    #[arg(long, default_value = "1800")]
    pub max_session_timeout_secs: u64,

    #[arg(long, default_value = "256")]
    pub max_tmp_size_mb: u64,

    /// Permit sandboxes with network access
    #[arg(long)]
    pub allow_network: bool,

    /// Rate-limit window in seconds
    #[arg(long, default_value = "60")]
    pub rate_limit_window_secs: u64,

    /// Connection attempts allowed per IP per window
    #[arg(long, default_value = "5")]
    pub rate_limit_max: u32,

    /// Session marker TTL in seconds
    #[arg(long, default_value = "900")]
    pub session_ttl_secs: u64,

    /// Idle time after which a session marker counts as abandoned
    #[arg(long, default_value = "300")]
    pub inactivity_secs: u64,

    /// How often live sessions refresh their marker
    #[arg(long, default_value = "30")]
    pub activity_interval_secs: u64,

    /// Outcome of a session check when the ledger is unreachable
    #[arg(long, value_enum, default_value_t = LedgerFailurePolicy::FailOpen)]
    pub session_check: LedgerFailurePolicy,

    #[arg(long, default_value = "20")]
    pub min_cols: u16,

    #[arg(long, default_value = "500")]
    pub max_cols: u16,

    #[arg(long, default_value = "5")]
    pub min_rows: u16,

    #[arg(long, default_value = "100")]
    pub max_rows: u16,

    /// Seconds between sweeps for expired sandboxes
    #[arg(long, default_value = "60")]
    pub sweep_interval_secs: u64,

    /// Ledger backend
    #[arg(long, env = "LEDGER", value_enum, default_value_t = LedgerKind::Memory)]
    pub ledger: LedgerKind,

    /// Base URL of the HTTP ledger
    #[arg(long, env = "LEDGER_URL")]
    pub ledger_url: Option<String>,

    /// Bearer token for the HTTP ledger
    #[arg(long, env = "LEDGER_TOKEN", hide_env_values = true)]
    pub ledger_token: Option<String>,

    /// Directory holding isolate sandbox roots
    #[arg(long, default_value = "/run/sandterm")]
    pub isolate_root: PathBuf,

    /// cgroup v2 directory for isolate sandboxes
    #[arg(long, default_value = "/sys/fs/cgroup/sandterm")]
    pub cgroup_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerBackend {
    Memory,
    Http { url: String, token: Option<String> },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub origin_secret: Option<String>,
    pub runtime: RuntimeKind,
    pub docker_bin: String,
    pub shell: Vec<String>,
    pub defaults: SandboxDefaults,
    pub caps: SandboxCaps,
    pub rate: RatePolicy,
    pub sessions: SessionPolicy,
    pub bounds: DimensionBounds,
    pub sweep_interval: Duration,
    pub ledger: LedgerBackend,
    pub isolate_root: PathBuf,
    pub cgroup_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
            origin_secret: None,
            runtime: RuntimeKind::Docker,
            docker_bin: "docker".to_string(),
            shell: vec!["/bin/sh".to_string()],
            defaults: SandboxDefaults::default(),
            caps: SandboxCaps::default(),
            rate: RatePolicy::default(),
            sessions: SessionPolicy::default(),
            bounds: DimensionBounds::default(),
            sweep_interval: Duration::from_secs(60),
            ledger: LedgerBackend::Memory,
            isolate_root: PathBuf::from("/run/sandterm"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/sandterm"),
        }
    }
}

fn positive_u64(field: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::NotPositive { field });
    }
    Ok(value)
}

fn positive_f64(field: &'static str, value: f64) -> Result<f64, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::NotPositive { field });
    }
    Ok(value)
}

fn within_cap<T: PartialOrd + ToString>(field: &'static str, default: T, cap: T) -> Result<(), ConfigError> {
    if default > cap {
        return Err(ConfigError::DefaultAboveCap {
            field,
            default: default.to_string(),
            cap: cap.to_string(),
        });
    }
    Ok(())
}

impl TryFrom<ServeArgs> for Config {
    type Error = ConfigError;

    fn try_from(args: ServeArgs) -> Result<Self, ConfigError> {
        let secs = |field, v| positive_u64(field, v).map(Duration::from_secs);

        let defaults = SandboxDefaults {
            image: args.image,
            cpus: positive_f64("cpus", args.cpus)?,
            memory_bytes: positive_u64("memory_mb", args.memory_mb)? * MIB,
            pids_limit: positive_u64("pids_limit", args.pids_limit as u64)? as u32,
            network: args.network,
            timeout: secs("session_timeout_secs", args.session_timeout_secs)?,
            tmp_size_bytes: positive_u64("tmp_size_mb", args.tmp_size_mb)? * MIB,
        };
        if defaults.image.trim().is_empty() {
            return Err(ConfigError::Inconsistent("image must not be empty".into()));
        }

        let caps = SandboxCaps {
            max_cpus: positive_f64("max_cpus", args.max_cpus)?,
            max_memory_bytes: positive_u64("max_memory_mb", args.max_memory_mb)? * MIB,
            max_pids: positive_u64("max_pids", args.max_pids as u64)? as u32,
            max_timeout: secs("max_session_timeout_secs", args.max_session_timeout_secs)?,
            max_tmp_size_bytes: positive_u64("max_tmp_size_mb", args.max_tmp_size_mb)? * MIB,
            allow_network: args.allow_network,
        };
        within_cap("cpus", defaults.cpus, caps.max_cpus)?;
        within_cap("memory_mb", args.memory_mb, args.max_memory_mb)?;
        within_cap("pids_limit", defaults.pids_limit, caps.max_pids)?;
        within_cap("session_timeout_secs", args.session_timeout_secs, args.max_session_timeout_secs)?;
        within_cap("tmp_size_mb", args.tmp_size_mb, args.max_tmp_size_mb)?;
        if defaults.network == NetworkMode::Bridge && !caps.allow_network {
            return Err(ConfigError::Inconsistent(
                "--network bridge requires --allow-network".into(),
            ));
        }

        let rate = RatePolicy {
            window: secs("rate_limit_window_secs", args.rate_limit_window_secs)?,
            max_per_window: positive_u64("rate_limit_max", args.rate_limit_max as u64)? as u32,
        };

        let sessions = SessionPolicy {
            ttl: secs("session_ttl_secs", args.session_ttl_secs)?,
            inactivity_threshold: secs("inactivity_secs", args.inactivity_secs)?,
            activity_interval: secs("activity_interval_secs", args.activity_interval_secs)?,
            on_ledger_failure: args.session_check,
        };
        if sessions.activity_interval >= sessions.inactivity_threshold {
            return Err(ConfigError::Inconsistent(
                "activity interval must be shorter than the inactivity threshold".into(),
            ));
        }

        let bounds = DimensionBounds {
            min_cols: args.min_cols,
            max_cols: args.max_cols,
            min_rows: args.min_rows,
            max_rows: args.max_rows,
        };
        if !bounds.is_valid() {
            return Err(ConfigError::Bounds(format!(
                "cols {}..={}, rows {}..={}",
                bounds.min_cols, bounds.max_cols, bounds.min_rows, bounds.max_rows
            )));
        }

        let ledger = match args.ledger {
            LedgerKind::Memory => LedgerBackend::Memory,
            LedgerKind::Http => LedgerBackend::Http {
                url: args
                    .ledger_url
                    .filter(|u| !u.trim().is_empty())
                    .ok_or(ConfigError::MissingLedgerUrl)?,
                token: args.ledger_token,
            },
        };

        let shell: Vec<String> = args.shell.split_whitespace().map(String::from).collect();
        if shell.is_empty() {
            return Err(ConfigError::Inconsistent("shell must not be empty".into()));
        }

        Ok(Config {
            listen: SocketAddr::new(args.bind, args.port),
            origin_secret: args.origin_secret.filter(|s| !s.is_empty()),
            runtime: args.runtime,
            docker_bin: args.docker_bin,
            shell,
            defaults,
            caps,
            rate,
            sessions,
            bounds,
            sweep_interval: secs("sweep_interval_secs", args.sweep_interval_secs)?,
            ledger,
            isolate_root: args.isolate_root,
            cgroup_root: args.cgroup_root,
        })
    }
}

impl Config {
    /// Age at which the sweep reaps a sandbox.
    pub fn sweep_max_age(&self) -> Duration {
        self.defaults.timeout + SWEEP_GRACE
    }

    pub fn build_runtime(&self) -> std::io::Result<Arc<dyn SandboxRuntime>> {
        Ok(match self.runtime {
            RuntimeKind::Docker => Arc::new(DockerRuntime::new(self.docker_bin.clone())),
            RuntimeKind::Isolate => Arc::new(IsolateRuntime::new(
                self.isolate_root.clone(),
                self.cgroup_root.clone(),
                std::env::current_exe()?,
            )),
        })
    }

    pub fn build_ledger(&self) -> Result<Arc<dyn Ledger>, LedgerError> {
        Ok(match &self.ledger {
            LedgerBackend::Memory => Arc::new(MemoryLedger::new()),
            LedgerBackend::Http { url, token } => Arc::new(HttpLedger::new(url.clone(), token.clone())?),
        })
    }
}
