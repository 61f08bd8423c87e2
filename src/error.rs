//! Error types shared across the sandbox, ledger, gateway and terminal layers.

use std::io;
use thiserror::Error;

/// Failure reported by a sandbox runtime backend.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The runtime's helper program could not be started at all.
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The helper program ran but reported failure.
    #[error("`{program}` exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    /// Host-side setup (mounts, cgroups, directories) failed.
    #[error("sandbox setup failed: {0}")]
    Setup(String),

    /// The blocking task driving the runtime call panicked or was cancelled.
    #[error("runtime task failed: {0}")]
    Join(String),
}

/// Why `provision` refused or failed to create a sandbox.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),

    #[error("runtime failed to create sandbox {name}: {source}")]
    Runtime {
        name: String,
        #[source]
        source: RuntimeError,
    },
}

/// Errors talking to the shared rate/session ledger.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger unreachable: {0}")]
    Unreachable(String),

    #[error("ledger returned HTTP {status} for {key}")]
    Status { status: u16, key: String },

    #[error("malformed ledger record for {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Rejection of a terminal connection before any sandbox exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("missing or invalid origin secret")]
    Unauthorized,

    #[error("missing user id")]
    MissingUser,

    #[error("too many connection attempts; retry in {retry_after_secs}s")]
    RateLimited { reset_at: u64, retry_after_secs: u64 },

    #[error("a terminal session is already active for this user")]
    SessionActive,

    #[error("session ledger unavailable")]
    LedgerUnavailable,
}

/// Errors raised while attaching to or driving a pty.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("pty error: {0}")]
    Pty(String),

    #[error("pty I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("terminal session already closed")]
    Closed,
}

/// Invalid operator configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be positive")]
    NotPositive { field: &'static str },

    #[error("{field}: default {default} exceeds cap {cap}")]
    DefaultAboveCap {
        field: &'static str,
        default: String,
        cap: String,
    },

    #[error("dimension bounds are inverted or zero: {0}")]
    Bounds(String),

    #[error("--ledger-url is required for the http ledger")]
    MissingLedgerUrl,

    #[error("inconsistent settings: {0}")]
    Inconsistent(String),
}
