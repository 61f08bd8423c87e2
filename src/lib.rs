//! sandterm: interactive shells in throwaway sandboxes, streamed over
//! WebSocket.
//!
//! A connection passes the [`gateway`] (origin secret, per-IP rate limit,
//! one session per user), gets a fresh sandbox from the
//! [`sandbox::SandboxManager`], and is bridged to a pty shell inside it by
//! [`terminal`]. Whichever side ends first tears down the other.

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http_server;
pub mod ledger;
pub mod sandbox;
pub mod state;
pub mod terminal;

pub use config::Config;
pub use state::AppState;
