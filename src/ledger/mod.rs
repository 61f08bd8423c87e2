//! Shared key-value ledger holding rate-limit windows and session markers.
//!
//! The ledger is treated as external storage: every call may fail, and
//! callers decide per policy whether a failure admits or rejects.

mod http;
mod memory;

pub use http::HttpLedger;
pub use memory::MemoryLedger;

use crate::error::LedgerError;
use async_trait::async_trait;
use std::time::Duration;

/// Key/value store with per-key expiry.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Fetch a live value; expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>, LedgerError>;

    /// Store `value` under `key`, replacing any previous value and expiry.
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), LedgerError>;

    /// Remove `key`. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), LedgerError>;

    /// Drop expired entries held locally. Returns how many were removed.
    /// Stores that expire keys themselves have nothing to do.
    async fn purge_expired(&self) -> usize {
        0
    }
}

pub fn rate_limit_key(client_ip: &str) -> String {
    format!("ratelimit:{}", client_ip)
}

pub fn session_key(user_id: &str) -> String {
    format!("session:{}", user_id)
}
