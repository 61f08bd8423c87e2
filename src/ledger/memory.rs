//! In-process ledger backend.

use super::Ledger;
use crate::error::LedgerError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Ledger kept in this process. Suitable for a single terminal host; the
/// HTTP backend is used when several hosts share admission state.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn get(&self, key: &str) -> Result<Option<String>, LedgerError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(e) if e.expires_at > now => return Ok(Some(e.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: evict lazily.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), LedgerError> {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), LedgerError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
