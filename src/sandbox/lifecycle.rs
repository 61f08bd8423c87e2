//! Sandbox lifecycle: provisioning, teardown and the TTL sweep.
//!
//! The registry here is the source of truth for which sandboxes exist. The
//! runtime is only asked to create or remove; its own view is never trusted
//! for bookkeeping because the two can diverge under failure.

use super::{
    generate_name, SandboxCaps, SandboxConfig, SandboxDefaults, SandboxHandle, SandboxOverrides,
    SandboxRuntime,
};
use crate::error::ProvisionError;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Thread-safe sandbox registry keyed by sandbox name.
pub type Sandboxes = Arc<RwLock<HashMap<String, SandboxHandle>>>;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SandboxStats {
    pub active: usize,
    pub by_user: BTreeMap<String, usize>,
}

pub struct SandboxManager {
    runtime: Arc<dyn SandboxRuntime>,
    defaults: SandboxDefaults,
    caps: SandboxCaps,
    sandboxes: Sandboxes,
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, defaults: SandboxDefaults, caps: SandboxCaps) -> Self {
        Self {
            runtime,
            defaults,
            caps,
            sandboxes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn SandboxRuntime> {
        &self.runtime
    }

    /// Create a sandbox for `user_id` and register it.
    ///
    /// Nothing is registered unless the runtime reports success.
    pub async fn provision(
        &self,
        user_id: &str,
        overrides: &SandboxOverrides,
    ) -> Result<SandboxHandle, ProvisionError> {
        let config = SandboxConfig::resolve(user_id, &self.defaults, &self.caps, overrides)?;
        let name = generate_name(user_id);

        info!(
            sandbox = %name,
            user_id,
            runtime = self.runtime.name(),
            cpus = config.cpus,
            memory_bytes = config.memory_bytes,
            pids_limit = config.pids_limit,
            network = config.network.as_str(),
            "Provisioning sandbox"
        );

        self.runtime
            .create(&name, &config)
            .await
            .map_err(|source| ProvisionError::Runtime {
                name: name.clone(),
                source,
            })?;

        let handle = SandboxHandle {
            name: name.clone(),
            user_id: user_id.to_string(),
            config,
            process_id: None,
            created_at: Instant::now(),
            created_at_unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        };
        self.sandboxes.write().await.insert(name, handle.clone());
        Ok(handle)
    }

    /// Record the shell process attached to `name`.
    pub async fn mark_attached(&self, name: &str, process_id: Option<u32>) {
        if let Some(handle) = self.sandboxes.write().await.get_mut(name) {
            handle.process_id = process_id;
        }
    }

    /// Force-remove `name`. The registry entry is dropped even if the runtime
    /// fails; calling this twice is harmless.
    pub async fn destroy(&self, name: &str) {
        if let Err(e) = self.runtime.remove(name).await {
            error!(sandbox = %name, error = %e, "Failed to remove sandbox, dropping registry entry anyway");
        }
        if self.sandboxes.write().await.remove(name).is_some() {
            info!(sandbox = %name, "Sandbox destroyed");
        }
    }

    /// Destroy every sandbox at least `max_age` old. Returns how many were
    /// destroyed.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let expired: Vec<String> = self
            .sandboxes
            .read()
            .await
            .values()
            .filter(|h| h.age() >= max_age)
            .map(|h| h.name.clone())
            .collect();

        for name in &expired {
            warn!(sandbox = %name, "Reaping sandbox past its lifetime");
            self.destroy(name).await;
        }
        expired.len()
    }

    /// Destroy everything; used on server shutdown.
    pub async fn destroy_all(&self) -> usize {
        let names: Vec<String> = self.sandboxes.read().await.keys().cloned().collect();
        for name in &names {
            self.destroy(name).await;
        }
        names.len()
    }

    pub async fn get(&self, name: &str) -> Option<SandboxHandle> {
        self.sandboxes.read().await.get(name).cloned()
    }

    pub async fn list_by_user(&self, user_id: &str) -> Vec<SandboxHandle> {
        let mut handles: Vec<SandboxHandle> = self
            .sandboxes
            .read()
            .await
            .values()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect();
        handles.sort_by_key(|h| h.created_at);
        handles
    }

    pub async fn list(&self) -> Vec<SandboxHandle> {
        let mut handles: Vec<SandboxHandle> = self.sandboxes.read().await.values().cloned().collect();
        handles.sort_by_key(|h| h.created_at);
        handles
    }

    pub async fn len(&self) -> usize {
        self.sandboxes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> SandboxStats {
        let sandboxes = self.sandboxes.read().await;
        let mut by_user = BTreeMap::new();
        for handle in sandboxes.values() {
            *by_user.entry(handle.user_id.clone()).or_insert(0) += 1;
        }
        SandboxStats {
            active: sandboxes.len(),
            by_user,
        }
    }
}
