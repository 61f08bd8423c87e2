//! Shared application state and live terminal sessions.

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::gateway::SessionGateway;
use crate::ledger::Ledger;
use crate::sandbox::{SandboxManager, SandboxRuntime};
use crate::terminal::{Dimensions, SessionState};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;

/// A connected terminal client.
#[derive(Debug, Clone)]
pub struct LiveSession {
    pub request_id: String,
    pub user_id: String,
    pub client_ip: String,
    pub sandbox: Option<String>,
    pub dimensions: Dimensions,
    pub state: SessionState,
    pub connected_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveSessionSummary {
    pub request_id: String,
    pub user_id: String,
    pub client_ip: String,
    pub sandbox: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub state: SessionState,
    pub uptime_secs: u64,
}

impl From<&LiveSession> for LiveSessionSummary {
    fn from(s: &LiveSession) -> Self {
        Self {
            request_id: s.request_id.clone(),
            user_id: s.user_id.clone(),
            client_ip: s.client_ip.clone(),
            sandbox: s.sandbox.clone(),
            cols: s.dimensions.cols,
            rows: s.dimensions.rows,
            state: s.state,
            uptime_secs: s.connected_at.elapsed().as_secs(),
        }
    }
}

/// Thread-safe live-session storage keyed by a server-assigned session id.
pub type LiveSessions = Arc<RwLock<HashMap<String, LiveSession>>>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub lifecycle: Arc<SandboxManager>,
    pub gateway: Arc<SessionGateway>,
    pub ledger: Arc<dyn Ledger>,
    pub sessions: LiveSessions,
    pub started_at: Instant,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(config: Config, runtime: Arc<dyn SandboxRuntime>, ledger: Arc<dyn Ledger>) -> Self {
        Self::with_clock(config, runtime, ledger, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: Config,
        runtime: Arc<dyn SandboxRuntime>,
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let lifecycle = SandboxManager::new(runtime, config.defaults.clone(), config.caps.clone());
        let gateway = SessionGateway::new(ledger.clone(), clock, config.rate, config.sessions);
        let (shutdown, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            lifecycle: Arc::new(lifecycle),
            gateway: Arc::new(gateway),
            ledger,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            started_at: Instant::now(),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Receiver that flips to `true` once shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Tell every live session to close.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn update_session<F: FnOnce(&mut LiveSession)>(&self, session_id: &str, f: F) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            f(session);
        }
    }
}
