//! Connection admission: per-IP fixed-window rate limiting and single active
//! session per user, both backed by the shared ledger.

use crate::clock::Clock;
use crate::error::{AdmissionError, LedgerError};
use crate::ledger::{rate_limit_key, session_key, Ledger};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Fixed-window limit on connection attempts per client IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub window: Duration,
    pub max_per_window: u32,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_per_window: 5,
        }
    }
}

/// What to do with a session check when the ledger cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LedgerFailurePolicy {
    /// Treat the user as having no session (availability first).
    #[default]
    FailOpen,
    /// Treat the user as already connected (strict single-session).
    FailClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Expiry of the marker in the ledger, refreshed on activity.
    pub ttl: Duration,
    /// Markers idle longer than this are considered abandoned.
    pub inactivity_threshold: Duration,
    /// How often a live session refreshes its marker.
    pub activity_interval: Duration,
    pub on_ledger_failure: LedgerFailurePolicy,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15 * 60),
            inactivity_threshold: Duration::from_secs(5 * 60),
            activity_interval: Duration::from_secs(30),
            on_ledger_failure: LedgerFailurePolicy::FailOpen,
        }
    }
}

/// Outcome of a rate-limit check. `reset_at` is in Unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitWindow {
    count: u32,
    window_start: u64,
}

/// Ledger record for a connected user. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMarker {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "clientIP")]
    pub client_ip: String,
    #[serde(rename = "connectedAt")]
    pub connected_at: u64,
    #[serde(rename = "lastActivity")]
    pub last_activity: u64,
}

pub struct SessionGateway {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    rate: RatePolicy,
    sessions: SessionPolicy,
}

impl SessionGateway {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
        rate: RatePolicy,
        sessions: SessionPolicy,
    ) -> Self {
        Self {
            ledger,
            clock,
            rate,
            sessions,
        }
    }

    pub fn session_policy(&self) -> &SessionPolicy {
        &self.sessions
    }

    /// Count a connection attempt from `client_ip` against its window.
    ///
    /// A denied attempt does not consume budget. Ledger failures admit the
    /// attempt.
    pub async fn check_rate_limit(&self, client_ip: &str) -> RateLimitDecision {
        let now = self.clock.now_secs();
        let window_secs = self.rate.window.as_secs();

        match self.try_check_rate_limit(client_ip, now, window_secs).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(client_ip, error = %e, "Rate limit check failed, allowing");
                RateLimitDecision {
                    allowed: true,
                    remaining: 1,
                    reset_at: now + window_secs,
                }
            }
        }
    }

    async fn try_check_rate_limit(
        &self,
        client_ip: &str,
        now: u64,
        window_secs: u64,
    ) -> Result<RateLimitDecision, LedgerError> {
        let key = rate_limit_key(client_ip);

        let mut window = RateLimitWindow {
            count: 0,
            window_start: now,
        };
        if let Some(raw) = self.ledger.get(&key).await? {
            let stored: RateLimitWindow = serde_json::from_str(&raw)
                .map_err(|source| LedgerError::Decode { key: key.clone(), source })?;
            if now.saturating_sub(stored.window_start) < window_secs {
                window = stored;
            }
        }

        let reset_at = window.window_start + window_secs;
        if window.count >= self.rate.max_per_window {
            debug!(client_ip, count = window.count, "Rate limit exceeded");
            return Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at,
            });
        }

        window.count += 1;
        let encoded = serde_json::to_string(&window)
            .map_err(|source| LedgerError::Decode { key: key.clone(), source })?;
        self.ledger.put(&key, encoded, self.rate.window).await?;

        Ok(RateLimitDecision {
            allowed: true,
            remaining: self.rate.max_per_window - window.count,
            reset_at,
        })
    }

    /// Whether `user_id` holds a live session marker. Stale markers are
    /// deleted and reported as absent.
    pub async fn has_active_session(&self, user_id: &str) -> bool {
        match self.try_has_active_session(user_id).await {
            Ok(active) => active,
            Err(e) => {
                let active = self.sessions.on_ledger_failure == LedgerFailurePolicy::FailClosed;
                error!(user_id, error = %e, assume_active = active, "Session check failed");
                active
            }
        }
    }

    async fn try_has_active_session(&self, user_id: &str) -> Result<bool, LedgerError> {
        let key = session_key(user_id);
        let Some(raw) = self.ledger.get(&key).await? else {
            return Ok(false);
        };
        let marker: SessionMarker = serde_json::from_str(&raw)
            .map_err(|source| LedgerError::Decode { key: key.clone(), source })?;

        let idle = self.clock.now_millis().saturating_sub(marker.last_activity);
        if idle > self.sessions.inactivity_threshold.as_millis() as u64 {
            info!(user_id, idle_ms = idle, "Removing stale session marker");
            self.ledger.delete(&key).await?;
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn get_session(&self, user_id: &str) -> Result<Option<SessionMarker>, LedgerError> {
        let key = session_key(user_id);
        match self.ledger.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| LedgerError::Decode { key, source }),
            None => Ok(None),
        }
    }

    pub async fn create_session(&self, user_id: &str, client_ip: &str) -> Result<(), LedgerError> {
        let now = self.clock.now_millis();
        let marker = SessionMarker {
            user_id: user_id.to_string(),
            client_ip: client_ip.to_string(),
            connected_at: now,
            last_activity: now,
        };
        self.put_marker(&marker).await
    }

    /// Refresh `lastActivity` and the marker's TTL. Missing markers are left
    /// absent; failures are logged.
    pub async fn update_activity(&self, user_id: &str) {
        let result = async {
            if let Some(mut marker) = self.get_session(user_id).await? {
                marker.last_activity = self.clock.now_millis();
                self.put_marker(&marker).await?;
            }
            Ok::<_, LedgerError>(())
        }
        .await;

        if let Err(e) = result {
            warn!(user_id, error = %e, "Session activity update failed");
        }
    }

    pub async fn delete_session(&self, user_id: &str) -> Result<(), LedgerError> {
        self.ledger.delete(&session_key(user_id)).await
    }

    async fn put_marker(&self, marker: &SessionMarker) -> Result<(), LedgerError> {
        let key = session_key(&marker.user_id);
        let encoded = serde_json::to_string(marker)
            .map_err(|source| LedgerError::Decode { key: key.clone(), source })?;
        self.ledger.put(&key, encoded, self.sessions.ttl).await
    }

    /// Admit a new terminal connection: the IP must be within its rate limit
    /// and the user must not already hold a session. On success the user's
    /// marker has been written.
    pub async fn admit(
        &self,
        user_id: &str,
        client_ip: &str,
    ) -> Result<RateLimitDecision, AdmissionError> {
        let decision = self.check_rate_limit(client_ip).await;
        if !decision.allowed {
            let retry_after_secs = decision.reset_at.saturating_sub(self.clock.now_secs());
            return Err(AdmissionError::RateLimited {
                reset_at: decision.reset_at,
                retry_after_secs,
            });
        }

        match self.try_has_active_session(user_id).await {
            Ok(false) => {}
            Ok(true) => return Err(AdmissionError::SessionActive),
            Err(e) if self.sessions.on_ledger_failure == LedgerFailurePolicy::FailClosed => {
                error!(user_id, error = %e, "Session check failed, rejecting");
                return Err(AdmissionError::LedgerUnavailable);
            }
            Err(e) => warn!(user_id, error = %e, "Session check failed, admitting"),
        }

        if let Err(e) = self.create_session(user_id, client_ip).await {
            if self.sessions.on_ledger_failure == LedgerFailurePolicy::FailClosed {
                error!(user_id, error = %e, "Could not record session, rejecting");
                return Err(AdmissionError::LedgerUnavailable);
            }
            warn!(user_id, error = %e, "Could not record session, admitting anyway");
        }

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::MemoryLedger;
    use async_trait::async_trait;

    const T0: u64 = 1_700_000_000_000;

    fn gateway(clock: Arc<ManualClock>) -> (SessionGateway, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        let gw = SessionGateway::new(
            ledger.clone(),
            clock,
            RatePolicy::default(),
            SessionPolicy::default(),
        );
        (gw, ledger)
    }

    struct DownLedger;

    #[async_trait]
    impl Ledger for DownLedger {
        async fn get(&self, _key: &str) -> Result<Option<String>, LedgerError> {
            Err(LedgerError::Unreachable("connection refused".into()))
        }
        async fn put(&self, _: &str, _: String, _: Duration) -> Result<(), LedgerError> {
            Err(LedgerError::Unreachable("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> Result<(), LedgerError> {
            Err(LedgerError::Unreachable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_fixed_window_allows_five_then_denies() {
        let clock = Arc::new(ManualClock::new(T0));
        let (gw, _) = gateway(clock.clone());

        for i in 0..5 {
            let d = gw.check_rate_limit("10.0.0.1").await;
            assert!(d.allowed, "attempt {} should pass", i + 1);
            assert_eq!(d.remaining, 4 - i);
            clock.advance(Duration::from_secs(1));
        }

        let sixth = gw.check_rate_limit("10.0.0.1").await;
        assert!(!sixth.allowed);
        assert_eq!(sixth.remaining, 0);
        assert_eq!(sixth.reset_at, T0 / 1000 + 60);

        // Window elapsed: fresh budget.
        clock.set(T0 + 60_000);
        let seventh = gw.check_rate_limit("10.0.0.1").await;
        assert!(seventh.allowed);
        assert_eq!(seventh.remaining, 4);
    }

    #[tokio::test]
    async fn test_denied_attempts_do_not_extend_window() {
        let clock = Arc::new(ManualClock::new(T0));
        let (gw, ledger) = gateway(clock.clone());

        for _ in 0..8 {
            gw.check_rate_limit("10.0.0.2").await;
        }
        let raw = ledger.get("ratelimit:10.0.0.2").await.unwrap().unwrap();
        let window: RateLimitWindow = serde_json::from_str(&raw).unwrap();
        assert_eq!(window.count, 5);
        assert_eq!(window.window_start, T0 / 1000);
    }

    #[tokio::test]
    async fn test_rate_limit_is_per_ip() {
        let clock = Arc::new(ManualClock::new(T0));
        let (gw, _) = gateway(clock);

        for _ in 0..5 {
            assert!(gw.check_rate_limit("10.0.0.3").await.allowed);
        }
        assert!(!gw.check_rate_limit("10.0.0.3").await.allowed);
        assert!(gw.check_rate_limit("10.0.0.4").await.allowed);
    }

    #[tokio::test]
    async fn test_rate_limit_fails_open() {
        let gw = SessionGateway::new(
            Arc::new(DownLedger),
            Arc::new(ManualClock::new(T0)),
            RatePolicy::default(),
            SessionPolicy::default(),
        );
        for _ in 0..10 {
            assert!(gw.check_rate_limit("10.0.0.5").await.allowed);
        }
    }

    #[tokio::test]
    async fn test_session_check_policy_on_ledger_failure() {
        let open = SessionGateway::new(
            Arc::new(DownLedger),
            Arc::new(ManualClock::new(T0)),
            RatePolicy::default(),
            SessionPolicy::default(),
        );
        assert!(!open.has_active_session("u1").await);

        let closed = SessionGateway::new(
            Arc::new(DownLedger),
            Arc::new(ManualClock::new(T0)),
            RatePolicy::default(),
            SessionPolicy {
                on_ledger_failure: LedgerFailurePolicy::FailClosed,
                ..SessionPolicy::default()
            },
        );
        assert!(closed.has_active_session("u1").await);
        assert_eq!(
            closed.admit("u1", "10.0.0.6").await,
            Err(AdmissionError::LedgerUnavailable)
        );
        // Fail-open admits even though the marker cannot be written.
        assert!(open.admit("u1", "10.0.0.6").await.is_ok());
    }

    #[tokio::test]
    async fn test_single_session_per_user() {
        let clock = Arc::new(ManualClock::new(T0));
        let (gw, _) = gateway(clock.clone());

        gw.admit("alice", "10.0.0.7").await.unwrap();
        assert_eq!(
            gw.admit("alice", "10.0.0.8").await,
            Err(AdmissionError::SessionActive)
        );
        // Other users are unaffected.
        gw.admit("bob", "10.0.0.8").await.unwrap();

        gw.delete_session("alice").await.unwrap();
        gw.admit("alice", "10.0.0.8").await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_marker_is_reaped() {
        let clock = Arc::new(ManualClock::new(T0));
        let (gw, ledger) = gateway(clock.clone());

        gw.create_session("carol", "10.0.0.9").await.unwrap();
        clock.advance(Duration::from_secs(5 * 60));
        assert!(gw.has_active_session("carol").await, "exactly at threshold is live");

        clock.advance(Duration::from_secs(1));
        assert!(!gw.has_active_session("carol").await);
        assert_eq!(ledger.get("session:carol").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_activity_keeps_marker_live() {
        let clock = Arc::new(ManualClock::new(T0));
        let (gw, _) = gateway(clock.clone());

        gw.create_session("dave", "10.0.0.10").await.unwrap();
        clock.advance(Duration::from_secs(4 * 60));
        gw.update_activity("dave").await;
        clock.advance(Duration::from_secs(4 * 60));

        assert!(gw.has_active_session("dave").await);
        let marker = gw.get_session("dave").await.unwrap().unwrap();
        assert_eq!(marker.connected_at, T0);
        assert_eq!(marker.last_activity, T0 + 4 * 60 * 1000);
        assert_eq!(marker.client_ip, "10.0.0.10");
    }

    #[tokio::test]
    async fn test_update_activity_does_not_resurrect() {
        let clock = Arc::new(ManualClock::new(T0));
        let (gw, _) = gateway(clock);

        gw.update_activity("erin").await;
        assert_eq!(gw.get_session("erin").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_admit_rate_limited_reports_retry_after() {
        let clock = Arc::new(ManualClock::new(T0));
        let (gw, _) = gateway(clock.clone());

        for i in 0..5 {
            gw.admit(&format!("user{i}"), "10.0.0.11").await.unwrap();
        }
        clock.advance(Duration::from_secs(20));
        match gw.admit("user5", "10.0.0.11").await {
            Err(AdmissionError::RateLimited {
                reset_at,
                retry_after_secs,
            }) => {
                assert_eq!(reset_at, T0 / 1000 + 60);
                assert_eq!(retry_after_secs, 40);
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
    }

    #[test]
    fn test_marker_wire_format() {
        let marker = SessionMarker {
            user_id: "u".into(),
            client_ip: "1.2.3.4".into(),
            connected_at: 1,
            last_activity: 2,
        };
        let json = serde_json::to_value(&marker).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "userId": "u",
                "clientIP": "1.2.3.4",
                "connectedAt": 1,
                "lastActivity": 2
            })
        );
    }
}
