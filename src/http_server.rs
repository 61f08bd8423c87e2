//! HTTP server implementation using Axum.
//!
//! `GET /terminal` upgrades to a WebSocket carrying one sandboxed shell.
//! Admission and provisioning happen before the upgrade, so a rejected
//! client never causes a sandbox to be created.

use crate::error::AdmissionError;
use crate::gateway::SessionGateway;
use crate::sandbox::{SandboxHandle, SandboxOverrides, SandboxStats, SandboxSummary};
use crate::state::{AppState, LiveSession, LiveSessionSummary};
use crate::terminal::{
    self, parse_requested_dimensions, Dimensions, RelayContext, SessionState, SessionTeardown,
};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Instrument};

pub const ORIGIN_SECRET_HEADER: &str = "x-origin-secret";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const CLIENT_IP_HEADER: &str = "x-client-ip";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// How long shutdown waits for sessions to say goodbye.
const SESSION_DRAIN: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    sessions: usize,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct StatsResponse {
    runtime: &'static str,
    sessions: Vec<LiveSessionSummary>,
    sandboxes: SandboxStats,
}

#[derive(Deserialize)]
struct SandboxQuery {
    user_id: Option<String>,
}

impl AdmissionError {
    fn status_code(&self) -> StatusCode {
        match self {
            AdmissionError::Unauthorized => StatusCode::UNAUTHORIZED,
            AdmissionError::MissingUser => StatusCode::BAD_REQUEST,
            AdmissionError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AdmissionError::SessionActive => StatusCode::CONFLICT,
            AdmissionError::LedgerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        if let AdmissionError::RateLimited {
            reset_at,
            retry_after_secs,
        } = &self
        {
            headers.insert("retry-after", HeaderValue::from(*retry_after_secs));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(0u32));
            headers.insert("x-ratelimit-reset", HeaderValue::from(*reset_at));
        }
        (self.status_code(), headers, self.to_string()).into_response()
    }
}

/// Build the router with all routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/terminal", get(terminal))
        .route("/terminal/", get(terminal))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/sandboxes", get(list_sandboxes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on `listener` until `shutdown` resolves, then close every session
/// and destroy every sandbox.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let sweeper = spawn_sweeper(state.clone());
    let app = router(state.clone());

    let signal_state = state.clone();
    let result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutting down...");
            signal_state.begin_shutdown();
        })
        .await;

    // Upgraded connections are not tracked by axum; give them a moment to
    // send their close frames.
    state.begin_shutdown();
    let deadline = Instant::now() + SESSION_DRAIN;
    while !state.sessions.read().await.is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    sweeper.abort();
    let destroyed = state.lifecycle.destroy_all().await;
    if destroyed > 0 {
        info!(destroyed, "Destroyed remaining sandboxes");
    }
    result
}

/// Bind `addr` and serve until SIGINT or SIGTERM.
pub async fn run_server(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(
        "Terminal server listening on {} ({} runtime, session timeout {}s)",
        listener.local_addr()?,
        state.lifecycle.runtime().name(),
        state.config.defaults.timeout.as_secs()
    );
    if state.config.origin_secret.is_none() {
        warn!("No origin secret configured; any caller can open terminals");
    }
    serve(listener, state, shutdown_signal()).await
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// Periodically reap sandboxes past their lifetime, independent of any
/// session.
pub fn spawn_sweeper(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let max_age = state.config.sweep_max_age();
        let mut ticker = interval(state.config.sweep_interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let reaped = state.lifecycle.sweep(max_age).await;
            if reaped > 0 {
                info!(reaped, "Cleaned up stale sandboxes");
            }
            let purged = state.ledger.purge_expired().await;
            if purged > 0 {
                info!(purged, "Purged expired ledger entries");
            }
        }
    })
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Compare without an early exit on the first differing byte.
fn secrets_match(expected: &str, given: &str) -> bool {
    let (a, b) = (expected.as_bytes(), given.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn check_origin(state: &AppState, headers: &HeaderMap) -> Result<(), AdmissionError> {
    match &state.config.origin_secret {
        Some(expected) => match header(headers, ORIGIN_SECRET_HEADER) {
            Some(given) if secrets_match(expected, given) => Ok(()),
            _ => Err(AdmissionError::Unauthorized),
        },
        None => Ok(()),
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.sessions.read().await.len(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let mut sessions: Vec<LiveSessionSummary> = state
        .sessions
        .read()
        .await
        .values()
        .map(LiveSessionSummary::from)
        .collect();
    sessions.sort_by(|a, b| b.uptime_secs.cmp(&a.uptime_secs));
    Json(StatsResponse {
        runtime: state.lifecycle.runtime().name(),
        sessions,
        sandboxes: state.lifecycle.stats().await,
    })
}

async fn list_sandboxes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SandboxQuery>,
) -> Result<Json<Vec<SandboxSummary>>, AdmissionError> {
    check_origin(&state, &headers)?;
    let handles = match query.user_id {
        Some(user_id) => state.lifecycle.list_by_user(&user_id).await,
        None => state.lifecycle.list().await,
    };
    Ok(Json(handles.iter().map(SandboxSummary::from).collect()))
}

async fn terminal(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let request_id = header(&headers, REQUEST_ID_HEADER)
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if let Err(e) = check_origin(&state, &headers) {
        warn!(request_id = %request_id, peer = %peer, "Unauthorized connection attempt - invalid secret");
        return e.into_response();
    }
    let Some(user_id) = header(&headers, USER_ID_HEADER).map(String::from) else {
        warn!(request_id = %request_id, "Missing user ID in request");
        return AdmissionError::MissingUser.into_response();
    };
    let client_ip = header(&headers, CLIENT_IP_HEADER)
        .map(String::from)
        .unwrap_or_else(|| peer.ip().to_string());

    if state.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server shutting down").into_response();
    }

    let span = tracing::info_span!("terminal", request_id = %request_id, user_id = %user_id);
    let dims = parse_requested_dimensions(&query, &state.config.bounds);

    // Admission writes a session marker and provisioning creates a sandbox.
    // Both run in their own task so a client hanging up mid-request cannot
    // cancel them before the teardown that releases them is armed.
    let prepare = tokio::spawn(
        prepare_session(state.clone(), user_id.clone(), client_ip, request_id.clone(), dims)
            .instrument(span.clone()),
    );
    let prepared = match prepare.await {
        Ok(Ok(prepared)) => prepared,
        Ok(Err(rejection)) => return rejection,
        Err(e) => {
            error!(request_id = %request_id, error = %e, "Session preparation task failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to start sandbox").into_response();
        }
    };

    let failed_id = request_id.clone();
    // If the upgrade never completes, dropping the callback below drops the
    // teardown, which cleans up.
    ws.on_failed_upgrade(move |e| {
        warn!(request_id = %failed_id, error = %e, "WebSocket upgrade failed");
    })
    .on_upgrade(move |socket| run_session(state, socket, prepared, user_id).instrument(span))
}

/// Everything a connection holds between admission and the upgrade.
struct PreparedSession {
    session_id: String,
    handle: SandboxHandle,
    dims: Dimensions,
    teardown: SessionTeardown,
}

async fn prepare_session(
    state: AppState,
    user_id: String,
    client_ip: String,
    request_id: String,
    dims: Dimensions,
) -> Result<PreparedSession, Response> {
    let decision = match state.gateway.admit(&user_id, &client_ip).await {
        Ok(decision) => decision,
        Err(e) => {
            warn!(client_ip = %client_ip, reason = %e, "Connection rejected");
            return Err(e.into_response());
        }
    };

    let handle = match state.lifecycle.provision(&user_id, &SandboxOverrides::default()).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "Failed to provision sandbox");
            if let Err(e) = state.gateway.delete_session(&user_id).await {
                warn!(error = %e, "Failed to release session marker");
            }
            return Err((StatusCode::SERVICE_UNAVAILABLE, "Failed to start sandbox").into_response());
        }
    };
    info!(
        client_ip = %client_ip,
        sandbox = %handle.name,
        cols = dims.cols,
        rows = dims.rows,
        remaining = decision.remaining,
        "WebSocket upgrade accepted"
    );

    // Keyed by our own id: request ids come from the client and may repeat.
    let session_id = uuid::Uuid::new_v4().to_string();
    state.sessions.write().await.insert(
        session_id.clone(),
        LiveSession {
            request_id,
            user_id: user_id.clone(),
            client_ip,
            sandbox: Some(handle.name.clone()),
            dimensions: dims,
            state: SessionState::Attaching,
            connected_at: Instant::now(),
        },
    );

    let teardown = SessionTeardown::new(
        session_id.clone(),
        user_id,
        handle.name.clone(),
        state.lifecycle.clone(),
        state.gateway.clone(),
        state.sessions.clone(),
    );
    Ok(PreparedSession {
        session_id,
        handle,
        dims,
        teardown,
    })
}

fn banner(handle: &SandboxHandle) -> String {
    format!(
        "\x1b[32m[Connected to sandbox terminal]\x1b[0m\r\n\
         \x1b[90mSandbox: {}\x1b[0m\r\n\
         \x1b[90mTimeout: {}s\x1b[0m\r\n\r\n",
        handle.name,
        handle.config.timeout.as_secs()
    )
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn spawn_heartbeat(gateway: Arc<SessionGateway>, user_id: String) -> AbortOnDrop {
    let period = gateway.session_policy().activity_interval;
    AbortOnDrop(tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            gateway.update_activity(&user_id).await;
        }
    }))
}

async fn run_session(state: AppState, mut socket: WebSocket, prepared: PreparedSession, user_id: String) {
    let PreparedSession {
        session_id,
        handle,
        dims,
        teardown,
    } = prepared;
    info!(sandbox = %handle.name, "Connection established");

    if let Err(e) = socket.send(Message::Text(banner(&handle))).await {
        warn!(error = %e, "Client went away before the shell started");
        teardown.close_once().await;
        return;
    }

    let command = state
        .lifecycle
        .runtime()
        .shell_command(&handle.name, &handle.config, &state.config.shell);
    let mut session = match terminal::attach(&handle, command, dims, &state.config.bounds) {
        Ok(session) => session,
        Err(e) => {
            error!(sandbox = %handle.name, error = %e, "Failed to attach terminal");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 1011,
                    reason: "Failed to start terminal".into(),
                })))
                .await;
            teardown.close_once().await;
            return;
        }
    };

    state.lifecycle.mark_attached(&handle.name, session.process_id()).await;
    let applied = session.dimensions();
    state
        .update_session(&session_id, |s| {
            s.state = SessionState::Active;
            s.dimensions = applied;
        })
        .await;

    let heartbeat = spawn_heartbeat(state.gateway.clone(), user_id);
    let ctx = RelayContext {
        label: session_id.clone(),
        deadline: Some(handle.created_at + handle.config.timeout),
        shutdown: Some(state.shutdown_signal()),
    };
    let reason = terminal::run(&mut session, &mut socket, ctx).await;
    drop(heartbeat);

    let final_dims = session.dimensions();
    state
        .update_session(&session_id, |s| {
            s.state = SessionState::Closing;
            s.dimensions = final_dims;
        })
        .await;
    drop(session);
    teardown.close_once().await;
    info!(reason = ?reason, "Terminal session finished");
}
