//! Relay between a pty process and a client WebSocket.
//!
//! One task drives both directions through a single `select!`, so whichever
//! side ends first decides the close reason and the other side is always torn
//! down in the same place.

use super::{ControlFrame, DimensionBounds, Dimensions, InboundFrame};
use crate::error::BridgeError;
use crate::gateway::SessionGateway;
use crate::sandbox::SandboxManager;
use crate::state::LiveSessions;
use axum::extract::ws::{CloseFrame, Message};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

/// How long buffered output is still forwarded after the process exits.
const EXIT_DRAIN: Duration = Duration::from_millis(250);
/// Pause between the timeout notice and closing, so the client can render it.
const TIMEOUT_GRACE: Duration = Duration::from_secs(1);

const TIMEOUT_NOTICE: &str = "\r\n\x1b[31m[Session timeout - disconnecting...]\x1b[0m\r\n";

/// Events produced by the pty's I/O threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Output(Vec<u8>),
    /// The process exited, with its exit code when known.
    Exited(Option<u32>),
}

/// Control half of a spawned pty process.
pub trait PtyProcess: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<(), BridgeError>;
    fn resize(&mut self, dims: Dimensions) -> Result<(), BridgeError>;
    /// Kill the process. Killing an exited process is not an error.
    fn kill(&mut self) -> Result<(), BridgeError>;
    fn process_id(&self) -> Option<u32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Attaching,
    Active,
    Closing,
    Closed,
}

/// Why a relay ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ProcessExited(Option<u32>),
    ClientClosed,
    ClientError(String),
    SendFailed(String),
    PtyFailed(String),
    Timeout,
    Shutdown,
}

impl CloseReason {
    /// Close frame to send, if the client connection is still usable.
    pub fn close_frame(&self) -> Option<(u16, &'static str)> {
        match self {
            CloseReason::ProcessExited(_) => Some((1000, "Terminal session ended")),
            CloseReason::Timeout => Some((1000, "Session timeout")),
            CloseReason::Shutdown => Some((1001, "Server shutting down")),
            CloseReason::PtyFailed(_) => Some((1011, "Terminal error")),
            CloseReason::ClientClosed | CloseReason::ClientError(_) | CloseReason::SendFailed(_) => None,
        }
    }
}

/// An attached pty: the process, its event stream and the current size.
pub struct TerminalSession {
    sandbox: String,
    dims: Dimensions,
    bounds: DimensionBounds,
    process: Box<dyn PtyProcess>,
    events: mpsc::Receiver<PtyEvent>,
    state: SessionState,
}

impl TerminalSession {
    /// Wrap a freshly spawned process. `dims` are clamped into `bounds`.
    pub fn new(
        sandbox: impl Into<String>,
        dims: Dimensions,
        bounds: DimensionBounds,
        process: Box<dyn PtyProcess>,
        events: mpsc::Receiver<PtyEvent>,
    ) -> Self {
        Self {
            sandbox: sandbox.into(),
            dims: bounds.clamp(dims.cols as i64, dims.rows as i64),
            bounds,
            process,
            events,
            state: SessionState::Active,
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dims
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process.process_id()
    }

    /// Next output chunk or exit notification; `None` once the pty's I/O
    /// threads are gone.
    pub async fn next_event(&mut self) -> Option<PtyEvent> {
        self.events.recv().await
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), BridgeError> {
        if self.state != SessionState::Active {
            return Err(BridgeError::Closed);
        }
        self.process.write(bytes)
    }

    /// Resize to the requested size clamped into bounds; returns the applied
    /// size.
    pub fn resize(&mut self, cols: i64, rows: i64) -> Result<Dimensions, BridgeError> {
        if self.state != SessionState::Active {
            return Err(BridgeError::Closed);
        }
        let dims = self.bounds.clamp(cols, rows);
        self.process.resize(dims)?;
        self.dims = dims;
        Ok(dims)
    }

    pub fn kill(&mut self) {
        if self.state == SessionState::Active {
            self.state = SessionState::Closing;
        }
        if let Err(e) = self.process.kill() {
            warn!(sandbox = %self.sandbox, error = %e, "Failed to kill pty process");
        }
    }

    fn handle_input(&mut self, bytes: &[u8]) -> Result<(), BridgeError> {
        match InboundFrame::decode(bytes) {
            InboundFrame::Control(ControlFrame::Resize { cols, rows }) => {
                let applied = self.resize(cols, rows)?;
                debug!(sandbox = %self.sandbox, cols = applied.cols, rows = applied.rows, "Resized");
            }
            InboundFrame::Literal(bytes) if !bytes.is_empty() => self.write(bytes)?,
            InboundFrame::Literal(_) => {}
        }
        Ok(())
    }
}

/// Turns pty output into valid UTF-8 text frames, holding back a multi-byte
/// sequence split across reads until the rest arrives.
#[derive(Debug, Default)]
pub(crate) struct OutputDecoder {
    pending: Vec<u8>,
}

impl OutputDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(chunk);
        let split = self.pending.len() - incomplete_tail_len(&self.pending);
        if split == 0 {
            return None;
        }
        let rest = self.pending.split_off(split);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        Some(text)
    }

    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

/// Length of a truncated UTF-8 sequence at the end of `bytes`, if any.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let b = bytes[bytes.len() - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let needed = match b {
            b if b & 0xE0 == 0xC0 => 2,
            b if b & 0xF0 == 0xE0 => 3,
            b if b & 0xF8 == 0xF0 => 4,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

/// Per-session limits for [`run`].
#[derive(Debug, Clone, Default)]
pub struct RelayContext {
    /// Session id used in log lines.
    pub label: String,
    /// Absolute end of the session.
    pub deadline: Option<Instant>,
    /// Flips to `true` when the server shuts down.
    pub shutdown: Option<watch::Receiver<bool>>,
}

/// Relay until either side ends, then tear the other side down.
///
/// On return the pty has been killed and, when the connection is still
/// usable, the client has been sent a close frame.
pub async fn run<S, E>(session: &mut TerminalSession, socket: &mut S, ctx: RelayContext) -> CloseReason
where
    S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Unpin,
    E: Display,
{
    let RelayContext {
        label,
        deadline,
        mut shutdown,
    } = ctx;
    let mut decoder = OutputDecoder::default();

    let expired = async move {
        match deadline {
            Some(at) => sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expired);

    let reason = loop {
        tokio::select! {
            event = session.events.recv() => match event {
                Some(PtyEvent::Output(bytes)) => {
                    if let Some(text) = decoder.push(&bytes) {
                        if let Err(e) = socket.send(Message::Text(text)).await {
                            warn!(session = %label, error = %e, "Failed to send to client");
                            break CloseReason::SendFailed(e.to_string());
                        }
                    }
                }
                Some(PtyEvent::Exited(code)) => break CloseReason::ProcessExited(code),
                None => break CloseReason::ProcessExited(None),
            },
            inbound = socket.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = session.handle_input(text.as_bytes()) {
                        break CloseReason::PtyFailed(e.to_string());
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if let Err(e) = session.handle_input(&bytes) {
                        break CloseReason::PtyFailed(e.to_string());
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break CloseReason::ClientClosed,
                Some(Err(e)) => break CloseReason::ClientError(e.to_string()),
            },
            () = &mut expired => break CloseReason::Timeout,
            () = shutdown_signalled(&mut shutdown) => break CloseReason::Shutdown,
        }
    };

    session.state = SessionState::Closing;
    match &reason {
        CloseReason::ProcessExited(code) => {
            info!(session = %label, exit_code = ?code, "Shell exited");
            drain_output(session, socket, &mut decoder).await;
        }
        CloseReason::Timeout => {
            info!(session = %label, "Session timeout");
            let _ = socket.send(Message::Text(TIMEOUT_NOTICE.to_string())).await;
            tokio::time::sleep(TIMEOUT_GRACE).await;
        }
        CloseReason::ClientClosed => info!(session = %label, "Client closed, killing pty"),
        other => warn!(session = %label, reason = ?other, "Terminal session aborted"),
    }

    session.kill();

    if let Some((code, text)) = reason.close_frame() {
        if let Some(rest) = decoder.finish() {
            let _ = socket.send(Message::Text(rest)).await;
        }
        let frame = CloseFrame {
            code,
            reason: text.into(),
        };
        if let Err(e) = socket.send(Message::Close(Some(frame))).await {
            debug!(session = %label, error = %e, "Close frame not delivered");
        }
    }

    session.state = SessionState::Closed;
    reason
}

async fn drain_output<S, E>(session: &mut TerminalSession, socket: &mut S, decoder: &mut OutputDecoder)
where
    S: Sink<Message, Error = E> + Unpin,
{
    let until = Instant::now() + EXIT_DRAIN;
    while let Ok(Some(event)) = timeout_at(until, session.events.recv()).await {
        if let PtyEvent::Output(bytes) = event {
            if let Some(text) = decoder.push(&bytes) {
                if socket.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn shutdown_signalled(rx: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = rx else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without signalling; nothing will ever arrive.
            return std::future::pending().await;
        }
    }
}

/// Releases everything a terminal connection holds, exactly once: the
/// sandbox, the ledger marker and the live-session entry.
///
/// Dropping an unclosed teardown schedules the same cleanup on the runtime,
/// so a panicking session task does not leak its sandbox.
pub struct SessionTeardown {
    inner: Arc<TeardownInner>,
}

struct TeardownInner {
    done: AtomicBool,
    session_id: String,
    user_id: String,
    sandbox: String,
    lifecycle: Arc<SandboxManager>,
    gateway: Arc<SessionGateway>,
    sessions: LiveSessions,
}

impl SessionTeardown {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        sandbox: impl Into<String>,
        lifecycle: Arc<SandboxManager>,
        gateway: Arc<SessionGateway>,
        sessions: LiveSessions,
    ) -> Self {
        Self {
            inner: Arc::new(TeardownInner {
                done: AtomicBool::new(false),
                session_id: session_id.into(),
                user_id: user_id.into(),
                sandbox: sandbox.into(),
                lifecycle,
                gateway,
                sessions,
            }),
        }
    }

    /// Run the cleanup. Returns `false` if it already ran.
    pub async fn close_once(&self) -> bool {
        self.inner.cleanup().await
    }
}

impl TeardownInner {
    async fn cleanup(&self) -> bool {
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.lifecycle.destroy(&self.sandbox).await;
        if let Err(e) = self.gateway.delete_session(&self.user_id).await {
            warn!(session_id = %self.session_id, user_id = %self.user_id, error = %e, "Failed to delete session marker");
        }
        self.sessions.write().await.remove(&self.session_id);
        info!(session_id = %self.session_id, sandbox = %self.sandbox, "Session cleaned up");
        true
    }
}

impl Drop for SessionTeardown {
    fn drop(&mut self) {
        if self.inner.done.load(Ordering::SeqCst) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(session_id = %self.inner.session_id, "Session dropped without teardown, cleaning up");
                let inner = self.inner.clone();
                handle.spawn(async move {
                    inner.cleanup().await;
                });
            }
            Err(_) => warn!(
                session_id = %self.inner.session_id,
                sandbox = %self.inner.sandbox,
                "No runtime to clean up session; the sweep will reap its sandbox"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};

    #[derive(Debug, Default)]
    struct ProcessLog {
        writes: Vec<Vec<u8>>,
        resizes: Vec<Dimensions>,
        kills: usize,
    }

    struct FakeProcess {
        log: Arc<Mutex<ProcessLog>>,
    }

    impl PtyProcess for FakeProcess {
        fn write(&mut self, bytes: &[u8]) -> Result<(), BridgeError> {
            self.log.lock().unwrap().writes.push(bytes.to_vec());
            Ok(())
        }
        fn resize(&mut self, dims: Dimensions) -> Result<(), BridgeError> {
            self.log.lock().unwrap().resizes.push(dims);
            Ok(())
        }
        fn kill(&mut self) -> Result<(), BridgeError> {
            self.log.lock().unwrap().kills += 1;
            Ok(())
        }
        fn process_id(&self) -> Option<u32> {
            Some(7)
        }
    }

    struct FakeSocket {
        inbound: mpsc::UnboundedReceiver<Result<Message, String>>,
        outbound: mpsc::UnboundedSender<Message>,
        fail_sends: bool,
    }

    impl Stream for FakeSocket {
        type Item = Result<Message, String>;
        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.inbound.poll_recv(cx)
        }
    }

    impl Sink<Message> for FakeSocket {
        type Error = String;
        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }
        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), String> {
            if self.fail_sends {
                return Err("broken pipe".into());
            }
            self.outbound.send(item).map_err(|e| e.to_string())
        }
        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }
    }

    struct Harness {
        session: TerminalSession,
        socket: FakeSocket,
        log: Arc<Mutex<ProcessLog>>,
        pty_tx: mpsc::Sender<PtyEvent>,
        client_tx: mpsc::UnboundedSender<Result<Message, String>>,
        client_rx: mpsc::UnboundedReceiver<Message>,
    }

    fn harness() -> Harness {
        let log = Arc::new(Mutex::new(ProcessLog::default()));
        let (pty_tx, pty_rx) = mpsc::channel(16);
        let (client_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, client_rx) = mpsc::unbounded_channel();
        let session = TerminalSession::new(
            "sb",
            Dimensions::default(),
            DimensionBounds::default(),
            Box::new(FakeProcess { log: log.clone() }),
            pty_rx,
        );
        Harness {
            session,
            socket: FakeSocket {
                inbound,
                outbound,
                fail_sends: false,
            },
            log,
            pty_tx,
            client_tx,
            client_rx,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    fn close_of(messages: &[Message]) -> Option<(u16, String)> {
        messages.iter().find_map(|m| match m {
            Message::Close(Some(f)) => Some((f.code, f.reason.to_string())),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_resize_frame_resizes_and_literal_is_written() {
        let mut h = harness();
        h.client_tx
            .send(Ok(Message::Text(r#"{"type":"resize","cols":100,"rows":40}"#.into())))
            .unwrap();
        h.client_tx.send(Ok(Message::Text("{not json".into()))).unwrap();
        h.client_tx
            .send(Ok(Message::Text(r#"{"type":"resize","cols":9000,"rows":1}"#.into())))
            .unwrap();
        h.client_tx.send(Ok(Message::Binary(b"ls\r".to_vec()))).unwrap();
        h.client_tx.send(Ok(Message::Close(None))).unwrap();

        let reason = run(&mut h.session, &mut h.socket, RelayContext::default()).await;
        assert_eq!(reason, CloseReason::ClientClosed);

        let log = h.log.lock().unwrap();
        assert_eq!(
            log.resizes,
            [Dimensions { cols: 100, rows: 40 }, Dimensions { cols: 500, rows: 5 }]
        );
        assert_eq!(log.writes, [b"{not json".to_vec(), b"ls\r".to_vec()]);
        assert_eq!(h.session.dimensions(), Dimensions { cols: 500, rows: 5 });
    }

    #[tokio::test]
    async fn test_client_close_kills_process() {
        let mut h = harness();
        drop(h.client_tx);

        let reason = run(&mut h.session, &mut h.socket, RelayContext::default()).await;
        assert_eq!(reason, CloseReason::ClientClosed);
        assert_eq!(h.log.lock().unwrap().kills, 1);
        assert_eq!(h.session.state(), SessionState::Closed);
        // Nobody to send a close frame to.
        assert!(close_of(&drain(&mut h.client_rx)).is_none());
    }

    #[tokio::test]
    async fn test_client_error_kills_process() {
        let mut h = harness();
        h.client_tx.send(Err("reset by peer".into())).unwrap();

        let reason = run(&mut h.session, &mut h.socket, RelayContext::default()).await;
        assert_eq!(reason, CloseReason::ClientError("reset by peer".into()));
        assert_eq!(h.log.lock().unwrap().kills, 1);
    }

    #[tokio::test]
    async fn test_process_exit_closes_client_normally() {
        let mut h = harness();
        h.pty_tx.send(PtyEvent::Output(b"bye\r\n".to_vec())).await.unwrap();
        h.pty_tx.send(PtyEvent::Exited(Some(0))).await.unwrap();
        h.pty_tx.send(PtyEvent::Output(b"late".to_vec())).await.unwrap();
        drop(h.pty_tx);

        let reason = run(&mut h.session, &mut h.socket, RelayContext::default()).await;
        assert_eq!(reason, CloseReason::ProcessExited(Some(0)));

        let sent = drain(&mut h.client_rx);
        assert_eq!(sent[0], Message::Text("bye\r\n".into()));
        assert_eq!(sent[1], Message::Text("late".into()));
        assert_eq!(close_of(&sent), Some((1000, "Terminal session ended".to_string())));
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_send_failure_kills_process() {
        let mut h = harness();
        h.socket.fail_sends = true;
        h.pty_tx.send(PtyEvent::Output(b"x".to_vec())).await.unwrap();

        let reason = run(&mut h.session, &mut h.socket, RelayContext::default()).await;
        assert!(matches!(reason, CloseReason::SendFailed(_)));
        assert_eq!(h.log.lock().unwrap().kills, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_sends_notice_then_closes() {
        let mut h = harness();
        let ctx = RelayContext {
            label: "req".into(),
            deadline: Some(Instant::now() + Duration::from_secs(600)),
            shutdown: None,
        };

        let reason = run(&mut h.session, &mut h.socket, ctx).await;
        assert_eq!(reason, CloseReason::Timeout);

        let sent = drain(&mut h.client_rx);
        assert_eq!(sent[0], Message::Text(TIMEOUT_NOTICE.into()));
        assert_eq!(close_of(&sent), Some((1000, "Session timeout".to_string())));
        assert_eq!(h.log.lock().unwrap().kills, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_with_going_away() {
        let mut h = harness();
        let (tx, rx) = watch::channel(false);
        let ctx = RelayContext {
            label: "req".into(),
            deadline: None,
            shutdown: Some(rx),
        };
        tx.send(true).unwrap();

        let reason = run(&mut h.session, &mut h.socket, ctx).await;
        assert_eq!(reason, CloseReason::Shutdown);
        assert_eq!(
            close_of(&drain(&mut h.client_rx)),
            Some((1001, "Server shutting down".to_string()))
        );
    }

    #[tokio::test]
    async fn test_closed_session_rejects_input() {
        let mut h = harness();
        h.session.kill();
        assert!(matches!(h.session.write(b"x"), Err(BridgeError::Closed)));
        assert!(matches!(h.session.resize(100, 40), Err(BridgeError::Closed)));
    }

    #[test]
    fn test_output_decoder_carries_split_sequences() {
        let mut d = OutputDecoder::default();
        let euro = "€".as_bytes();
        assert_eq!(d.push(&[b'a', euro[0]]), Some("a".to_string()));
        assert_eq!(d.push(&euro[1..2]), None);
        assert_eq!(d.push(&[euro[2], b'b']), Some("€b".to_string()));
        assert_eq!(d.finish(), None);
    }

    #[test]
    fn test_output_decoder_replaces_invalid_bytes() {
        let mut d = OutputDecoder::default();
        assert_eq!(d.push(&[0xff, b'x']), Some("\u{fffd}x".to_string()));
        assert_eq!(d.push(&[0xe2, 0x82]), None);
        assert_eq!(d.finish(), Some("\u{fffd}".to_string()));
    }

    mod teardown {
        use super::*;
        use crate::clock::SystemClock;
        use crate::error::RuntimeError;
        use crate::gateway::{RatePolicy, SessionPolicy};
        use crate::ledger::{Ledger, MemoryLedger};
        use crate::sandbox::{SandboxCaps, SandboxConfig, SandboxDefaults, SandboxOverrides, SandboxRuntime, ShellCommand};
        use crate::state::LiveSession;
        use async_trait::async_trait;
        use std::collections::HashMap;
        use tokio::sync::RwLock;

        #[derive(Default)]
        struct CountingRuntime {
            removed: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl SandboxRuntime for CountingRuntime {
            fn name(&self) -> &'static str {
                "counting"
            }
            async fn create(&self, _name: &str, _config: &SandboxConfig) -> Result<(), RuntimeError> {
                Ok(())
            }
            async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
                self.removed.lock().unwrap().push(name.to_string());
                Ok(())
            }
            fn shell_command(&self, _name: &str, _config: &SandboxConfig, _shell: &[String]) -> ShellCommand {
                ShellCommand::new("/bin/true")
            }
        }

        struct Fixture {
            runtime: Arc<CountingRuntime>,
            lifecycle: Arc<SandboxManager>,
            gateway: Arc<SessionGateway>,
            sessions: LiveSessions,
            sandbox: String,
        }

        async fn fixture() -> Fixture {
            let runtime = Arc::new(CountingRuntime::default());
            let lifecycle = Arc::new(SandboxManager::new(
                runtime.clone(),
                SandboxDefaults::default(),
                SandboxCaps::default(),
            ));
            let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
            let gateway = Arc::new(SessionGateway::new(
                ledger,
                Arc::new(SystemClock),
                RatePolicy::default(),
                SessionPolicy::default(),
            ));
            let sessions: LiveSessions = Arc::new(RwLock::new(HashMap::new()));

            gateway.admit("alice", "10.0.0.1").await.unwrap();
            let handle = lifecycle.provision("alice", &SandboxOverrides::default()).await.unwrap();
            sessions.write().await.insert(
                "s1".to_string(),
                LiveSession {
                    request_id: "r1".into(),
                    user_id: "alice".into(),
                    client_ip: "10.0.0.1".into(),
                    sandbox: Some(handle.name.clone()),
                    dimensions: Dimensions::default(),
                    state: SessionState::Active,
                    connected_at: Instant::now(),
                },
            );
            Fixture {
                runtime,
                lifecycle,
                gateway,
                sessions,
                sandbox: handle.name,
            }
        }

        fn teardown(f: &Fixture) -> SessionTeardown {
            SessionTeardown::new(
                "s1",
                "alice",
                f.sandbox.clone(),
                f.lifecycle.clone(),
                f.gateway.clone(),
                f.sessions.clone(),
            )
        }

        async fn assert_released(f: &Fixture) {
            assert!(f.lifecycle.is_empty().await);
            assert!(f.sessions.read().await.is_empty());
            assert_eq!(f.gateway.get_session("alice").await.unwrap(), None);
        }

        #[tokio::test]
        async fn test_close_once_runs_cleanup_exactly_once() {
            let f = fixture().await;
            let t = teardown(&f);

            assert!(t.close_once().await);
            assert!(!t.close_once().await);
            drop(t);
            tokio::task::yield_now().await;

            assert_eq!(*f.runtime.removed.lock().unwrap(), [f.sandbox.clone()]);
            assert_released(&f).await;
        }

        #[tokio::test]
        async fn test_dropping_unclosed_teardown_cleans_up() {
            let f = fixture().await;
            assert!(f.gateway.has_active_session("alice").await);

            drop(teardown(&f));

            tokio::time::timeout(Duration::from_secs(2), async {
                while !f.lifecycle.is_empty().await {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();
            // Cleanup finishes its remaining steps after the registry entry goes.
            tokio::time::timeout(Duration::from_secs(2), async {
                while !f.sessions.read().await.is_empty() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();

            assert_eq!(f.runtime.removed.lock().unwrap().len(), 1);
            assert_released(&f).await;
        }
    }
}
