//! Native pseudo-terminals via `portable-pty`.
//!
//! Blocking pty I/O runs on three dedicated threads per session: a reader
//! forwarding output, a writer draining input, and a waiter reporting exit.

use super::bridge::{PtyEvent, PtyProcess, TerminalSession};
use super::{DimensionBounds, Dimensions};
use crate::error::BridgeError;
use crate::sandbox::{SandboxHandle, ShellCommand, TERM};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const READ_BUF: usize = 8192;
const EVENT_QUEUE: usize = 64;
const DEFAULT_CWD: &str = "/tmp";

pub struct NativePty {
    master: Box<dyn MasterPty + Send>,
    input: std_mpsc::Sender<Vec<u8>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl PtyProcess for NativePty {
    fn write(&mut self, bytes: &[u8]) -> Result<(), BridgeError> {
        self.input.send(bytes.to_vec()).map_err(|_| BridgeError::Closed)
    }

    fn resize(&mut self, dims: Dimensions) -> Result<(), BridgeError> {
        self.master
            .resize(pty_size(dims))
            .map_err(|e| BridgeError::Pty(e.to_string()))
    }

    fn kill(&mut self) -> Result<(), BridgeError> {
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self.killer.kill() {
            Ok(()) => Ok(()),
            // Raced with a natural exit.
            Err(e) if e.kind() == ErrorKind::NotFound || e.raw_os_error() == Some(libc::ESRCH) => Ok(()),
            Err(e) => Err(BridgeError::Io(e)),
        }
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        if !self.exited.load(Ordering::SeqCst) {
            let _ = self.killer.kill();
        }
    }
}

fn pty_size(dims: Dimensions) -> PtySize {
    PtySize {
        rows: dims.rows,
        cols: dims.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Spawn `command` on a new pty sized `dims` (clamped into `bounds`) and
/// return the running session for `handle`'s sandbox.
///
/// The environment is exactly `command.env` plus `TERM`; nothing is
/// inherited from the server.
pub fn attach(
    handle: &SandboxHandle,
    command: ShellCommand,
    dims: Dimensions,
    bounds: &DimensionBounds,
) -> Result<TerminalSession, BridgeError> {
    let dims = bounds.clamp(dims.cols as i64, dims.rows as i64);
    let pair = native_pty_system()
        .openpty(pty_size(dims))
        .map_err(|e| BridgeError::Pty(format!("openpty: {}", e)))?;

    let mut cmd = CommandBuilder::new(&command.program);
    cmd.args(&command.args);
    cmd.env_clear();
    for (key, value) in &command.env {
        cmd.env(key, value);
    }
    cmd.env("TERM", TERM);
    cmd.cwd(command.cwd.unwrap_or_else(|| DEFAULT_CWD.into()));

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| BridgeError::Pty(format!("spawn {}: {}", command.program, e)))?;
    // Our copy of the slave must go, or the reader never sees EOF.
    drop(pair.slave);

    let pid = child.process_id();
    let mut killer = child.clone_killer();
    info!(sandbox = %handle.name, pid = ?pid, cols = dims.cols, rows = dims.rows, "Shell attached");

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let exited = Arc::new(AtomicBool::new(false));

    let io = (|| -> Result<std_mpsc::Sender<Vec<u8>>, BridgeError> {
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BridgeError::Pty(format!("clone reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BridgeError::Pty(format!("take writer: {}", e)))?;

        spawn_reader(&handle.name, reader, events_tx.clone())?;
        let input = spawn_writer(&handle.name, writer)?;

        let waiter_exited = exited.clone();
        let waiter_tx = events_tx.clone();
        thread::Builder::new()
            .name(format!("pty-wait-{}", handle.name))
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => Some(status.exit_code()),
                    Err(e) => {
                        warn!(error = %e, "Waiting for shell failed");
                        None
                    }
                };
                waiter_exited.store(true, Ordering::SeqCst);
                let _ = waiter_tx.blocking_send(PtyEvent::Exited(code));
            })?;
        Ok(input)
    })();

    let input = match io {
        Ok(input) => input,
        Err(e) => {
            let _ = killer.kill();
            return Err(e);
        }
    };

    let process = NativePty {
        master: pair.master,
        input,
        killer,
        exited,
        pid,
    };
    Ok(TerminalSession::new(
        handle.name.clone(),
        dims,
        *bounds,
        Box::new(process),
        events_rx,
    ))
}

fn spawn_reader(
    sandbox: &str,
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<PtyEvent>,
) -> Result<(), BridgeError> {
    let name = sandbox.to_string();
    thread::Builder::new()
        .name(format!("pty-read-{}", sandbox))
        .spawn(move || {
            let mut buf = [0u8; READ_BUF];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(PtyEvent::Output(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    // EIO once the last slave fd closes.
                    Err(e) => {
                        debug!(sandbox = %name, error = %e, "pty reader finished");
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

fn spawn_writer(sandbox: &str, mut writer: Box<dyn Write + Send>) -> Result<std_mpsc::Sender<Vec<u8>>, BridgeError> {
    let (tx, rx) = std_mpsc::channel::<Vec<u8>>();
    let name = sandbox.to_string();
    thread::Builder::new()
        .name(format!("pty-write-{}", sandbox))
        .spawn(move || {
            for chunk in rx {
                if let Err(e) = writer.write_all(&chunk).and_then(|()| writer.flush()) {
                    debug!(sandbox = %name, error = %e, "pty writer finished");
                    break;
                }
            }
        })?;
    Ok(tx)
}
