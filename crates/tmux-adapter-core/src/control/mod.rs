//! Control-mode connection to the tmux server.
//!
//! One long-lived `tmux -C` child carries all commands and notifications.
//! Commands are single-flight: a mutex serialises submissions and the reader
//! task resolves the pending command when the matching end/error marker
//! arrives. Notifications are fanned out on a small lossy broadcast channel.
//!
//! The connection is never restarted. When the child exits every pending
//! command fails fatally, the notification channel closes, and a watch flips
//! so the daemon can exit and let a supervisor restart it.

mod commands;
mod protocol;

pub use commands::MuxCommands;
pub use protocol::{
    decode_octal_escapes, parse_control_line, quote_arg, AssembledEvent, BlockResult, ControlLine,
    Notification, ResponseAssembler,
};

use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{AdapterError, Result};

/// Default per-command deadline.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Notification fan-out buffer. Small on purpose: consumers rescan on any
/// trigger, so coalescing under lag is harmless.
const NOTIFICATION_BUFFER: usize = 32;

/// Tunables for the control connection.
#[derive(Debug, Clone)]
pub struct ControlModeConfig {
    /// Per-command deadline; a late end marker after this is discarded.
    pub command_timeout: Duration,
}

impl Default for ControlModeConfig {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

type PendingSlot = Arc<StdMutex<Option<oneshot::Sender<BlockResult>>>>;

/// A persistent control-mode connection bound to a throwaway monitor session.
pub struct ControlMode {
    stdin: Mutex<ChildStdin>,
    /// Serialises command submission: at most one unresolved command.
    cmd_lock: Mutex<()>,
    pending: PendingSlot,
    notif_tx: broadcast::Sender<Notification>,
    closed_rx: watch::Receiver<bool>,
    command_timeout: Duration,
    monitor_session: String,
    child: StdMutex<Option<Child>>,
}

impl ControlMode {
    /// Spawn `tmux -C` attached to a dedicated monitor session and verify the
    /// pipe end-to-end with a quick `display-message` round trip.
    pub async fn connect(config: ControlModeConfig) -> Result<Self> {
        let monitor_session = format!("_tmux-adapter-monitor-{}", std::process::id());

        let mut cmd = Command::new("tmux");
        cmd.args(["-C", "new-session", "-A", "-s", &monitor_session]);

        let conn = Self::connect_inner(cmd, monitor_session, config).await?;

        match conn
            .execute_with_timeout("display-message -p ok", Duration::from_secs(2))
            .await
        {
            Ok(_) => {
                info!(monitor = %conn.monitor_session, "tmux control mode connected");
                Ok(conn)
            }
            Err(e) => {
                conn.kill_child();
                Err(AdapterError::Fatal(format!(
                    "control mode health check failed: {e}"
                )))
            }
        }
    }

    async fn connect_inner(
        mut cmd: Command,
        monitor_session: String,
        config: ControlModeConfig,
    ) -> Result<Self> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AdapterError::Fatal(format!("spawn tmux control mode: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AdapterError::Fatal("tmux stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::Fatal("tmux stdout unavailable".to_string()))?;

        let pending: PendingSlot = Arc::new(StdMutex::new(None));
        let (notif_tx, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let (closed_tx, closed_rx) = watch::channel(false);

        let reader_pending = Arc::clone(&pending);
        let reader_notif = notif_tx.clone();
        tokio::spawn(async move {
            Self::reader_loop(stdout, reader_pending, reader_notif, closed_tx).await;
        });

        // Let tmux emit its startup block before the first command.
        tokio::time::sleep(Duration::from_millis(100)).await;

        Ok(Self {
            stdin: Mutex::new(stdin),
            cmd_lock: Mutex::new(()),
            pending,
            notif_tx,
            closed_rx,
            command_timeout: config.command_timeout,
            monitor_session,
            child: StdMutex::new(Some(child)),
        })
    }

    /// Reader task: classify each stdout line, resolve the pending command on
    /// end/error markers, forward notifications. Blocks arriving with no
    /// pending command (the initial `new-session` response, or anything after
    /// a timeout discarded its waiter) are dropped.
    async fn reader_loop(
        stdout: tokio::process::ChildStdout,
        pending: PendingSlot,
        notif_tx: broadcast::Sender<Notification>,
        closed_tx: watch::Sender<bool>,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        let mut assembler = ResponseAssembler::new();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "control mode read error");
                    break;
                }
            };

            let trimmed = line.trim_end_matches('\r');
            match assembler.feed(trimmed) {
                Some(AssembledEvent::Response(block)) => {
                    let waiter = pending.lock().unwrap_or_else(|e| e.into_inner()).take();
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(block);
                        }
                        None => {
                            debug!(number = block.number, "discarding unawaited response block");
                        }
                    }
                }
                Some(AssembledEvent::Notification(n)) => {
                    let _ = notif_tx.send(n);
                }
                None => {}
            }
        }

        // Child is gone: fail whatever was in flight and signal shutdown.
        drop(pending.lock().unwrap_or_else(|e| e.into_inner()).take());
        let _ = notif_tx.send(Notification::Exit);
        let _ = closed_tx.send(true);
        warn!("tmux control mode stream closed");
    }

    /// Submit one command and wait for its end/error marker.
    pub async fn execute(&self, cmd: &str) -> Result<String> {
        self.execute_with_timeout(cmd, self.command_timeout).await
    }

    async fn execute_with_timeout(&self, cmd: &str, deadline: Duration) -> Result<String> {
        if *self.closed_rx.borrow() {
            return Err(AdapterError::Fatal("control connection closed".to_string()));
        }

        let _guard = self.cmd_lock.lock().await;

        let (tx, rx) = oneshot::channel();
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        {
            let mut stdin = self.stdin.lock().await;
            let write = async {
                stdin.write_all(cmd.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            };
            if let Err(e) = write.await {
                drop(self.pending.lock().unwrap_or_else(|p| p.into_inner()).take());
                return Err(AdapterError::Fatal(format!("write command: {e}")));
            }
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(block)) if block.success => Ok(block.text),
            Ok(Ok(block)) => Err(AdapterError::CommandFailed(block.text.trim().to_string())),
            Ok(Err(_)) => Err(AdapterError::Fatal("control connection closed".to_string())),
            Err(_) => {
                // Discard the waiter so the late end marker is dropped.
                drop(self.pending.lock().unwrap_or_else(|p| p.into_inner()).take());
                warn!(command = cmd, timeout = ?deadline, "tmux command timed out");
                Err(AdapterError::CommandTimeout(deadline))
            }
        }
    }

    /// Subscribe to unsolicited notifications. Lossy under lag: a slow
    /// receiver sees `RecvError::Lagged` and should simply rescan.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notif_tx.subscribe()
    }

    /// Watch channel that flips to `true` once the child exits.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    /// Resolve once the child has exited.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Tear down: kill the monitor session (best effort) and the child.
    pub async fn close(&self) {
        let cmd = format!("kill-session -t {}", quote_arg(&self.monitor_session));
        if let Err(e) = self.execute_with_timeout(&cmd, Duration::from_secs(2)).await {
            debug!(error = %e, "monitor session cleanup");
        }
        self.kill_child();
    }

    fn kill_child(&self) {
        if let Some(mut child) = self
            .child
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = child.start_kill();
        }
    }
}
