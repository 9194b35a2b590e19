//! Typed command façade over the control connection.
//!
//! Thin, stateless wrappers that quote their arguments for the control-mode
//! grammar and parse tab-delimited output. [`MuxCommands`] is the seam the
//! registry, pipe-pane manager, nudge driver and WebSocket handlers depend
//! on; tests substitute a recording mock.

use std::time::Duration;

use async_trait::async_trait;
use std::io::Write;
use tracing::{debug, warn};

use super::protocol::quote_arg;
use super::ControlMode;
use crate::agents::{PaneInfo, SessionInfo};
use crate::error::{AdapterError, Result};

/// Hex send-keys chunk size; keeps command lines reasonable for large pastes.
const HEX_CHUNK: usize = 128;

/// Command façade spoken by everything above the control connection.
#[async_trait]
pub trait MuxCommands: Send + Sync {
    /// All sessions with their attached status.
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>>;

    /// Read one session environment variable. `None` when unset.
    async fn show_environment(&self, session: &str, key: &str) -> Result<Option<String>>;

    /// Details of the session's first pane.
    async fn pane_info(&self, session: &str) -> Result<PaneInfo>;

    /// Send text in literal mode (no key-name interpretation).
    async fn send_keys_literal(&self, target: &str, text: &str) -> Result<()>;

    /// Send named keys (`Enter`, `Escape`, `BTab`, ...).
    async fn send_keys_raw(&self, target: &str, keys: &[&str]) -> Result<()>;

    /// Send raw bytes exactly as keyboard input. Prefers the hex form; falls
    /// back to literal mode on servers without `-H`.
    async fn send_keys_bytes(&self, target: &str, data: &[u8]) -> Result<()>;

    /// Load bytes into the paste buffer and paste them into the target.
    async fn paste_bytes(&self, target: &str, data: &[u8]) -> Result<()>;

    /// Entire scrollback with escape sequences preserved.
    async fn capture_pane_all(&self, session: &str) -> Result<String>;

    /// Visible area only, escape sequences preserved.
    async fn capture_pane_visible(&self, session: &str) -> Result<String>;

    /// Query a session format variable.
    async fn display_message(&self, session: &str, format: &str) -> Result<String>;

    /// Set a session's window to an exact size. Used instead of resize-pane
    /// because single-pane windows constrain the pane to the window size.
    async fn resize_window(&self, target: &str, cols: u32, rows: u32) -> Result<()>;

    /// Adjust the pane height by a signed delta ("-1" shrinks one row).
    async fn resize_pane_delta(&self, target: &str, delta: i32) -> Result<()>;

    /// Activate pipe-pane for output-only streaming to a shell command.
    async fn pipe_pane_start(&self, session: &str, command: &str) -> Result<()>;

    /// Deactivate pipe-pane for a session.
    async fn pipe_pane_stop(&self, session: &str) -> Result<()>;

    /// Destroy a session.
    async fn kill_session(&self, session: &str) -> Result<()>;

    /// Coerce the session's application to repaint. Shrinks the window one
    /// row and restores it; falls back to SIGWINCH at the pane's process
    /// group, then the pid. Best effort, never fails the caller.
    async fn force_redraw(&self, session: &str) {
        let size = match self
            .display_message(session, "#{window_width}:#{window_height}")
            .await
        {
            Ok(s) => s,
            Err(e) => {
                debug!(session, error = %e, "force redraw: window size query failed");
                self.force_redraw_via_sigwinch(session).await;
                return;
            }
        };

        let dims = size
            .split_once(':')
            .and_then(|(w, h)| Some((w.parse::<u32>().ok()?, h.parse::<u32>().ok()?)));
        let (width, height) = match dims {
            Some((w, h)) if w > 0 && h > 1 => (w, h),
            _ => {
                debug!(session, size = %size, "force redraw: unusable window size");
                self.force_redraw_via_sigwinch(session).await;
                return;
            }
        };

        if let Err(e) = self.resize_window(session, width, height - 1).await {
            debug!(session, error = %e, "force redraw: shrink failed, trying SIGWINCH");
            self.force_redraw_via_sigwinch(session).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Err(e) = self.resize_window(session, width, height).await {
            warn!(session, error = %e, "force redraw: restore failed");
        }
    }

    /// SIGWINCH directly at the pane's process group (negative pid), with a
    /// plain-pid fallback.
    async fn force_redraw_via_sigwinch(&self, session: &str) {
        let info = match self.pane_info(session).await {
            Ok(info) => info,
            Err(e) => {
                debug!(session, error = %e, "force redraw: pane info failed");
                return;
            }
        };
        send_sigwinch(session, info.pid);
    }
}

#[cfg(unix)]
fn send_sigwinch(session: &str, pid: i32) {
    if pid <= 0 {
        return;
    }
    // Process group first; the shell and its children all see it.
    let rc = unsafe { libc::kill(-pid, libc::SIGWINCH) };
    if rc != 0 {
        let rc = unsafe { libc::kill(pid, libc::SIGWINCH) };
        if rc != 0 {
            debug!(session, pid, "force redraw: SIGWINCH delivery failed");
            return;
        }
    }
    debug!(session, pid, "force redraw: sent SIGWINCH");
}

#[cfg(not(unix))]
fn send_sigwinch(_session: &str, _pid: i32) {}

#[async_trait]
impl MuxCommands for ControlMode {
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let out = self
            .execute("list-sessions -F '#{session_name}\t#{session_attached}'")
            .await?;
        Ok(parse_sessions(&out))
    }

    async fn show_environment(&self, session: &str, key: &str) -> Result<Option<String>> {
        match self
            .execute(&format!("show-environment -t '{session}' {key}"))
            .await
        {
            Ok(out) => Ok(parse_environment_value(&out)),
            // Variable not set is reported as a command error; not fatal.
            Err(AdapterError::CommandFailed(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn pane_info(&self, session: &str) -> Result<PaneInfo> {
        let out = self
            .execute(&format!(
                "list-panes -t '{session}' -F '#{{pane_id}}\t#{{pane_current_command}}\t#{{pane_pid}}\t#{{pane_current_path}}'"
            ))
            .await?;
        // First pane only; agent sessions are single-pane.
        let line = out.lines().next().unwrap_or("");
        parse_pane_line(line)
            .ok_or_else(|| AdapterError::CommandFailed(format!("unexpected pane info: {line:?}")))
    }

    async fn send_keys_literal(&self, target: &str, text: &str) -> Result<()> {
        self.execute(&format!(
            "send-keys -t '{target}' -l {}",
            quote_arg(text)
        ))
        .await?;
        Ok(())
    }

    async fn send_keys_raw(&self, target: &str, keys: &[&str]) -> Result<()> {
        let mut cmd = format!("send-keys -t '{target}'");
        for key in keys {
            cmd.push(' ');
            cmd.push_str(key);
        }
        self.execute(&cmd).await?;
        Ok(())
    }

    async fn send_keys_bytes(&self, target: &str, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        for chunk in hex_send_commands(target, data) {
            match self.execute(&chunk).await {
                Ok(_) => {}
                Err(AdapterError::CommandFailed(msg)) if msg.contains("unknown flag -H") => {
                    // Older servers: byte-exactness is lost for invalid UTF-8,
                    // but keystrokes still arrive.
                    return self
                        .send_keys_literal(target, &String::from_utf8_lossy(data))
                        .await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn paste_bytes(&self, target: &str, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut file = tempfile::NamedTempFile::with_prefix("tmux-adapter-buffer-")?;
        file.write_all(data)?;
        file.flush()?;
        let path = file.path().to_string_lossy().into_owned();

        let load = format!("load-buffer -w {}", quote_arg(&path));
        match self.execute(&load).await {
            Ok(_) => {}
            Err(AdapterError::CommandFailed(msg)) if msg.contains("unknown flag -w") => {
                self.execute(&format!("load-buffer {}", quote_arg(&path)))
                    .await?;
            }
            Err(e) => return Err(e),
        }

        self.execute(&format!("paste-buffer -d -t '{target}'")).await?;
        Ok(())
        // NamedTempFile unlinks on drop.
    }

    async fn capture_pane_all(&self, session: &str) -> Result<String> {
        self.execute(&format!("capture-pane -p -e -t '{session}' -S -"))
            .await
    }

    async fn capture_pane_visible(&self, session: &str) -> Result<String> {
        self.execute(&format!("capture-pane -p -e -t '{session}'"))
            .await
    }

    async fn display_message(&self, session: &str, format: &str) -> Result<String> {
        let out = self
            .execute(&format!("display-message -t '{session}' -p '{format}'"))
            .await?;
        Ok(out.trim().to_string())
    }

    async fn resize_window(&self, target: &str, cols: u32, rows: u32) -> Result<()> {
        self.execute(&format!("resize-window -t '{target}' -x {cols} -y {rows}"))
            .await?;
        Ok(())
    }

    async fn resize_pane_delta(&self, target: &str, delta: i32) -> Result<()> {
        self.execute(&format!("resize-pane -t '{target}' -y {delta:+}"))
            .await?;
        Ok(())
    }

    async fn pipe_pane_start(&self, session: &str, command: &str) -> Result<()> {
        self.execute(&format!("pipe-pane -o -t '{session}' '{command}'"))
            .await?;
        Ok(())
    }

    async fn pipe_pane_stop(&self, session: &str) -> Result<()> {
        // No command argument deactivates the pipe.
        self.execute(&format!("pipe-pane -t '{session}'")).await?;
        Ok(())
    }

    async fn kill_session(&self, session: &str) -> Result<()> {
        self.execute(&format!("kill-session -t '{session}'")).await?;
        Ok(())
    }
}

/// Parse `list-sessions -F '#{session_name}\t#{session_attached}'` output.
pub(crate) fn parse_sessions(out: &str) -> Vec<SessionInfo> {
    out.lines()
        .filter_map(|line| {
            let (name, attached) = line.split_once('\t')?;
            if name.is_empty() {
                return None;
            }
            Some(SessionInfo {
                name: name.to_string(),
                attached: attached != "0",
            })
        })
        .collect()
}

/// Parse one `list-panes` line: `%id \t command \t pid \t path`.
pub(crate) fn parse_pane_line(line: &str) -> Option<PaneInfo> {
    let mut parts = line.splitn(4, '\t');
    let pane_id = parts.next()?;
    let command = parts.next()?;
    let pid = parts.next()?.parse().ok()?;
    let work_dir = parts.next()?;
    Some(PaneInfo {
        pane_id: pane_id.to_string(),
        command: command.to_string(),
        pid,
        work_dir: work_dir.into(),
    })
}

/// `show-environment` prints `KEY=value`, or `-KEY` when the variable is
/// marked for removal.
pub(crate) fn parse_environment_value(out: &str) -> Option<String> {
    let line = out.trim();
    if line.starts_with('-') {
        return None;
    }
    line.split_once('=').map(|(_, v)| v.to_string())
}

/// Build the chunked `send-keys -H` command lines for a byte payload.
pub(crate) fn hex_send_commands(target: &str, data: &[u8]) -> Vec<String> {
    data.chunks(HEX_CHUNK)
        .map(|chunk| {
            let mut cmd = format!("send-keys -t '{target}' -H");
            for byte in chunk {
                cmd.push_str(&format!(" {byte:02x}"));
            }
            cmd
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sessions_output() {
        let out = "hq-mayor\t1\ngt-foo-crew-bar\t0\n";
        let sessions = parse_sessions(out);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].name, "hq-mayor");
        assert!(sessions[0].attached);
        assert_eq!(sessions[1].name, "gt-foo-crew-bar");
        assert!(!sessions[1].attached);
    }

    #[test]
    fn parse_sessions_skips_malformed_lines() {
        let sessions = parse_sessions("no-tab-here\n\nok\t1\n");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "ok");
    }

    #[test]
    fn parse_pane_line_fields() {
        let info = parse_pane_line("%3\tclaude\t4242\t/home/u/gt/rigs/foo").unwrap();
        assert_eq!(info.pane_id, "%3");
        assert_eq!(info.command, "claude");
        assert_eq!(info.pid, 4242);
        assert_eq!(info.work_dir.to_str().unwrap(), "/home/u/gt/rigs/foo");
    }

    #[test]
    fn parse_pane_line_rejects_short_or_bad_pid() {
        assert!(parse_pane_line("%3\tclaude\tnot-a-pid\t/tmp").is_none());
        assert!(parse_pane_line("%3\tclaude").is_none());
    }

    #[test]
    fn parse_environment_variants() {
        assert_eq!(
            parse_environment_value("GT_ROLE=mayor\n"),
            Some("mayor".to_string())
        );
        assert_eq!(
            parse_environment_value("GT_RIG=iron=works"),
            Some("iron=works".to_string())
        );
        assert_eq!(parse_environment_value("-GT_ROLE"), None);
        assert_eq!(parse_environment_value(""), None);
    }

    #[test]
    fn hex_commands_chunking() {
        let data = vec![0xabu8; 300];
        let cmds = hex_send_commands("hq-mayor", &data);
        assert_eq!(cmds.len(), 3); // 128 + 128 + 44
        assert!(cmds[0].starts_with("send-keys -t 'hq-mayor' -H ab ab"));
        assert_eq!(cmds[0].matches(" ab").count(), 128);
        assert_eq!(cmds[2].matches(" ab").count(), 44);
    }

    #[test]
    fn hex_commands_single_small_chunk() {
        let cmds = hex_send_commands("s", &[0x01, 0xff]);
        assert_eq!(cmds, vec!["send-keys -t 's' -H 01 ff".to_string()]);
    }
}
