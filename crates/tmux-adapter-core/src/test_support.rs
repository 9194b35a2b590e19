//! Test doubles shared across the crate's unit tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::agents::{PaneInfo, SessionInfo};
use crate::control::MuxCommands;
use crate::error::{AdapterError, Result};

/// Recording multiplexer fake. Every façade call appends a readable trace
/// line, so tests can assert exact command sequences; canned session, env
/// and pane data drive the registry and detector paths.
#[derive(Default)]
pub(crate) struct MockMux {
    trace: Mutex<Vec<String>>,
    sessions: Mutex<Vec<SessionInfo>>,
    envs: Mutex<HashMap<(String, String), String>>,
    panes: Mutex<HashMap<String, PaneInfo>>,
    captures: Mutex<HashMap<String, String>>,
    sizes: Mutex<HashMap<String, String>>,
    pastes: Mutex<Vec<(String, Vec<u8>)>>,
    /// Method tag → remaining calls to fail.
    failures: Mutex<HashMap<&'static str, usize>>,
}

impl MockMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&self, name: &str, attached: bool) {
        self.sessions.lock().unwrap().push(SessionInfo {
            name: name.to_string(),
            attached,
        });
    }

    pub fn remove_session(&self, name: &str) {
        self.sessions.lock().unwrap().retain(|s| s.name != name);
        self.panes.lock().unwrap().remove(name);
    }

    pub fn set_attached(&self, name: &str, attached: bool) {
        for s in self.sessions.lock().unwrap().iter_mut() {
            if s.name == name {
                s.attached = attached;
            }
        }
    }

    pub fn set_env(&self, session: &str, key: &str, value: &str) {
        self.envs
            .lock()
            .unwrap()
            .insert((session.to_string(), key.to_string()), value.to_string());
    }

    pub fn set_pane(&self, session: &str, pane: PaneInfo) {
        self.panes.lock().unwrap().insert(session.to_string(), pane);
    }

    pub fn set_capture(&self, session: &str, text: &str) {
        self.captures
            .lock()
            .unwrap()
            .insert(session.to_string(), text.to_string());
    }

    pub fn set_window_size(&self, session: &str, size: &str) {
        self.sizes
            .lock()
            .unwrap()
            .insert(session.to_string(), size.to_string());
    }

    /// Fail the next `times` calls of the tagged method.
    pub fn fail_next(&self, tag: &'static str, times: usize) {
        self.failures.lock().unwrap().insert(tag, times);
    }

    pub fn trace(&self) -> Vec<String> {
        self.trace.lock().unwrap().clone()
    }

    pub fn clear_trace(&self) {
        self.trace.lock().unwrap().clear();
    }

    pub fn pastes(&self) -> Vec<(String, Vec<u8>)> {
        self.pastes.lock().unwrap().clone()
    }

    fn record(&self, line: String) {
        self.trace.lock().unwrap().push(line);
    }

    fn should_fail(&self, tag: &'static str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(tag) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn fail(&self, tag: &'static str) -> AdapterError {
        AdapterError::CommandFailed(format!("mock failure: {tag}"))
    }
}

#[async_trait]
impl MuxCommands for MockMux {
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        self.record("list-sessions".to_string());
        if self.should_fail("list-sessions") {
            return Err(self.fail("list-sessions"));
        }
        Ok(self.sessions.lock().unwrap().clone())
    }

    async fn show_environment(&self, session: &str, key: &str) -> Result<Option<String>> {
        self.record(format!("show-environment {session} {key}"));
        Ok(self
            .envs
            .lock()
            .unwrap()
            .get(&(session.to_string(), key.to_string()))
            .cloned())
    }

    async fn pane_info(&self, session: &str) -> Result<PaneInfo> {
        self.record(format!("list-panes {session}"));
        self.panes
            .lock()
            .unwrap()
            .get(session)
            .cloned()
            .ok_or_else(|| AdapterError::CommandFailed(format!("no pane for {session}")))
    }

    async fn send_keys_literal(&self, target: &str, text: &str) -> Result<()> {
        self.record(format!("send-keys-literal {target} {text}"));
        if self.should_fail("send-keys-literal") {
            return Err(self.fail("send-keys-literal"));
        }
        Ok(())
    }

    async fn send_keys_raw(&self, target: &str, keys: &[&str]) -> Result<()> {
        self.record(format!("send-keys {target} {}", keys.join(" ")));
        let tag: &'static str = match keys.first() {
            Some(&"Enter") => "send-enter",
            Some(&"Escape") => "send-escape",
            _ => "send-keys",
        };
        if self.should_fail(tag) {
            return Err(self.fail(tag));
        }
        Ok(())
    }

    async fn send_keys_bytes(&self, target: &str, data: &[u8]) -> Result<()> {
        self.record(format!("send-keys-hex {target} {}", data.len()));
        if self.should_fail("send-keys-hex") {
            return Err(self.fail("send-keys-hex"));
        }
        Ok(())
    }

    async fn paste_bytes(&self, target: &str, data: &[u8]) -> Result<()> {
        self.record(format!("paste {target} {}", data.len()));
        if self.should_fail("paste") {
            return Err(self.fail("paste"));
        }
        self.pastes
            .lock()
            .unwrap()
            .push((target.to_string(), data.to_vec()));
        Ok(())
    }

    async fn capture_pane_all(&self, session: &str) -> Result<String> {
        self.record(format!("capture-pane-all {session}"));
        Ok(self
            .captures
            .lock()
            .unwrap()
            .get(session)
            .cloned()
            .unwrap_or_default())
    }

    async fn capture_pane_visible(&self, session: &str) -> Result<String> {
        self.record(format!("capture-pane-visible {session}"));
        Ok(self
            .captures
            .lock()
            .unwrap()
            .get(session)
            .cloned()
            .unwrap_or_default())
    }

    async fn display_message(&self, session: &str, format: &str) -> Result<String> {
        self.record(format!("display-message {session} {format}"));
        if self.should_fail("display-message") {
            return Err(self.fail("display-message"));
        }
        Ok(self
            .sizes
            .lock()
            .unwrap()
            .get(session)
            .cloned()
            .unwrap_or_default())
    }

    async fn resize_window(&self, target: &str, cols: u32, rows: u32) -> Result<()> {
        self.record(format!("resize-window {target} {cols}x{rows}"));
        if self.should_fail("resize-window") {
            return Err(self.fail("resize-window"));
        }
        Ok(())
    }

    async fn resize_pane_delta(&self, target: &str, delta: i32) -> Result<()> {
        self.record(format!("resize-pane {target} {delta:+}"));
        if self.should_fail("resize-pane") {
            return Err(self.fail("resize-pane"));
        }
        Ok(())
    }

    async fn pipe_pane_start(&self, session: &str, command: &str) -> Result<()> {
        self.record(format!("pipe-pane-start {session} {command}"));
        if self.should_fail("pipe-pane-start") {
            return Err(self.fail("pipe-pane-start"));
        }
        Ok(())
    }

    async fn pipe_pane_stop(&self, session: &str) -> Result<()> {
        self.record(format!("pipe-pane-stop {session}"));
        Ok(())
    }

    async fn kill_session(&self, session: &str) -> Result<()> {
        self.record(format!("kill-session {session}"));
        Ok(())
    }
}
