//! Prompt delivery choreography.
//!
//! Sending a prompt to an interactive agent is not a single write: the text
//! goes in literally, the paste needs to settle, Escape clears any partial
//! input state, Enter submits (with retries), and detached sessions need a
//! resize pair so SIGWINCH wakes the application. Per-agent locks keep
//! concurrent sends from interleaving.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::agents::Agent;
use crate::control::MuxCommands;
use crate::error::{AdapterError, Result};

const PASTE_SETTLE: Duration = Duration::from_millis(500);
const ESCAPE_SETTLE: Duration = Duration::from_millis(100);
const ENTER_ATTEMPTS: usize = 3;
const ENTER_BACKOFF: Duration = Duration::from_millis(200);
const WAKE_PAUSE: Duration = Duration::from_millis(50);

/// Per-agent serialisation locks, created lazily and kept for the life of
/// the process. Injected into every consumer (WebSocket and REST) so prompt
/// delivery and file-upload pastes never interleave on the same session.
#[derive(Default)]
pub struct NudgeLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NudgeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for one agent, creating it on first use.
    pub fn lock_for(&self, agent_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(agent_name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// Deliver one prompt followed by Enter to an agent's session. The caller
/// must hold the agent's lock from [`NudgeLocks`].
pub async fn nudge_session(mux: &dyn MuxCommands, agent: &Agent, prompt: &str) -> Result<()> {
    let session = agent.name.as_str();

    // 1. Literal text, no key-name interpretation.
    mux.send_keys_literal(session, prompt)
        .await
        .map_err(|e| AdapterError::SendFailed(format!("send literal: {e}")))?;

    // 2. Let the paste land before touching modes.
    tokio::time::sleep(PASTE_SETTLE).await;

    // 3. Escape clears vim mode or partial input state.
    mux.send_keys_raw(session, &["Escape"])
        .await
        .map_err(|e| AdapterError::SendFailed(format!("send Escape: {e}")))?;
    tokio::time::sleep(ESCAPE_SETTLE).await;

    // 4. Enter, retried with back-off.
    let mut last_err = None;
    for attempt in 0..ENTER_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(ENTER_BACKOFF).await;
        }
        match mux.send_keys_raw(session, &["Enter"]).await {
            Ok(()) => {
                // 5. Detached sessions need a SIGWINCH nudge to repaint.
                if !agent.attached {
                    wake_detached(mux, session).await;
                }
                return Ok(());
            }
            Err(e) => {
                debug!(session, attempt, error = %e, "Enter send failed");
                last_err = Some(e);
            }
        }
    }

    Err(AdapterError::SendFailed(match last_err {
        Some(e) => format!("failed to send Enter after {ENTER_ATTEMPTS} attempts: {e}"),
        None => format!("failed to send Enter after {ENTER_ATTEMPTS} attempts"),
    }))
}

/// Shrink the pane one row and restore it. Errors are logged, never
/// returned: the prompt already landed.
async fn wake_detached(mux: &dyn MuxCommands, session: &str) {
    if let Err(e) = mux.resize_pane_delta(session, -1).await {
        warn!(session, error = %e, "wake shrink failed");
    }
    tokio::time::sleep(WAKE_PAUSE).await;
    if let Err(e) = mux.resize_pane_delta(session, 1).await {
        warn!(session, error = %e, "wake restore failed");
    }
}
