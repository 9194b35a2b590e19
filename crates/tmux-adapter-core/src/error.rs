//! Error types shared across the adapter.

use thiserror::Error;

/// Shared adapter result type.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Domain failure modes surfaced to clients or the supervisor.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Bad JSON, missing required field, or unrecognised request type.
    #[error("malformed request: {0}")]
    RequestMalformed(String),

    /// No live agent with the requested name.
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    /// The control connection returned an error block; message forwarded.
    #[error("tmux command failed: {0}")]
    CommandFailed(String),

    /// No end marker arrived within the command deadline.
    #[error("tmux command timed out after {0:?}")]
    CommandTimeout(std::time::Duration),

    /// The tmux child process died; the connection is unusable.
    #[error("tmux control mode disconnected: {0}")]
    Fatal(String),

    /// A 0x04 upload payload exceeded the cap.
    #[error("file {name:?} too large: {size} bytes (max {max})")]
    UploadTooLarge {
        name: String,
        size: usize,
        max: usize,
    },

    /// Loading or pasting the tmux buffer failed.
    #[error("paste failed: {0}")]
    PasteFailed(String),

    /// A send-keys step failed (literal text or named key).
    #[error("send failed: {0}")]
    SendFailed(String),

    /// File-system or process I/O failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    /// True when the control connection is gone and the process should exit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AdapterError::Fatal(_))
    }
}
