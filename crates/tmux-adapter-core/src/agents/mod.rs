//! Live agent model and discovery.
//!
//! An agent is a tmux session that hosts a recognised coding-agent process.
//! The detector classifies sessions; the registry keeps the live set current
//! and broadcasts lifecycle events.

mod detector;
mod registry;

pub use detector::{
    detect_agent, DetectorConfig, ProcInspector, Process, ProcessInspector, Rejection, SessionEnv,
};
pub use registry::{diff_agents, Registry, RegistryEvent};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Position an agent holds in the town hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Mayor,
    Deacon,
    Overseer,
    Witness,
    Refinery,
    Crew,
    Polecat,
    Boot,
}

impl Role {
    /// Parse a role keyword as it appears in `GT_ROLE` or a session name segment.
    pub fn from_keyword(s: &str) -> Option<Role> {
        match s {
            "mayor" => Some(Role::Mayor),
            "deacon" => Some(Role::Deacon),
            "overseer" => Some(Role::Overseer),
            "witness" => Some(Role::Witness),
            "refinery" => Some(Role::Refinery),
            "crew" => Some(Role::Crew),
            "polecat" => Some(Role::Polecat),
            "boot" => Some(Role::Boot),
            _ => None,
        }
    }
}

/// Agent runtime detected on the session's pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Claude,
    Gemini,
    Codex,
    Cursor,
    Auggie,
    Amp,
    Opencode,
}

impl Runtime {
    /// Match a process command name against the known runtimes.
    pub fn from_command(cmd: &str) -> Option<Runtime> {
        match cmd {
            "claude" => Some(Runtime::Claude),
            "gemini" => Some(Runtime::Gemini),
            "codex" => Some(Runtime::Codex),
            "cursor" => Some(Runtime::Cursor),
            "auggie" => Some(Runtime::Auggie),
            "amp" => Some(Runtime::Amp),
            "opencode" => Some(Runtime::Opencode),
            _ => None,
        }
    }
}

/// A live agent as exposed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    /// Equals the tmux session name; unique.
    pub name: String,
    pub role: Role,
    pub runtime: Runtime,
    /// Set only for rig-level agents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rig: Option<String>,
    pub work_dir: PathBuf,
    /// Whether a human viewer is attached to the session.
    pub attached: bool,
}

/// Basic tmux session information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub name: String,
    pub attached: bool,
}

/// Details of a session's first pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneInfo {
    pub pane_id: String,
    pub command: String,
    pub pid: i32,
    pub work_dir: PathBuf,
}
