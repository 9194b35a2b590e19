//! Core subsystems of the tmux-adapter.
//!
//! Bridges a tmux server, spoken to over a single control-mode connection,
//! to many concurrent WebSocket clients:
//!
//! - `control`: the control-mode connection and typed command façade
//! - `agents`: agent detection and the live registry
//! - `pipe`: reference-counted pipe-pane byte taps with fan-out
//! - `nudge`: serialised prompt-delivery choreography
//! - `ws`: the WebSocket server, client sessions and wire protocol
//! - `rest`: the REST surface re-using the same core
//! - `auth`: bearer-token and origin checks

pub mod agents;
pub mod auth;
pub mod control;
pub mod error;
pub mod nudge;
pub mod pipe;
pub mod rest;
pub mod ws;

#[cfg(test)]
pub(crate) mod test_support;

pub use agents::{
    detect_agent, Agent, DetectorConfig, PaneInfo, ProcInspector, ProcessInspector, Registry,
    RegistryEvent, Role, Runtime, SessionInfo,
};
pub use control::{
    ControlMode, ControlModeConfig, MuxCommands, Notification, DEFAULT_COMMAND_TIMEOUT,
};
pub use error::{AdapterError, Result};
pub use nudge::{nudge_session, NudgeLocks};
pub use pipe::{default_spool_root, OutputSubscription, PipePaneManager};
pub use ws::{forward_registry_events, WsServer};
