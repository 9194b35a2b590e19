//! WebSocket wire protocol.
//!
//! Text frames carry JSON requests/responses; binary frames use the envelope
//! `[type:1][agentName:UTF-8][0x00][payload]`.

use serde::{Deserialize, Serialize};

use crate::agents::Agent;

/// server → client: raw terminal output bytes.
pub const BINARY_TERMINAL_OUTPUT: u8 = 0x01;
/// client → server: keyboard input bytes.
pub const BINARY_KEYBOARD_INPUT: u8 = 0x02;
/// client → server: resize, UTF-8 `"cols:rows"`.
pub const BINARY_RESIZE: u8 = 0x03;
/// client → server: file upload for paste.
pub const BINARY_FILE_UPLOAD: u8 = 0x04;
/// server → client: snapshot trigger (clear + home).
pub const BINARY_TERMINAL_SNAPSHOT: u8 = 0x05;

/// Payload of the 0x05 snapshot trigger: `ESC[2J ESC[H`.
pub const SNAPSHOT_TRIGGER: &[u8] = b"\x1b[2J\x1b[H";

/// A message from a WebSocket client.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
}

/// A message sent to a WebSocket client. Unsolicited events omit `id`.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Response {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents: Option<Vec<Agent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<Agent>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Response {
    pub fn ok(id: &str, kind: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            ok: Some(true),
            ..Default::default()
        }
    }

    pub fn failed(id: &str, kind: &str, error: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            ok: Some(false),
            error: error.into(),
            ..Default::default()
        }
    }

    /// Uncorrelated or correlated protocol error.
    pub fn error(id: &str, error: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            kind: "error".to_string(),
            error: error.into(),
            ..Default::default()
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"type\":\"error\"}".to_string())
    }
}

/// Serialise an agent lifecycle event for broadcast.
pub fn make_agent_event(event: &crate::agents::RegistryEvent) -> String {
    use crate::agents::RegistryEvent;

    let resp = match event {
        RegistryEvent::Added(agent) => Response {
            kind: "agent-added".to_string(),
            agent: Some(agent.clone()),
            ..Default::default()
        },
        RegistryEvent::Removed(agent) => Response {
            kind: "agent-removed".to_string(),
            name: agent.name.clone(),
            ..Default::default()
        },
        RegistryEvent::Updated(agent) => Response {
            kind: "agent-updated".to_string(),
            agent: Some(agent.clone()),
            ..Default::default()
        },
    };
    resp.to_json()
}

/// Split a binary frame into `(type, agentName, payload)`.
pub fn parse_binary_envelope(data: &[u8]) -> Result<(u8, &str, &[u8]), String> {
    if data.len() < 3 {
        return Err("frame too short".to_string());
    }

    let kind = data[0];
    let rest = &data[1..];
    let sep = rest
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| "missing agent separator".to_string())?;
    if sep == 0 {
        return Err("missing agent name".to_string());
    }

    let name = std::str::from_utf8(&rest[..sep]).map_err(|_| "agent name not UTF-8".to_string())?;
    Ok((kind, name, &rest[sep + 1..]))
}

/// Build a binary frame: `type + agentName + 0x00 + payload`.
pub fn make_binary_frame(kind: u8, agent_name: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + agent_name.len() + 1 + payload.len());
    frame.push(kind);
    frame.extend_from_slice(agent_name.as_bytes());
    frame.push(0);
    frame.extend_from_slice(payload);
    frame
}

/// Map known VT special-key sequences to tmux key names. Byte-exact
/// injection handles everything else.
pub fn tmux_key_name_from_vt(payload: &[u8]) -> Option<&'static str> {
    match payload {
        b"\x1b[Z" => Some("BTab"),
        b"\x1b[A" | b"\x1bOA" => Some("Up"),
        b"\x1b[B" | b"\x1bOB" => Some("Down"),
        b"\x1b[C" | b"\x1bOC" => Some("Right"),
        b"\x1b[D" | b"\x1bOD" => Some("Left"),
        b"\x1b[H" | b"\x1bOH" => Some("Home"),
        b"\x1b[F" | b"\x1bOF" => Some("End"),
        b"\x1b[5~" => Some("PgUp"),
        b"\x1b[6~" => Some("PgDn"),
        b"\x1b[2~" => Some("IC"),
        b"\x1b[3~" => Some("DC"),
        b"\x1bOP" => Some("F1"),
        b"\x1bOQ" => Some("F2"),
        b"\x1bOR" => Some("F3"),
        b"\x1bOS" => Some("F4"),
        b"\x1b[15~" => Some("F5"),
        b"\x1b[17~" => Some("F6"),
        b"\x1b[18~" => Some("F7"),
        b"\x1b[19~" => Some("F8"),
        b"\x1b[20~" => Some("F9"),
        b"\x1b[21~" => Some("F10"),
        b"\x1b[23~" => Some("F11"),
        b"\x1b[24~" => Some("F12"),
        b"\x1b" => Some("Escape"),
        b"\x7f" => Some("BSpace"),
        _ => None,
    }
}

/// Parse and clamp a 0x03 resize payload (`"cols:rows"`, cols ≥ 2, rows ≥ 1).
pub fn parse_resize_payload(payload: &[u8]) -> Result<(u32, u32), String> {
    let text = std::str::from_utf8(payload).map_err(|_| "resize payload not UTF-8".to_string())?;
    let (cols, rows) = text
        .split_once(':')
        .ok_or_else(|| "expected cols:rows".to_string())?;
    let cols: u32 = cols.parse().map_err(|_| "non-numeric cols".to_string())?;
    let rows: u32 = rows.parse().map_err(|_| "non-numeric rows".to_string())?;
    if cols < 2 || rows < 1 {
        return Err(format!("{cols}x{rows} out of range"));
    }
    Ok((cols, rows))
}
