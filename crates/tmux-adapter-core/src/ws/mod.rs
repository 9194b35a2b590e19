//! WebSocket surface: upgrade endpoint, per-client sessions, wire protocol,
//! and file-upload pastes.

mod client;
mod protocol;
mod server;
mod upload;

pub use protocol::{
    make_agent_event, make_binary_frame, parse_binary_envelope, parse_resize_payload,
    tmux_key_name_from_vt, Request, Response, BINARY_FILE_UPLOAD, BINARY_KEYBOARD_INPUT,
    BINARY_RESIZE, BINARY_TERMINAL_OUTPUT, BINARY_TERMINAL_SNAPSHOT, SNAPSHOT_TRIGGER,
};
pub use server::{forward_registry_events, WsServer};
pub use upload::{
    process_upload, sanitize_path_component, save_uploaded_file, MAX_FILE_UPLOAD_BYTES,
    MAX_INLINE_PASTE_BYTES,
};
