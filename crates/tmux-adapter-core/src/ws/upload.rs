//! File-upload pastes (binary frame 0x04).
//!
//! Uploaded files are stored server-side next to the agent's work tree, a
//! pasteable payload (inline text or the saved path) is mirrored to the
//! local clipboard when possible, and then pasted into the session.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::agents::Agent;
use crate::control::MuxCommands;
use crate::error::{AdapterError, Result};

/// Upload hard cap (frame payload).
pub const MAX_FILE_UPLOAD_BYTES: usize = 8 * 1024 * 1024;
/// Largest file pasted inline rather than by path.
pub const MAX_INLINE_PASTE_BYTES: usize = 256 * 1024;

/// Store the upload, mirror the paste payload to the clipboard (best
/// effort), and paste into the agent's session. The caller holds the
/// agent's nudge lock so the paste cannot interleave with a prompt.
pub async fn process_upload(mux: &dyn MuxCommands, agent: &Agent, payload: &[u8]) -> Result<()> {
    let (file_name, mime_type, file_bytes) = parse_upload_payload(payload)?;
    if file_bytes.len() > MAX_FILE_UPLOAD_BYTES {
        return Err(AdapterError::UploadTooLarge {
            name: file_name,
            size: file_bytes.len(),
            max: MAX_FILE_UPLOAD_BYTES,
        });
    }

    let saved_path =
        save_uploaded_file(Some(&agent.work_dir), &agent.name, &file_name, file_bytes).await?;

    let paste_payload = build_paste_payload(&saved_path, &mime_type, file_bytes);

    if let Err(e) = copy_to_local_clipboard(&paste_payload).await {
        debug!(agent = %agent.name, error = %e, "clipboard copy skipped");
    }

    mux.paste_bytes(&agent.name, &paste_payload)
        .await
        .map_err(|e| AdapterError::PasteFailed(e.to_string()))?;

    info!(
        agent = %agent.name,
        file = %file_name,
        mime = %mime_type,
        bytes = file_bytes.len(),
        saved = %saved_path.display(),
        pasted = paste_payload.len(),
        "file upload pasted"
    );
    Ok(())
}

/// Split a 0x04 payload: `fileName \0 mimeType \0 fileBytes`.
pub fn parse_upload_payload(payload: &[u8]) -> Result<(String, String, &[u8])> {
    let first = payload
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| AdapterError::RequestMalformed("missing filename separator".to_string()))?;
    let second_rel = payload[first + 1..]
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| AdapterError::RequestMalformed("missing mime separator".to_string()))?;
    let second = first + 1 + second_rel;

    let mut file_name = String::from_utf8_lossy(&payload[..first]).trim().to_string();
    if file_name.is_empty() {
        file_name = "attachment.bin".to_string();
    }
    let mime_type = String::from_utf8_lossy(&payload[first + 1..second])
        .trim()
        .to_string();
    Ok((file_name, mime_type, &payload[second + 1..]))
}

/// Inline text files small enough to paste whole; everything else (and every
/// image) pastes the absolute saved path.
pub fn build_paste_payload(saved_path: &Path, mime_type: &str, file_bytes: &[u8]) -> Vec<u8> {
    if mime_type.starts_with("image/") {
        return saved_path.to_string_lossy().into_owned().into_bytes();
    }
    if file_bytes.len() <= MAX_INLINE_PASTE_BYTES
        && is_inline_mime(mime_type)
        && is_utf8_text(file_bytes)
    {
        return file_bytes.to_vec();
    }
    saved_path.to_string_lossy().into_owned().into_bytes()
}

fn is_inline_mime(mime_type: &str) -> bool {
    mime_type.starts_with("text/")
        || matches!(
            mime_type,
            "application/json" | "application/xml" | "application/x-yaml" | "application/javascript"
        )
}

/// Valid UTF-8, no NUL anywhere, no control bytes outside `\t \r \n` in the
/// leading sample.
fn is_utf8_text(data: &[u8]) -> bool {
    if data.is_empty() {
        return true;
    }
    if std::str::from_utf8(data).is_err() || data.contains(&0) {
        return false;
    }
    data.iter()
        .take(4096)
        .all(|b| *b >= 0x20 || matches!(b, b'\n' | b'\r' | b'\t'))
}

/// Save under `<workDir>/.tmux-adapter/uploads/`, falling back to a per-agent
/// directory under the system temp dir.
pub async fn save_uploaded_file(
    work_dir: Option<&Path>,
    agent_name: &str,
    file_name: &str,
    data: &[u8],
) -> Result<PathBuf> {
    let stamped = format!("{}-{}", unix_nanos(), sanitize_path_component(file_name));

    let mut candidates = Vec::with_capacity(2);
    if let Some(dir) = work_dir.filter(|d| !d.as_os_str().is_empty()) {
        candidates.push(dir.join(".tmux-adapter").join("uploads"));
    }
    candidates.push(
        std::env::temp_dir()
            .join("tmux-adapter")
            .join("uploads")
            .join(sanitize_path_component(agent_name)),
    );

    let mut last_err: Option<std::io::Error> = None;
    for dir in candidates {
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            last_err = Some(e);
            continue;
        }
        let path = dir.join(&stamped);
        match tokio::fs::write(&path, data).await {
            Ok(()) => return Ok(path),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err
        .map(AdapterError::Io)
        .unwrap_or_else(|| AdapterError::PasteFailed("no upload path available".to_string())))
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Reduce an uploaded name to one safe path component.
pub fn sanitize_path_component(s: &str) -> String {
    let base = Path::new(s.trim())
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim().trim_matches('.').to_string();
    if cleaned.is_empty() {
        "attachment.bin".to_string()
    } else {
        cleaned
    }
}

/// Pipe the payload into the first available clipboard helper.
async fn copy_to_local_clipboard(data: &[u8]) -> std::result::Result<(), String> {
    use tokio::io::AsyncWriteExt;

    const COMMANDS: &[&[&str]] = &[
        &["pbcopy"],
        &["wl-copy"],
        &["xclip", "-selection", "clipboard", "-in"],
        &["xsel", "--clipboard", "--input"],
    ];

    let mut found = false;
    let mut last_err = String::new();

    for args in COMMANDS {
        let mut cmd = tokio::process::Command::new(args[0]);
        cmd.args(&args[1..])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            // Binary not installed; try the next helper.
            Err(_) => continue,
        };
        found = true;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(data).await;
        }
        match child.wait_with_output().await {
            Ok(out) if out.status.success() => return Ok(()),
            Ok(out) => {
                let msg = String::from_utf8_lossy(&out.stderr).trim().to_string();
                last_err = if msg.is_empty() {
                    format!("{} failed: {}", args[0], out.status)
                } else {
                    format!("{} failed: {msg}", args[0])
                };
            }
            Err(e) => last_err = format!("{} failed: {e}", args[0]),
        }
    }

    if !found {
        return Err("no clipboard command found".to_string());
    }
    Err(last_err)
}
