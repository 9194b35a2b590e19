//! Control-mode wire protocol: line classification and response assembly.
//!
//! tmux control mode interleaves framed command responses with unsolicited
//! notifications on a single stdout stream:
//!
//! - `%begin <timestamp> <number> <flags>`: start of a response block
//! - `%end <timestamp> <number> <flags>`: successful end of the block
//! - `%error <timestamp> <number> <flags>`: failed end of the block
//! - `%<name> ...`: async notification outside any block
//! - anything else: payload line inside the current block

/// A classified line of control-mode output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    Begin { number: u64 },
    End { number: u64 },
    Error { number: u64 },
    Notification(Notification),
    Data(String),
    /// Blank noise outside any block.
    Ignored,
}

/// Unsolicited notifications the adapter cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The session list changed (created/destroyed sessions).
    SessionsChanged,
    /// The client switched sessions or a session changed identity.
    SessionChanged { id: String, name: String },
    /// Pane output forwarded by the multiplexer (octal-escaped).
    Output { pane: String, data: String },
    /// The control client is being detached; the connection is ending.
    Exit,
    /// Anything else, kept verbatim for logging.
    Other(String),
}

/// Completed response block: success flag plus the accumulated payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockResult {
    pub number: u64,
    pub success: bool,
    pub text: String,
}

/// Classify a single line of control-mode output.
pub fn parse_control_line(line: &str, in_block: bool) -> ControlLine {
    if let Some(rest) = line.strip_prefix("%begin ") {
        return ControlLine::Begin {
            number: marker_number(rest),
        };
    }
    if let Some(rest) = line.strip_prefix("%end ") {
        return ControlLine::End {
            number: marker_number(rest),
        };
    }
    if let Some(rest) = line.strip_prefix("%error ") {
        return ControlLine::Error {
            number: marker_number(rest),
        };
    }
    if !in_block {
        if line.starts_with('%') {
            return ControlLine::Notification(parse_notification(line));
        }
        if line.is_empty() {
            return ControlLine::Ignored;
        }
    }
    ControlLine::Data(line.to_string())
}

/// Second field of a `%begin`/`%end`/`%error` marker is the command number.
fn marker_number(rest: &str) -> u64 {
    rest.split_whitespace()
        .nth(1)
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

fn parse_notification(line: &str) -> Notification {
    if line == "%sessions-changed" {
        return Notification::SessionsChanged;
    }
    if let Some(rest) = line.strip_prefix("%session-changed ") {
        let (id, name) = rest.split_once(' ').unwrap_or((rest, ""));
        return Notification::SessionChanged {
            id: id.to_string(),
            name: name.to_string(),
        };
    }
    if let Some(rest) = line.strip_prefix("%output ") {
        let (pane, data) = rest.split_once(' ').unwrap_or((rest, ""));
        return Notification::Output {
            pane: pane.to_string(),
            data: decode_octal_escapes(data),
        };
    }
    if line == "%exit" || line.starts_with("%exit ") {
        return Notification::Exit;
    }
    Notification::Other(line.to_string())
}

/// Events produced while feeding lines through [`ResponseAssembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembledEvent {
    Response(BlockResult),
    Notification(Notification),
}

/// Incremental state machine turning the line stream into responses and
/// notifications. One block is open at a time; payload lines accumulate
/// until the matching end or error marker.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    block: Option<(u64, String)>,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its trailing newline). Returns an event when
    /// the line completes a block or carries a notification.
    pub fn feed(&mut self, line: &str) -> Option<AssembledEvent> {
        match parse_control_line(line, self.block.is_some()) {
            ControlLine::Begin { number } => {
                self.block = Some((number, String::new()));
                None
            }
            ControlLine::End { number } => self.finish(number, true),
            ControlLine::Error { number } => self.finish(number, false),
            ControlLine::Data(data) => {
                if let Some((_, buf)) = self.block.as_mut() {
                    if !buf.is_empty() {
                        buf.push('\n');
                    }
                    buf.push_str(&data);
                }
                None
            }
            ControlLine::Notification(n) => Some(AssembledEvent::Notification(n)),
            ControlLine::Ignored => None,
        }
    }

    fn finish(&mut self, number: u64, success: bool) -> Option<AssembledEvent> {
        let (_, text) = self.block.take()?;
        Some(AssembledEvent::Response(BlockResult {
            number,
            success,
            text,
        }))
    }
}

/// Decode tmux control-mode octal escape sequences (`\012` → newline).
///
/// tmux encodes each byte individually, so multi-byte UTF-8 codepoints appear
/// as consecutive escapes (e.g. `\303\273`).
pub fn decode_octal_escapes(input: &str) -> String {
    let src = input.as_bytes();
    let len = src.len();
    let mut buf = Vec::with_capacity(len);
    let mut i = 0;

    while i < len {
        if src[i] == b'\\' && i + 3 < len {
            let (d1, d2, d3) = (src[i + 1], src[i + 2], src[i + 3]);
            if (b'0'..=b'7').contains(&d1)
                && (b'0'..=b'7').contains(&d2)
                && (b'0'..=b'7').contains(&d3)
            {
                let val = u16::from(d1 - b'0') * 64 + u16::from(d2 - b'0') * 8 + u16::from(d3 - b'0');
                if let Ok(byte) = u8::try_from(val) {
                    buf.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        buf.push(src[i]);
        i += 1;
    }

    String::from_utf8_lossy(&buf).into_owned()
}

/// Quote a string for the control-mode command grammar.
/// Double quotes with escaped `\`, `"` and `$` inside.
pub fn quote_arg(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '\\' || c == '"' || c == '$' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_begin_marker() {
        assert_eq!(
            parse_control_line("%begin 1234567890 42 1", false),
            ControlLine::Begin { number: 42 }
        );
    }

    #[test]
    fn parse_end_and_error_markers() {
        assert_eq!(
            parse_control_line("%end 1234567890 42 1", true),
            ControlLine::End { number: 42 }
        );
        assert_eq!(
            parse_control_line("%error 1234567890 7 0", true),
            ControlLine::Error { number: 7 }
        );
    }

    #[test]
    fn parse_notification_outside_block() {
        assert_eq!(
            parse_control_line("%sessions-changed", false),
            ControlLine::Notification(Notification::SessionsChanged)
        );
        assert_eq!(
            parse_control_line("%session-changed $3 hq-mayor", false),
            ControlLine::Notification(Notification::SessionChanged {
                id: "$3".to_string(),
                name: "hq-mayor".to_string(),
            })
        );
    }

    #[test]
    fn percent_line_inside_block_is_data() {
        assert_eq!(
            parse_control_line("%output-ish payload", true),
            ControlLine::Data("%output-ish payload".to_string())
        );
    }

    #[test]
    fn blank_line_outside_block_ignored() {
        assert_eq!(parse_control_line("", false), ControlLine::Ignored);
        assert_eq!(
            parse_control_line("", true),
            ControlLine::Data(String::new())
        );
    }

    #[test]
    fn parse_output_notification_decodes_octal() {
        assert_eq!(
            parse_control_line("%output %5 a\\012b", false),
            ControlLine::Notification(Notification::Output {
                pane: "%5".to_string(),
                data: "a\nb".to_string(),
            })
        );
    }

    #[test]
    fn parse_exit_notification() {
        assert_eq!(
            parse_control_line("%exit", false),
            ControlLine::Notification(Notification::Exit)
        );
        assert_eq!(
            parse_control_line("%exit detached", false),
            ControlLine::Notification(Notification::Exit)
        );
    }

    #[test]
    fn assembler_collects_block_payload() {
        let mut asm = ResponseAssembler::new();
        assert_eq!(asm.feed("%begin 1 10 1"), None);
        assert_eq!(asm.feed("line one"), None);
        assert_eq!(asm.feed("line two"), None);
        assert_eq!(
            asm.feed("%end 1 10 1"),
            Some(AssembledEvent::Response(BlockResult {
                number: 10,
                success: true,
                text: "line one\nline two".to_string(),
            }))
        );
    }

    #[test]
    fn assembler_error_block() {
        let mut asm = ResponseAssembler::new();
        asm.feed("%begin 1 11 1");
        asm.feed("unknown command: bogus");
        assert_eq!(
            asm.feed("%error 1 11 1"),
            Some(AssembledEvent::Response(BlockResult {
                number: 11,
                success: false,
                text: "unknown command: bogus".to_string(),
            }))
        );
    }

    #[test]
    fn assembler_interleaves_notifications() {
        let mut asm = ResponseAssembler::new();
        assert_eq!(
            asm.feed("%sessions-changed"),
            Some(AssembledEvent::Notification(Notification::SessionsChanged))
        );
        asm.feed("%begin 1 12 1");
        asm.feed("payload");
        let resp = asm.feed("%end 1 12 1");
        assert!(matches!(resp, Some(AssembledEvent::Response(_))));
        // Back outside a block: % lines are notifications again.
        assert_eq!(
            asm.feed("%sessions-changed"),
            Some(AssembledEvent::Notification(Notification::SessionsChanged))
        );
    }

    #[test]
    fn assembler_unmatched_end_is_dropped() {
        let mut asm = ResponseAssembler::new();
        // Stray end with no open block (e.g. after a timeout discarded it).
        assert_eq!(asm.feed("payload outside"), None);
        assert_eq!(asm.feed("%end 1 13 1"), None);
    }

    #[test]
    fn decode_octal_basics() {
        assert_eq!(decode_octal_escapes("hello\\012world"), "hello\nworld");
        assert_eq!(decode_octal_escapes("col1\\011col2"), "col1\tcol2");
        assert_eq!(decode_octal_escapes("path\\134file"), "path\\file");
        assert_eq!(decode_octal_escapes("plain"), "plain");
        assert_eq!(decode_octal_escapes(""), "");
    }

    #[test]
    fn decode_octal_partial_and_invalid() {
        assert_eq!(decode_octal_escapes("end\\"), "end\\");
        assert_eq!(decode_octal_escapes("end\\01"), "end\\01");
        assert_eq!(decode_octal_escapes("x\\089y"), "x\\089y");
    }

    #[test]
    fn decode_octal_multibyte_utf8() {
        assert_eq!(decode_octal_escapes("\\302\\273"), "»");
        assert_eq!(decode_octal_escapes("\\342\\227\\217"), "●");
    }

    #[test]
    fn quote_arg_escapes() {
        assert_eq!(quote_arg("hello"), "\"hello\"");
        assert_eq!(quote_arg("a b"), "\"a b\"");
        assert_eq!(quote_arg("a\\b"), "\"a\\\\b\"");
        assert_eq!(quote_arg("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote_arg("$HOME"), "\"\\$HOME\"");
        assert_eq!(quote_arg(""), "\"\"");
    }
}
