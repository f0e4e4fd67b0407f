//! Helpers for putting raw serial traffic into single-line log records.
//!
//! Modem output is full of CR/LF pairs and the SMS terminator is Ctrl-Z; logging
//! those verbatim splits records and confuses log shippers.

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
/// - other control characters (Ctrl-Z included) => `\\xNN`
///
/// Anything past [`MAX_PREVIEW`] characters is replaced by an ellipsis.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

pub const MAX_PREVIEW: usize = 300;

/// Escaped preview of raw bytes as read from a port (lossy UTF-8).
pub fn escape_bytes(data: &[u8]) -> String {
    escape_log(&String::from_utf8_lossy(data))
}
