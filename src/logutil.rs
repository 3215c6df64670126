//! Logging utilities for raw telnet traffic and other client-originated
//! strings. Keystrokes, negotiation replies, and script output are full of
//! control bytes that would otherwise break single-line log records.

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
/// - other control characters => `\xNN`
///
/// Truncates long strings with an ellipsis to cap log noise.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 160;
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

/// Escape a raw byte chunk (telnet input, IAC sequences) for logging.
/// Printable ASCII passes through, everything else becomes `\xNN`.
pub fn escape_bytes(data: &[u8]) -> String {
    const MAX_PREVIEW: usize = 64;
    let mut out = String::with_capacity(data.len().min(MAX_PREVIEW) * 2);
    for (count, b) in data.iter().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match b {
            0x20..=0x7e => out.push(*b as char),
            b'\\' => out.push_str("\\\\"),
            _ => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", b);
            }
        }
    }
    out
}
