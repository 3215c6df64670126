//! Output transcoding and keyboard decoding for the two supported session
//! encodings.
//!
//! Sessions always produce Unicode text. `utf8` terminals receive it
//! unchanged; `cp437` terminals receive single bytes whose values trigger the
//! terminal's built-in code-page rendering (the classic box-drawing and
//! shaded-block glyphs). For example `░` (U+2591) becomes byte `0xB0`, the
//! original shaded block of cp437 ANSI art.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Session terminal encoding. Only these two are supported; anything else in
/// a config file or `set_encoding` call is a configuration fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Utf8,
    Cp437,
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Encoding::Utf8 => write!(f, "utf8"),
            Encoding::Cp437 => write!(f, "cp437"),
        }
    }
}

impl FromStr for Encoding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "utf8" => Ok(Encoding::Utf8),
            "cp437" => Ok(Encoding::Cp437),
            other => Err(anyhow::anyhow!("unsupported encoding: {other}")),
        }
    }
}

impl Encoding {
    /// Encode session output text into the byte stream the client's terminal
    /// expects.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8 => text.as_bytes().to_vec(),
            Encoding::Cp437 => encode_cp437(text),
        }
    }
}

/// The IBM code page 437 glyph table, indexed by byte value. Indices 0x20
/// through 0x7E are plain ASCII; the rest are the PC glyphs many historical
/// terminal clients still render natively.
pub const CP437: [char; 256] = [
    '\u{0000}', '☺', '☻', '♥', '♦', '♣', '♠', '•', '◘', '○', '◙', '♂', '♀', '♪', '♫', '☼',
    '►', '◄', '↕', '‼', '¶', '§', '▬', '↨', '↑', '↓', '→', '←', '∟', '↔', '▲', '▼',
    ' ', '!', '"', '#', '$', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/',
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', ':', ';', '<', '=', '>', '?',
    '@', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O',
    'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', '[', '\\', ']', '^', '_',
    '`', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o',
    'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '{', '|', '}', '~', '⌂',
    'Ç', 'ü', 'é', 'â', 'ä', 'à', 'å', 'ç', 'ê', 'ë', 'è', 'ï', 'î', 'ì', 'Ä', 'Å',
    'É', 'æ', 'Æ', 'ô', 'ö', 'ò', 'û', 'ù', 'ÿ', 'Ö', 'Ü', '¢', '£', '¥', '₧', 'ƒ',
    'á', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ª', 'º', '¿', '⌐', '¬', '½', '¼', '¡', '«', '»',
    '░', '▒', '▓', '│', '┤', '╡', '╢', '╖', '╕', '╣', '║', '╗', '╝', '╜', '╛', '┐',
    '└', '┴', '┬', '├', '─', '┼', '╞', '╟', '╚', '╔', '╩', '╦', '╠', '═', '╬', '╧',
    '╨', '╤', '╥', '╙', '╘', '╒', '╓', '╫', '╪', '┘', '┌', '█', '▄', '▌', '▐', '▀',
    'α', 'ß', 'Γ', 'π', 'Σ', 'σ', 'µ', 'τ', 'Φ', 'Θ', 'Ω', 'δ', '∞', 'φ', 'ε', '∩',
    '≡', '±', '≥', '≤', '⌠', '⌡', '÷', '≈', '°', '∙', '·', '√', 'ⁿ', '²', '■', '\u{00a0}',
];

// Shift-out / shift-in positions. SyncTerm and friends render these as '*',
// so neither the glyph nor the raw byte may ever reach the wire.
const TRIM_LO: u8 = 0x0e;
const TRIM_HI: u8 = 0x0f;

fn reverse_table() -> &'static HashMap<char, u8> {
    static REVERSE: OnceLock<HashMap<char, u8>> = OnceLock::new();
    REVERSE.get_or_init(|| {
        let mut map = HashMap::with_capacity(256);
        for (idx, glyph) in CP437.iter().enumerate() {
            map.entry(*glyph).or_insert(idx as u8);
        }
        map
    })
}

/// Reinterpret Unicode text as a cp437 byte stream. Glyphs present in the
/// table become their table index; everything else falls back to its low
/// latin-1 byte (`?` when none exists). The shift-out/shift-in pair is
/// stripped on both paths.
pub fn encode_cp437(text: &str) -> Vec<u8> {
    let table = reverse_table();
    let mut out = Vec::with_capacity(text.len());
    for ch in text.chars() {
        let byte = match table.get(&ch) {
            Some(idx) => *idx,
            None if (ch as u32) < 0x100 => ch as u32 as u8,
            None => b'?',
        };
        if byte == TRIM_LO || byte == TRIM_HI {
            continue;
        }
        out.push(byte);
    }
    out
}

/// Decode a cp437 byte stream back into the glyphs it renders as.
pub fn decode_cp437(data: &[u8]) -> String {
    data.iter().map(|b| CP437[*b as usize]).collect()
}

/// Incremental keyboard decoder. Input arrives from the telnet relay in
/// arbitrary chunks, so a multi-byte UTF-8 keystroke may be split across two
/// `input` events; the pending tail is carried over to the next feed.
#[derive(Debug)]
pub enum InputDecoder {
    Utf8 { pending: Vec<u8> },
    Cp437,
}

impl InputDecoder {
    pub fn for_encoding(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Utf8 => InputDecoder::Utf8 { pending: Vec::new() },
            Encoding::Cp437 => InputDecoder::Cp437,
        }
    }

    /// Feed raw client bytes, returning every complete keystroke decoded so
    /// far. Invalid UTF-8 decodes to U+FFFD rather than stalling the stream.
    pub fn feed(&mut self, data: &[u8]) -> Vec<char> {
        match self {
            InputDecoder::Cp437 => data.iter().map(|b| CP437[*b as usize]).collect(),
            InputDecoder::Utf8 { pending } => {
                pending.extend_from_slice(data);
                let mut out = Vec::new();
                loop {
                    match std::str::from_utf8(pending) {
                        Ok(s) => {
                            out.extend(s.chars());
                            pending.clear();
                            break;
                        }
                        Err(err) => {
                            let valid = err.valid_up_to();
                            // Safe: everything below valid_up_to was verified.
                            let s = unsafe { std::str::from_utf8_unchecked(&pending[..valid]) };
                            out.extend(s.chars());
                            match err.error_len() {
                                Some(bad) => {
                                    out.push(char::REPLACEMENT_CHARACTER);
                                    pending.drain(..valid + bad);
                                }
                                None => {
                                    // Incomplete tail, wait for the next chunk.
                                    pending.drain(..valid);
                                    break;
                                }
                            }
                        }
                    }
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_maps_to_itself() {
        assert_eq!(encode_cp437("hello, BBS!"), b"hello, BBS!".to_vec());
    }

    #[test]
    fn box_drawing_maps_to_high_bytes() {
        assert_eq!(encode_cp437("░▒▓"), vec![0xb0, 0xb1, 0xb2]);
    }

    #[test]
    fn ansi_escapes_survive_cp437() {
        // ESC is not a table glyph; it passes through the latin-1 fallback.
        assert_eq!(encode_cp437("\x1b[1m"), b"\x1b[1m".to_vec());
    }

    #[test]
    fn trim_glyphs_are_stripped() {
        assert_eq!(encode_cp437("a♫b☼c"), b"abc".to_vec());
        assert_eq!(encode_cp437("a\u{0e}b\u{0f}c"), b"abc".to_vec());
    }

    #[test]
    fn utf8_decoder_carries_partial_sequences() {
        let mut dec = InputDecoder::for_encoding(Encoding::Utf8);
        let bytes = "é".as_bytes();
        assert!(dec.feed(&bytes[..1]).is_empty());
        assert_eq!(dec.feed(&bytes[1..]), vec!['é']);
    }

    #[test]
    fn cp437_decoder_maps_bytes_to_glyphs() {
        let mut dec = InputDecoder::for_encoding(Encoding::Cp437);
        assert_eq!(dec.feed(&[0xb0, b'x']), vec!['░', 'x']);
    }
}
