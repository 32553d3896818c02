//! Engine text decoding.
//!
//! The engine hands out C strings in its own code page. Two encodings are
//! supported: plain 7-bit/UTF-8 text (decoded lossily) and the single-byte
//! Western code page (windows-1252), where the 0x80–0x9F block maps to
//! typographic characters and every other byte maps to the code point with
//! the same value.
//!
//! JSON escaping of the decoded text happens in the emitter, through
//! `serde_json`.

use serde::Deserialize;

/// Code points for bytes 0x80–0x9F in windows-1252.
///
/// Slots the code page leaves undefined (0x81, 0x8D, 0x8F, 0x90, 0x9D) map to
/// the C1 control with the same value, which is what the Windows converter does.
const LEGACY_HIGH_TABLE: [char; 32] = [
    '\u{20AC}', '\u{0081}', '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{008D}', '\u{017D}', '\u{008F}',
    '\u{0090}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}', '\u{0153}', '\u{009D}', '\u{017E}', '\u{0178}',
];

const LEGACY_HIGH_START: u8 = 0x80;
const LEGACY_HIGH_END: u8 = 0x9F;

/// How raw engine bytes are turned into text.
#[derive(Debug, Default, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    /// UTF-8, invalid sequences replaced with U+FFFD.
    #[serde(alias = "utf-8")]
    Utf8,
    /// Single-byte Western code page used by the vendor engine.
    #[default]
    #[serde(rename = "windows-1252", alias = "windows1252", alias = "cp1252")]
    Windows1252,
}

impl TextEncoding {
    /// Decode one engine string.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Windows1252 => decode_legacy(bytes),
        }
    }

    /// Encode text back into engine bytes.
    ///
    /// Characters with no representation in the code page become `?`.
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => text.as_bytes().to_vec(),
            TextEncoding::Windows1252 => text
                .chars()
                .map(|c| encode_legacy_char(c).unwrap_or(b'?'))
                .collect(),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf8",
            TextEncoding::Windows1252 => "windows-1252",
        }
    }
}

/// Map a single windows-1252 byte to its Unicode character.
pub fn decode_legacy_byte(byte: u8) -> char {
    if (LEGACY_HIGH_START..=LEGACY_HIGH_END).contains(&byte) {
        LEGACY_HIGH_TABLE[usize::from(byte - LEGACY_HIGH_START)]
    } else {
        char::from(byte)
    }
}

/// Inverse of [`decode_legacy_byte`]. `None` for characters outside the code page.
pub fn encode_legacy_char(c: char) -> Option<u8> {
    if let Some(pos) = LEGACY_HIGH_TABLE.iter().position(|&mapped| mapped == c) {
        return u8::try_from(pos).ok().map(|pos| pos + LEGACY_HIGH_START);
    }
    match u8::try_from(u32::from(c)) {
        Ok(byte) if !(LEGACY_HIGH_START..=LEGACY_HIGH_END).contains(&byte) => Some(byte),
        _ => None,
    }
}

pub fn decode_legacy(bytes: &[u8]) -> String {
    bytes.iter().copied().map(decode_legacy_byte).collect()
}
