//! Latin-1 (ISO-8859-1) codec helpers.
//!
//! The vendor protocol is Latin-1 end-to-end, not UTF-8 — parameter option
//! labels can carry accented characters that would otherwise be mangled.
//! Follows the same `encoding` crate idiom the rest of this codebase uses for
//! non-UTF-8 text (see `timer-core`'s file reader, which falls back from
//! UTF-8 to Windows-1252).

use encoding::all::ISO_8859_1;
use encoding::{DecoderTrap, Encoding};

/// Decode raw bytes off the wire as Latin-1. Every byte value is a valid
/// Latin-1 code point, so this never fails in practice; `DecoderTrap::Replace`
/// is used defensively rather than `unwrap`-ing the result.
pub fn decode(bytes: &[u8]) -> String {
    ISO_8859_1
        .decode(bytes, DecoderTrap::Replace)
        .unwrap_or_else(|_| String::from_utf8_lossy(bytes).into_owned())
}

/// Encode a string back to Latin-1 bytes for writing to the wire. Characters
/// outside the Latin-1 range are replaced with `?`, matching `DecoderTrap`'s
/// replacement behaviour on the decode side.
pub fn encode(text: &str) -> Vec<u8> {
    ISO_8859_1
        .encode(text, encoding::EncoderTrap::Replace)
        .unwrap_or_else(|_| text.bytes().collect())
}
