//! # cactus-text
//!
//! Text handling for a token stream whose pieces are raw bytes.
//!
//! Generated text is accumulated as bytes because a single token may end in
//! the middle of a multi-byte code point. This crate answers two questions
//! about that byte buffer after every token:
//!
//! - [`utf8`]: does the buffer end inside an unfinished UTF-8 sequence?
//! - [`stop`]: has a configured stop string appeared, fully or as a prefix?

pub mod stop;
pub mod utf8;

pub use stop::{find_partial_stop, StopDetector, StopMatch, StopMode};
pub use utf8::{incomplete_utf8_len, is_incomplete_utf8};

/// Render a token piece for log output. Lone high bytes show as `byte: \xNN`.
pub fn display_piece(piece: &[u8]) -> String {
    match piece {
        [b] if b & 0x80 != 0 => format!("byte: \\x{b:02x}"),
        _ => String::from_utf8_lossy(piece).into_owned(),
    }
}
