//! Trailing UTF-8 sequence inspection.
//!
//! Works on a bounded byte tail with no decoding: walk back at most three
//! bytes from the end looking for a lead byte, then compare the number of
//! continuation bytes that follow it with the number its high bits declare.

/// Longest lookback: a 4-byte sequence has its lead 3 bytes before the end.
const MAX_LOOKBACK: usize = 4;

/// Number of trailing bytes that belong to a UTF-8 sequence still missing
/// continuation bytes. Zero when the tail ends on a code point boundary.
///
/// Invalid bytes are not this function's concern: a stray continuation byte
/// with no lead in range is reported as complete.
pub fn incomplete_utf8_len(tail: &[u8]) -> usize {
    for lookback in 0..tail.len().min(MAX_LOOKBACK) {
        let byte = tail[tail.len() - 1 - lookback];

        if byte & 0xC0 == 0x80 {
            continue;
        }
        if byte & 0x80 == 0 {
            return 0;
        }

        let expected = if byte & 0xE0 == 0xC0 {
            1
        } else if byte & 0xF0 == 0xE0 {
            2
        } else if byte & 0xF8 == 0xF0 {
            3
        } else {
            return 0;
        };

        return if lookback < expected { lookback + 1 } else { 0 };
    }
    0
}

/// Whether `tail` ends in the middle of a multi-byte code point.
pub fn is_incomplete_utf8(tail: &[u8]) -> bool {
    incomplete_utf8_len(tail) > 0
}
