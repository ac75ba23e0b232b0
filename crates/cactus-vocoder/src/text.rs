//! Text normalisation for OuteTTS prompts.

use std::sync::LazyLock;

use regex::Regex;

use crate::TtsType;

static NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+(\.\d+)?").expect("valid regex"));
static SPECIAL_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[-_/,.\\]").expect("valid regex"));
static NON_ALPHA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z\s]").expect("valid regex"));
static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

const ONES: [&str; 20] = [
    "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
    "eleven", "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen", "eighteen",
    "nineteen",
];

const TENS: [&str; 10] = [
    "", "", "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety",
];

const SCALES: [(u32, &str); 3] = [
    (1_000_000_000, "billion"),
    (1_000_000, "million"),
    (1_000, "thousand"),
];

fn below_thousand(mut n: u32) -> String {
    let mut out = String::new();
    if n >= 100 {
        out.push_str(ONES[(n / 100) as usize]);
        out.push_str(" hundred ");
        n %= 100;
    }
    if n >= 20 {
        out.push_str(TENS[(n / 10) as usize]);
        if n % 10 > 0 {
            out.push('-');
            out.push_str(ONES[(n % 10) as usize]);
        }
    } else if n > 0 {
        out.push_str(ONES[n as usize]);
    }
    out
}

/// Spell out a decimal literal such as `"42"` or `"3.14"`.
///
/// Integer parts beyond `i32` range become a single space.
pub fn number_to_words(number: &str) -> String {
    let (integer, fraction) = match number.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (number, None),
    };
    let Ok(value) = integer.parse::<i32>() else {
        return " ".to_string();
    };
    let mut n = value.unsigned_abs();

    let mut out = String::new();
    if n == 0 {
        out.push_str("zero");
    } else {
        for (scale, name) in SCALES {
            if n >= scale {
                out.push_str(&below_thousand(n / scale));
                out.push(' ');
                out.push_str(name);
                out.push(' ');
                n %= scale;
            }
        }
        if n > 0 {
            out.push_str(&below_thousand(n));
        }
    }

    if let Some(fraction) = fraction {
        out.push_str(" point");
        for digit in fraction.bytes().filter(u8::is_ascii_digit) {
            out.push(' ');
            out.push_str(ONES[(digit - b'0') as usize]);
        }
    }
    out
}

/// Normalise `text` into the word sequence an OuteTTS model expects,
/// joined by the type's separator.
pub fn process_text(text: &str, tts: TtsType) -> String {
    let spelled = NUMBER.replace_all(text, |caps: &regex::Captures<'_>| number_to_words(&caps[0]));
    let lower = spelled.to_lowercase();
    let spaced = SPECIAL_CHARS.replace_all(&lower, " ");
    let letters = NON_ALPHA.replace_all(&spaced, "");
    let collapsed = WHITESPACE_RUN.replace_all(&letters, " ");
    collapsed.trim().replace(' ', tts.config().separator)
}
