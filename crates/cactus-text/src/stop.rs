//! Stop-string detection over accumulated generation output.

/// How a stop string is matched against the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// The whole stop string must be present; generation halts.
    Full,
    /// The output ends with a non-empty prefix of a stop string. Used to hold
    /// back text from a live stream until it is known not to be a stop.
    Partial,
}

/// Where a stop string was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopMatch<'a> {
    /// Byte offset into the scanned text.
    pub pos: usize,
    pub word: &'a str,
}

/// Configured stop strings, scanned in configuration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopDetector {
    words: Vec<String>,
}

impl StopDetector {
    /// Empty strings are dropped.
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            words: words
                .into_iter()
                .map(Into::into)
                .filter(|w: &String| !w.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// Scan `text` for the configured stop strings.
    ///
    /// In [`StopMode::Full`] only the last `word.len() + last_token_len` bytes
    /// are searched for each word, so output that was already checked on an
    /// earlier token is not rescanned. The leftmost match wins; among matches
    /// at the same offset the earlier configured word wins.
    pub fn find(&self, text: &[u8], last_token_len: usize, mode: StopMode) -> Option<StopMatch<'_>> {
        let mut best: Option<StopMatch<'_>> = None;

        for word in &self.words {
            let needle = word.as_bytes();
            let pos = match mode {
                StopMode::Full => {
                    let window = needle.len() + last_token_len;
                    let from = text.len().saturating_sub(window);
                    find_bytes(&text[from..], needle).map(|p| p + from)
                }
                StopMode::Partial => find_partial_stop(needle, text),
            };

            if let Some(pos) = pos {
                if best.map_or(true, |b| pos < b.pos) {
                    best = Some(StopMatch { pos, word });
                }
            }
        }

        best
    }
}

/// Offset at which the longest prefix of `word` that is also a suffix of
/// `text` begins. A complete `word` at the end of `text` counts.
pub fn find_partial_stop(word: &[u8], text: &[u8]) -> Option<usize> {
    let last = *text.last()?;
    (0..word.len())
        .rev()
        .filter(|&i| word[i] == last)
        .map(|i| &word[..=i])
        .find(|prefix| text.ends_with(prefix))
        .map(|prefix| text.len() - prefix.len())
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
