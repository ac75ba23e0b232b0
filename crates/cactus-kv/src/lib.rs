//! # cactus-kv
//!
//! Token buffer and context window for one generation session.
//!
//! [`TokenWindow`] holds every token the backend has evaluated plus the ones
//! still queued for evaluation, and a cursor (`n_past`) separating the two.
//! When the buffer reaches the context capacity it is brought back under the
//! limit in one of two ways:
//!
//! - **Truncation** ([`TokenWindow::truncate`]): before a prompt is evaluated,
//!   whole blocks right after the kept prefix are dropped. Only the token list
//!   changes; nothing has been computed for the dropped tokens yet.
//! - **Context shift** ([`TokenWindow::context_shift`]): during generation,
//!   half of the evaluated region after the kept prefix is discarded and the
//!   backend cache entries behind it are renumbered instead of recomputed.
//!
//! # Invariants
//! - `n_past <= len <= capacity` after every public operation except
//!   [`TokenWindow::push`], which may fill the window to exactly `capacity`
//! - The first `keep` tokens are never touched by truncation or shifting

use std::fmt;

use cactus_engine::{SequenceCache, TokenId};
use tracing::debug;

/// Tokens reserved at the end of the window that the kept prefix may not claim.
const KEEP_HEADROOM: usize = 4;

/// Error type for window operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("Context capacity must be greater than zero")]
    ZeroCapacity,

    #[error("Kept prefix of {keep} tokens leaves no room in a {capacity}-token window")]
    KeepTooLarge { keep: usize, capacity: usize },

    #[error("Token buffer overflow: {len} tokens in a {capacity}-token window")]
    Overflow { len: usize, capacity: usize },

    #[error("Cannot shift context: n_past={n_past} does not extend past keep={keep}")]
    NothingToDiscard { n_past: usize, keep: usize },
}

pub type WindowResult<T> = Result<T, WindowError>;

/// Outcome of [`TokenWindow::truncate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncation {
    pub block_size: usize,
    pub erased_blocks: usize,
    /// Tokens removed from the buffer (`erased_blocks * block_size`).
    pub removed: usize,
    pub new_len: usize,
}

/// Outcome of [`TokenWindow::context_shift`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shift {
    pub discarded: usize,
    pub n_past: usize,
}

/// Ordered token buffer plus evaluation cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenWindow {
    tokens: Vec<TokenId>,
    n_past: usize,
    capacity: usize,
    keep: usize,
}

impl TokenWindow {
    /// Create an empty window holding at most `capacity` tokens.
    ///
    /// # Errors
    /// - `ZeroCapacity`: if `capacity == 0`
    pub fn new(capacity: usize) -> WindowResult<Self> {
        if capacity == 0 {
            return Err(WindowError::ZeroCapacity);
        }
        Ok(Self {
            tokens: Vec::with_capacity(capacity),
            n_past: 0,
            capacity,
            keep: 0,
        })
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Number of tokens the backend has evaluated.
    pub fn n_past(&self) -> usize {
        self.n_past
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn keep(&self) -> usize {
        self.keep
    }

    /// Whether a shift or truncation is required before appending.
    pub fn is_full(&self) -> bool {
        self.tokens.len() >= self.capacity
    }

    /// Tokens queued for evaluation.
    pub fn pending(&self) -> &[TokenId] {
        &self.tokens[self.n_past..]
    }

    pub fn last(&self) -> Option<TokenId> {
        self.tokens.last().copied()
    }

    /// Resolve and store the kept-prefix length.
    ///
    /// A negative request keeps the whole prompt. The result is clamped into
    /// `[0, capacity - 4]` (or `0` for windows of four tokens or fewer).
    pub fn clamp_keep(&mut self, requested: i32, num_prompt_tokens: usize) -> usize {
        let wanted = if requested < 0 {
            num_prompt_tokens
        } else {
            requested as usize
        };
        let ceiling = self.capacity.saturating_sub(KEEP_HEADROOM);
        self.keep = wanted.min(ceiling);
        self.keep
    }

    /// Queue freshly tokenized prompt tokens.
    ///
    /// A continuation appends after the existing conversation; otherwise the
    /// buffer is replaced and the cursor reset.
    pub fn load(&mut self, tokens: Vec<TokenId>, continuation: bool) {
        if continuation {
            self.tokens.extend(tokens);
        } else {
            self.tokens = tokens;
            self.n_past = 0;
        }
    }

    /// Replace the whole buffer, e.g. with a media-interleaved prompt, placing
    /// the cursor at `n_past` (clamped to the new length).
    pub fn replace(&mut self, tokens: Vec<TokenId>, n_past: usize) {
        self.n_past = n_past.min(tokens.len());
        self.tokens = tokens;
    }

    /// Drop whole blocks after the kept prefix until the buffer fits.
    ///
    /// With `n_left = capacity - keep` and `block = n_left / 2`, the number of
    /// erased blocks is `(len - keep - block) / block`; the first `keep` tokens
    /// and the tail after the erased region survive in order. Returns `None`
    /// when the buffer already fits.
    ///
    /// Cached evaluation past the kept prefix no longer lines up with the
    /// buffer, so the cursor is pulled back to at most `keep`.
    ///
    /// # Errors
    /// - `KeepTooLarge`: the window is too small to form a non-empty block
    /// - `Overflow`: the result still does not fit
    pub fn truncate(&mut self) -> WindowResult<Option<Truncation>> {
        let len = self.tokens.len();
        if len < self.capacity {
            return Ok(None);
        }

        let n_left = self.capacity.saturating_sub(self.keep);
        let block_size = n_left / 2;
        if block_size == 0 {
            return Err(WindowError::KeepTooLarge {
                keep: self.keep,
                capacity: self.capacity,
            });
        }

        let erased_blocks = (len - self.keep - block_size) / block_size;
        let removed = erased_blocks * block_size;
        self.tokens.drain(self.keep..self.keep + removed);
        self.n_past = self.n_past.min(self.keep);

        let new_len = self.tokens.len();
        if new_len >= self.capacity {
            return Err(WindowError::Overflow {
                len: new_len,
                capacity: self.capacity,
            });
        }

        debug!(
            keep = self.keep,
            block_size, erased_blocks, new_len, "prompt truncated"
        );

        Ok(Some(Truncation {
            block_size,
            erased_blocks,
            removed,
            new_len,
        }))
    }

    /// Free room mid-generation by discarding half of the evaluated tokens
    /// after the kept prefix (plus one leading token) and renumbering the
    /// backend cache behind them.
    ///
    /// # Errors
    /// - `NothingToDiscard`: the evaluated region is too short to shift
    pub fn context_shift<C>(&mut self, cache: &mut C) -> WindowResult<Shift>
    where
        C: SequenceCache + ?Sized,
    {
        let first = self.keep + 1;
        let n_left = self.n_past.saturating_sub(first);
        let discarded = n_left / 2;
        if discarded == 0 {
            return Err(WindowError::NothingToDiscard {
                n_past: self.n_past,
                keep: self.keep,
            });
        }

        cache.kv_remove(first, Some(first + discarded));
        cache.kv_shift(first + discarded, self.n_past, -(discarded as isize));

        self.tokens.drain(first..first + discarded);
        self.n_past -= discarded;

        debug!(
            discarded,
            n_past = self.n_past,
            len = self.tokens.len(),
            "context shifted"
        );

        Ok(Shift {
            discarded,
            n_past: self.n_past,
        })
    }

    /// Append a sampled token (not yet evaluated).
    pub fn push(&mut self, token: TokenId) {
        self.tokens.push(token);
    }

    /// Mark `n` more queued tokens as evaluated.
    pub fn advance(&mut self, n: usize) {
        self.n_past = (self.n_past + n).min(self.tokens.len());
    }

    /// Step the cursor back by one so the last token is evaluated again and
    /// produces fresh logits.
    pub fn step_back(&mut self) {
        self.n_past = self.n_past.saturating_sub(1);
    }

    pub fn set_n_past(&mut self, n_past: usize) {
        self.n_past = n_past.min(self.tokens.len());
    }

    /// Discard queued, unevaluated tokens. Returns how many were dropped.
    pub fn rollback(&mut self) -> usize {
        let dropped = self.tokens.len() - self.n_past;
        self.tokens.truncate(self.n_past);
        dropped
    }

    /// Length of the shared prefix between the buffer and `other`.
    pub fn common_prefix(&self, other: &[TokenId]) -> usize {
        self.tokens
            .iter()
            .zip(other)
            .take_while(|(a, b)| a == b)
            .count()
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.n_past = 0;
    }
}

impl fmt::Display for TokenWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[n_past:{}, len:{}, keep:{}, cap:{}]",
            self.n_past,
            self.tokens.len(),
            self.keep,
            self.capacity
        )
    }
}
