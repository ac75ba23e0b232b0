//! Per-completion flags and results.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cactus_engine::{TokenId, TokenProb};
use cactus_runtime::InferenceMetrics;

/// Flags of the completion in flight.
///
/// At most one of `stopped_eos`, `stopped_word` and `stopped_limit` is set;
/// none while generation is open or after an interrupt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationState {
    pub is_predicting: bool,
    pub has_next_token: bool,
    pub stopped_eos: bool,
    pub stopped_word: bool,
    pub stopped_limit: bool,
    pub truncated: bool,
    /// The output currently ends inside a multi-byte character.
    pub incomplete: bool,
    /// A media prompt did not fit the context.
    pub context_full: bool,
    pub stopping_word: String,
}

/// Shared interrupt flag. Clones observe the same flag, so one can be handed
/// to another thread to stop a running completion.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running completion to stop. Polled between decode batches and
    /// between tokens.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub(crate) fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// One generated token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenOutput {
    pub token: TokenId,
    /// Raw text bytes of the token; may split a UTF-8 character.
    pub piece: Vec<u8>,
    /// Recorded alternatives, when `n_probs > 0`.
    pub probs: Vec<TokenProb>,
}

/// Wall-clock figures for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Timings {
    pub prompt_n: usize,
    pub prompt_ms: f64,
    pub predicted_n: usize,
    pub predicted_ms: f64,
    pub tokens_per_second: f64,
    pub ttft_ms: f64,
}

impl From<&InferenceMetrics> for Timings {
    fn from(m: &InferenceMetrics) -> Self {
        Self {
            prompt_n: m.prompt_tokens,
            prompt_ms: m.ttft_ms,
            predicted_n: m.generated_tokens,
            predicted_ms: m.decode_time_ms(),
            tokens_per_second: m.tokens_per_sec,
            ttft_ms: m.ttft_ms,
        }
    }
}

/// Outcome of [`crate::Session::completion`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResult {
    pub text: String,
    pub tokens_predicted: usize,
    pub tokens_evaluated: usize,
    pub truncated: bool,
    pub stopped_eos: bool,
    pub stopped_word: bool,
    pub stopped_limit: bool,
    pub stopping_word: String,
    pub interrupted: bool,
    pub context_full: bool,
    /// Per-token alternatives, when requested.
    pub probs: Vec<TokenOutput>,
    pub timings: Timings,
}
