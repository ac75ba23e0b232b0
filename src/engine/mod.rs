//! The sample-decode-accept loop.
//!
//! A [`GenerationContext`] owns the token window and the state of the
//! completion in flight. The backend is passed into each step rather than
//! owned, so the session can lend the same backend to the multimodal and
//! vocoder subsystems between steps.
//!
//! One step ([`GenerationContext::next_token`]):
//! 1. shift the context when the window is full
//! 2. evaluate pending tokens in `n_batch` chunks, polling the interrupt flag
//! 3. sample, let the guide queue override, accept, append
//! 4. decide whether another step follows
//!
//! [`GenerationContext::do_completion`] wraps a step with text assembly,
//! the incomplete UTF-8 rule and stop-string detection.

pub mod actor;
mod bench;
mod state;

use std::collections::VecDeque;
use std::sync::Arc;

use cactus_engine::{InferenceBackend, TokenId, TokenProb, TokenSampler, NULL_TOKEN};
use cactus_kv::TokenWindow;
use cactus_multimodal::{MultimodalContext, MultimodalError};
use cactus_runtime::{InferenceMetrics, LogLevel, Logger};
use cactus_text::{display_piece, incomplete_utf8_len, is_incomplete_utf8, StopDetector, StopMode};
use cactus_vocoder::{GuideTokens, TtsType};

use crate::config::CompletionParams;
use crate::error::{CactusError, Result};

pub use bench::BenchResult;
pub use state::{CompletionResult, GenerationState, InterruptHandle, Timings, TokenOutput};

/// Consecutive steps granted to finish a multi-byte character once the
/// budget is spent. A character has at most three continuation bytes.
const MAX_UTF8_EXTENSIONS: usize = 4;

/// Guide tokens steering an audio completion.
#[derive(Debug, Clone, Default)]
struct GuideQueue {
    tokens: VecDeque<TokenId>,
    resume_marker: Option<TokenId>,
    armed: bool,
}

impl GuideQueue {
    fn new(guide: GuideTokens) -> Self {
        Self {
            tokens: guide.tokens.into(),
            resume_marker: guide.resume_marker,
            armed: true,
        }
    }

    /// Replace `sampled` with the next guide token when armed, unless the
    /// model produced a control or end-of-generation token. The queue re-arms
    /// after the resume marker; without a marker it stays armed.
    fn steer(&mut self, sampled: TokenId, backend: &dyn InferenceBackend) -> TokenId {
        let mut token = sampled;
        if self.armed && !backend.is_control(sampled) && !backend.is_eog(sampled) {
            if let Some(guided) = self.tokens.pop_front() {
                token = guided;
            }
        }
        self.armed = self.resume_marker.map_or(true, |marker| token == marker);
        token
    }
}

/// Audio-token collection for a speech completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioCapture {
    pub tts: TtsType,
    /// Ends generation like EOS when sampled.
    pub end_token: Option<TokenId>,
}

/// Token window plus the completion in flight.
pub struct GenerationContext {
    window: TokenWindow,
    state: GenerationState,
    interrupt: InterruptHandle,
    sampler: Option<Box<dyn TokenSampler>>,
    stop: StopDetector,
    n_batch: usize,
    n_predict: i32,
    n_remain: i32,
    n_probs: usize,
    num_prompt_tokens: usize,
    num_tokens_predicted: usize,
    generated: Vec<u8>,
    /// Output bytes not yet scanned for stop strings.
    unscanned: usize,
    /// Output bytes already handed to the stream.
    streamed: usize,
    utf8_extensions: usize,
    probs: Vec<TokenOutput>,
    guide: GuideQueue,
    audio: Option<AudioCapture>,
    audio_tokens: Vec<TokenId>,
    logger: Arc<dyn Logger>,
}

impl GenerationContext {
    pub fn new(n_ctx: usize, n_batch: usize, logger: Arc<dyn Logger>) -> Result<Self> {
        Ok(Self {
            window: TokenWindow::new(n_ctx)?,
            state: GenerationState::default(),
            interrupt: InterruptHandle::new(),
            sampler: None,
            stop: StopDetector::default(),
            n_batch: n_batch.max(1),
            n_predict: -1,
            n_remain: 0,
            n_probs: 0,
            num_prompt_tokens: 0,
            num_tokens_predicted: 0,
            generated: Vec::new(),
            unscanned: 0,
            streamed: 0,
            utf8_extensions: 0,
            probs: Vec::new(),
            guide: GuideQueue::default(),
            audio: None,
            audio_tokens: Vec::new(),
            logger,
        })
    }

    pub fn window(&self) -> &TokenWindow {
        &self.window
    }

    pub fn state(&self) -> &GenerationState {
        &self.state
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_interrupted()
    }

    pub fn is_predicting(&self) -> bool {
        self.state.is_predicting
    }

    pub fn has_next_token(&self) -> bool {
        self.state.has_next_token
    }

    pub fn num_prompt_tokens(&self) -> usize {
        self.num_prompt_tokens
    }

    pub fn tokens_predicted(&self) -> usize {
        self.num_tokens_predicted
    }

    pub fn n_remain(&self) -> i32 {
        self.n_remain
    }

    /// Output so far, with invalid UTF-8 replaced.
    pub fn generated_text(&self) -> String {
        String::from_utf8_lossy(&self.generated).into_owned()
    }

    /// Audio-range tokens collected by the last speech completion.
    pub fn audio_tokens(&self) -> &[TokenId] {
        &self.audio_tokens
    }

    /// Steer the next completion with `guide`; `None` turns steering off.
    pub fn set_guide_tokens(&mut self, guide: Option<GuideTokens>) {
        self.guide = guide.map(GuideQueue::new).unwrap_or_default();
    }

    pub fn set_audio_capture(&mut self, capture: Option<AudioCapture>) {
        self.audio = capture;
    }

    /// Forget the conversation: window, backend cache, flags, guide tokens
    /// and collected audio.
    pub fn rewind(&mut self, backend: &mut dyn InferenceBackend) {
        self.window.clear();
        backend.kv_clear();
        self.state = GenerationState::default();
        self.interrupt.reset();
        self.sampler = None;
        self.n_remain = 0;
        self.num_prompt_tokens = 0;
        self.num_tokens_predicted = 0;
        self.clear_output();
        self.guide = GuideQueue::default();
        self.audio = None;
        self.audio_tokens.clear();
    }

    fn clear_output(&mut self) {
        self.generated.clear();
        self.unscanned = 0;
        self.streamed = 0;
        self.utf8_extensions = 0;
        self.probs.clear();
    }

    /// Enter the predicting state with a fresh sampler.
    ///
    /// # Errors
    /// - `Busy`: a completion is already in progress
    pub fn begin(&mut self, params: &CompletionParams, sampler: Box<dyn TokenSampler>) -> Result<()> {
        if self.state.is_predicting {
            return Err(CactusError::Busy);
        }
        self.state = GenerationState {
            is_predicting: true,
            ..GenerationState::default()
        };
        self.interrupt.reset();
        self.sampler = Some(sampler);
        self.stop = StopDetector::new(params.stop.iter().cloned());
        self.n_predict = params.n_predict;
        self.n_remain = params.n_predict;
        self.n_probs = params.sampling.n_probs;
        self.num_prompt_tokens = 0;
        self.num_tokens_predicted = 0;
        self.clear_output();
        self.audio_tokens.clear();
        self.logger.verbose(format_args!(
            "Beginning completion: n_predict={}, stop words={}",
            self.n_predict,
            self.stop.words().len()
        ));
        Ok(())
    }

    /// Tokenize `prompt` into the window.
    ///
    /// A continuation appends to the previous turn without a leading BOS.
    /// Prompts that reach the context size are truncated around the kept
    /// prefix. Cache entries past the evaluated prefix are dropped.
    ///
    /// Media positions can only be evaluated through the projector, so a
    /// truncation that would queue them for token decoding restarts the
    /// conversation with `prompt` alone.
    pub fn load_prompt(
        &mut self,
        backend: &mut dyn InferenceBackend,
        prompt: &str,
        n_keep: i32,
        continuation: bool,
    ) -> Result<()> {
        let continuation = continuation && !self.window.is_empty();
        let mut tokens = backend.tokenize(prompt, !continuation, true)?;
        self.place_prompt(tokens.clone(), n_keep, continuation)?;

        if self.window.pending().contains(&NULL_TOKEN) {
            self.logger.warn(format_args!(
                "Truncation left media positions unevaluated, restarting conversation: {}",
                self.window
            ));
            self.window.clear();
            backend.kv_clear();
            tokens = backend.tokenize(prompt, true, true)?;
            self.place_prompt(tokens.clone(), n_keep, false)?;
        }

        if let Some(sampler) = self.sampler.as_mut() {
            for &token in &tokens {
                sampler.accept(token, false);
            }
        }

        backend.kv_remove(self.window.n_past(), None);
        self.state.has_next_token = true;
        self.logger.verbose(format_args!(
            "Prompt loaded: {} tokens, {}",
            self.num_prompt_tokens, self.window
        ));
        Ok(())
    }

    /// Queue `tokens`, resolve the kept prefix over the whole buffer and
    /// truncate when the buffer reaches the context size.
    fn place_prompt(&mut self, tokens: Vec<TokenId>, n_keep: i32, continuation: bool) -> Result<()> {
        self.window.load(tokens, continuation);
        if self.window.is_empty() {
            return Err(CactusError::InvalidRequest("prompt produced no tokens".into()));
        }

        self.num_prompt_tokens = self.window.len();
        let keep = self.window.clamp_keep(n_keep, self.num_prompt_tokens);
        if let Some(t) = self.window.truncate()? {
            self.state.truncated = true;
            self.num_prompt_tokens = t.new_len;
            self.logger.verbose(format_args!(
                "Input truncated: n_ctx={}, n_keep={keep}, block={}, erased={}, new_len={}",
                self.window.capacity(),
                t.block_size,
                t.erased_blocks,
                t.new_len
            ));
        }
        Ok(())
    }

    /// Load and evaluate a prompt with media attachments.
    ///
    /// A prompt that does not fit sets `context_full` and ends the completion
    /// without output. Any other failure clears the window and cache, since
    /// evaluation may have stopped between chunks.
    pub fn load_media_prompt(
        &mut self,
        backend: &mut dyn InferenceBackend,
        mm: &mut MultimodalContext,
        prompt: &str,
        media: &[String],
        n_keep: i32,
    ) -> Result<()> {
        let eval = match mm.process(backend, &mut self.window, prompt, media, self.n_batch) {
            Ok(eval) => eval,
            Err(MultimodalError::ContextFull { needed, capacity }) => {
                self.state.context_full = true;
                self.state.has_next_token = false;
                self.logger.warn(format_args!(
                    "Not enough context space: prompt needs {needed} positions, context holds {capacity}"
                ));
                return Ok(());
            }
            Err(e) => {
                self.state.has_next_token = false;
                self.window.clear();
                backend.kv_clear();
                mm.clear_history();
                return Err(e.into());
            }
        };

        self.num_prompt_tokens = eval.n_tokens;
        if let Some(sampler) = self.sampler.as_mut() {
            for &token in self.window.tokens().iter().filter(|&&t| t != NULL_TOKEN) {
                sampler.accept(token, false);
            }
        }
        self.window.clamp_keep(n_keep, eval.n_tokens);
        self.state.has_next_token = true;
        self.logger.verbose(format_args!(
            "Media prompt loaded: {} positions, {} reused, n_past={}",
            eval.n_tokens, eval.reused, eval.n_past
        ));
        Ok(())
    }

    /// One generation step. Returns `None` when interrupted during evaluation.
    ///
    /// With `n_predict == 0` the prompt is evaluated and the EOS token is
    /// returned without sampling.
    pub fn next_token(&mut self, backend: &mut dyn InferenceBackend) -> Result<Option<TokenOutput>> {
        if self.window.is_full() {
            let shift = self.window.context_shift(&mut *backend).inspect_err(|_| {
                self.state.has_next_token = false;
            })?;
            self.state.truncated = true;
            self.logger.verbose(format_args!(
                "Context shifted: discarded {} tokens, n_past={}",
                shift.discarded, shift.n_past
            ));
        }

        while self.window.n_past() < self.window.len() {
            if self.interrupt.is_interrupted() {
                let dropped = self.window.rollback();
                self.state.has_next_token = false;
                self.logger.verbose(format_args!(
                    "Interrupted during evaluation, dropped {dropped} pending tokens"
                ));
                return Ok(None);
            }

            let n_past = self.window.n_past();
            let n_eval = (self.window.len() - n_past).min(self.n_batch);
            let batch = &self.window.tokens()[n_past..n_past + n_eval];
            if let Err(e) = backend.decode(batch, n_past) {
                self.state.has_next_token = false;
                self.window.rollback();
                self.logger.error(format_args!(
                    "Failed to eval, n_eval: {n_eval}, n_past: {n_past}: {e}"
                ));
                return Err(e.into());
            }
            self.window.advance(n_eval);
        }

        if self.n_predict == 0 {
            self.state.has_next_token = false;
            return Ok(Some(TokenOutput {
                token: backend.token_eos(),
                piece: Vec::new(),
                probs: Vec::new(),
            }));
        }

        let Some(sampler) = self.sampler.as_mut() else {
            self.state.has_next_token = false;
            return Err(CactusError::InvalidRequest("completion was not started".into()));
        };
        let sampled = match sampler.sample(backend.logits()) {
            Ok(s) => s,
            Err(e) => {
                self.state.has_next_token = false;
                return Err(e.into());
            }
        };

        let token = self.guide.steer(sampled.token, &*backend);
        if token != sampled.token {
            self.logger.verbose(format_args!(
                "Guide token {token} replaced sampled {}",
                sampled.token
            ));
        }

        let probs: Vec<TokenProb> = if self.n_probs > 0 {
            let n_vocab = backend.n_vocab();
            sampled
                .candidates
                .iter()
                .filter(|c| c.token >= 0 && (c.token as usize) < n_vocab)
                .take(self.n_probs)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        sampler.accept(token, true);
        self.window.push(token);
        self.num_tokens_predicted += 1;
        if self.n_remain > 0 {
            self.n_remain -= 1;
        }

        let end_of_audio = self.audio.and_then(|a| a.end_token) == Some(token);
        if backend.is_eog(token) || end_of_audio {
            self.state.stopped_eos = true;
            self.state.has_next_token = false;
            self.logger.verbose(format_args!("Stopped by EOS token {token}"));
        } else {
            self.state.has_next_token = self.n_predict < 0 || self.n_remain > 0;
        }

        Ok(Some(TokenOutput {
            token,
            piece: Vec::new(),
            probs,
        }))
    }

    /// One step plus output assembly.
    ///
    /// When the budget runs out while the output ends inside a multi-byte
    /// character, one more step is granted (and one unit of budget restored)
    /// so a character is never cut. Stop strings are only searched once the
    /// output ends on a character boundary; a match truncates the output at
    /// the match.
    pub fn do_completion(
        &mut self,
        backend: &mut dyn InferenceBackend,
    ) -> Result<Option<TokenOutput>> {
        let Some(mut out) = self.next_token(backend)? else {
            return Ok(None);
        };
        if self.n_predict == 0 {
            return Ok(Some(out));
        }

        out.piece = backend.token_to_piece(out.token);
        self.generated.extend_from_slice(&out.piece);
        self.unscanned += out.piece.len();

        if let Some(capture) = self.audio {
            if capture.tts.is_audio_token(out.token) {
                self.audio_tokens.push(out.token);
            }
        }

        self.state.incomplete = is_incomplete_utf8(&self.generated);
        if !self.state.incomplete {
            self.utf8_extensions = 0;
        } else if !self.state.has_next_token
            && !self.state.stopped_eos
            && self.n_predict > 0
            && self.utf8_extensions < MAX_UTF8_EXTENSIONS
        {
            self.state.has_next_token = true;
            self.n_remain += 1;
            self.utf8_extensions += 1;
        }

        if !self.state.incomplete && !self.state.stopped_eos {
            if let Some(m) = self.stop.find(&self.generated, self.unscanned, StopMode::Full) {
                let (pos, word) = (m.pos, m.word.to_string());
                self.generated.truncate(pos);
                self.state.stopped_word = true;
                self.state.has_next_token = false;
                self.logger.verbose(format_args!("Stopped by word: {word}"));
                self.state.stopping_word = word;
            }
            self.unscanned = 0;
        }

        if !self.state.has_next_token
            && !self.state.stopped_eos
            && !self.state.stopped_word
            && self.n_predict > 0
            && self.n_remain <= 0
        {
            self.state.stopped_limit = true;
            self.logger.verbose(format_args!(
                "Stopped by limit after {} tokens",
                self.num_tokens_predicted
            ));
        }

        if self.logger.enabled(LogLevel::Verbose) {
            self.logger.verbose(format_args!(
                "Token {} -> {}",
                out.token,
                display_piece(&out.piece)
            ));
        }
        if self.n_probs > 0 {
            self.probs.push(out.clone());
        }
        Ok(Some(out))
    }

    /// Output that is safe to show and has not been streamed yet.
    ///
    /// While generation is open, a trailing partial character and any suffix
    /// that could still grow into a stop string are held back. `finished`
    /// releases everything that remains.
    pub fn take_stream_text(&mut self, finished: bool) -> Option<String> {
        let mut end = self.generated.len();
        if !finished && !self.state.stopped_word {
            end -= incomplete_utf8_len(&self.generated);
            if let Some(m) = self.stop.find(&self.generated[..end], 0, StopMode::Partial) {
                end = end.min(m.pos);
            }
        }
        if end <= self.streamed {
            return None;
        }
        let text = String::from_utf8_lossy(&self.generated[self.streamed..end]).into_owned();
        self.streamed = end;
        Some(text)
    }

    /// Stop from inside the generation thread: same path as an external
    /// interrupt, dropping the token that was not evaluated yet.
    pub fn cancel(&mut self) {
        self.interrupt.interrupt();
        self.window.rollback();
        self.state.has_next_token = false;
    }

    /// Leave the predicting state. An interrupted completion loses its
    /// unevaluated tail.
    pub fn end(&mut self) {
        if self.interrupt.is_interrupted() {
            self.window.rollback();
            self.state.has_next_token = false;
        }
        self.state.is_predicting = false;
        self.sampler = None;
    }

    pub fn result(&self, metrics: &InferenceMetrics) -> CompletionResult {
        CompletionResult {
            text: self.generated_text(),
            tokens_predicted: self.num_tokens_predicted,
            tokens_evaluated: self.num_prompt_tokens,
            truncated: self.state.truncated,
            stopped_eos: self.state.stopped_eos,
            stopped_word: self.state.stopped_word,
            stopped_limit: self.state.stopped_limit,
            stopping_word: self.state.stopping_word.clone(),
            interrupted: self.interrupt.is_interrupted(),
            context_full: self.state.context_full,
            probs: self.probs.clone(),
            timings: Timings::from(metrics),
        }
    }
}

impl std::fmt::Debug for GenerationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationContext")
            .field("window", &self.window)
            .field("state", &self.state)
            .field("n_remain", &self.n_remain)
            .finish()
    }
}
