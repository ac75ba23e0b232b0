//! High-level session management.
//!
//! A [`Session`] owns one loaded model, the generation context built on it,
//! and the optional multimodal and vocoder subsystems. Everything a session
//! needs from the outside (model loading, sampling, prompt formatting,
//! logging, telemetry) arrives through [`Capabilities`].

use std::sync::Arc;

use cactus_engine::{
    BackendLoader, FormatOptions, InferenceBackend, ModelSpec, PromptFormatter, ProjectorLoader,
    TokenId, NULL_TOKEN,
};
use cactus_kv::TokenWindow;
use cactus_multimodal::{MultimodalContext, MultimodalError};
use cactus_runtime::{InferenceTimer, Logger, NoopTelemetry, TelemetryHook, TracingLogger};
use cactus_sampling::{DefaultSamplerFactory, SamplerContext, SamplerFactory};
use cactus_vocoder::{GuideTokens, TtsType, Vocoder};
use uuid::Uuid;

use crate::adapters::AdapterManager;
use crate::chat::{parse_messages_json, ChatTemplateFormatter};
use crate::config::{CompletionParams, ContextParams, LoraAdapter};
use crate::embedding::normalize;
use crate::engine::{
    AudioCapture, BenchResult, CompletionResult, GenerationContext, GenerationState,
    InterruptHandle,
};
use crate::error::{CactusError, Result};

/// External services a session is built from.
#[derive(Clone)]
pub struct Capabilities {
    pub loader: Arc<dyn BackendLoader>,
    pub projector_loader: Option<Arc<dyn ProjectorLoader>>,
    pub sampler_factory: Arc<dyn SamplerFactory>,
    pub formatter: Arc<dyn PromptFormatter>,
    pub logger: Arc<dyn Logger>,
    pub telemetry: Arc<dyn TelemetryHook>,
}

impl Capabilities {
    /// Defaults: reference sampler, chatml/llama3 formatter, `tracing`
    /// logger, no telemetry, no projector loader.
    pub fn new(loader: Arc<dyn BackendLoader>) -> Self {
        Self {
            loader,
            projector_loader: None,
            sampler_factory: Arc::new(DefaultSamplerFactory),
            formatter: Arc::new(ChatTemplateFormatter),
            logger: Arc::new(TracingLogger::default()),
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_projector_loader(mut self, loader: Arc<dyn ProjectorLoader>) -> Self {
        self.projector_loader = Some(loader);
        self
    }

    pub fn with_sampler_factory(mut self, factory: Arc<dyn SamplerFactory>) -> Self {
        self.sampler_factory = factory;
        self
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn PromptFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetryHook>) -> Self {
        self.telemetry = telemetry;
        self
    }
}

/// Output of [`Session::tokenize`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenizeResult {
    /// Tokens, with [`NULL_TOKEN`] at media positions.
    pub tokens: Vec<TokenId>,
    pub has_media: bool,
    pub bitmap_hashes: Vec<String>,
    pub chunk_pos: Vec<usize>,
    pub chunk_pos_media: Vec<usize>,
}

/// Output of [`Session::synthesize`].
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    /// Mono PCM samples.
    pub audio: Vec<f32>,
    pub sample_rate: u32,
    pub completion: CompletionResult,
}

struct SpeechPlan {
    guide: GuideTokens,
    capture: AudioCapture,
}

/// One loaded model and its conversation state.
pub struct Session {
    id: Uuid,
    params: ContextParams,
    spec: ModelSpec,
    caps: Capabilities,
    backend: Option<Box<dyn InferenceBackend>>,
    ctx: GenerationContext,
    multimodal: Option<MultimodalContext>,
    vocoder: Option<Vocoder>,
    adapters: AdapterManager,
}

impl Session {
    /// Validate `params`, load the model and, when `mmproj_path` is set, the
    /// projector.
    ///
    /// `on_progress` receives non-decreasing values in `0..=1`; returning
    /// `false` aborts the load.
    pub fn load<F>(caps: Capabilities, params: ContextParams, mut on_progress: F) -> Result<Self>
    where
        F: FnMut(f32) -> bool,
    {
        params.validate()?;
        let spec = params.to_model_spec();
        caps.logger.info(format_args!(
            "Loading model: {} (n_ctx={}, n_batch={}, n_threads={})",
            spec.path, spec.context_size, spec.n_batch, spec.n_threads
        ));

        let mut last = 0.0f32;
        let mut progress = |p: f32| {
            last = p.clamp(0.0, 1.0).max(last);
            on_progress(last)
        };
        let backend = caps.loader.load(&spec, &mut progress).inspect_err(|e| {
            caps.logger.error(format_args!("Failed to load model {}: {e}", spec.path));
        })?;

        let ctx = GenerationContext::new(backend.n_ctx(), params.n_batch, caps.logger.clone())?;
        caps.logger.info(format_args!(
            "Model loaded: n_ctx={}, n_vocab={}, n_embd={}",
            backend.n_ctx(),
            backend.n_vocab(),
            backend.n_embd()
        ));

        let mmproj = params.mmproj_path.clone();
        let mut session = Self {
            id: Uuid::new_v4(),
            params,
            spec,
            caps,
            backend: Some(backend),
            ctx,
            multimodal: None,
            vocoder: None,
            adapters: AdapterManager::new(),
        };
        if let Some(path) = mmproj {
            session.init_multimodal(&path, session.params.mmproj_use_gpu)?;
        }
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    pub fn is_loaded(&self) -> bool {
        self.backend.is_some()
    }

    pub fn window(&self) -> &TokenWindow {
        self.ctx.window()
    }

    pub fn state(&self) -> &GenerationState {
        self.ctx.state()
    }

    pub fn generation(&self) -> &GenerationContext {
        &self.ctx
    }

    /// Handle for stopping a completion from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.ctx.interrupt_handle()
    }

    pub fn stop_completion(&self) {
        self.ctx.interrupt_handle().interrupt();
    }

    /// Tokenize without special-token insertion. With media, the prompt is
    /// split around media markers and each item hashed.
    pub fn tokenize(&self, text: &str, media: &[String]) -> Result<TokenizeResult> {
        let backend = self.backend.as_deref().ok_or(CactusError::NoModel)?;
        if media.is_empty() {
            return Ok(TokenizeResult {
                tokens: backend.tokenize(text, false, true)?,
                ..TokenizeResult::default()
            });
        }

        let mm = self.multimodal.as_ref().ok_or(MultimodalError::Disabled)?;
        let prompt = mm.tokenize(backend, text, media)?;
        Ok(TokenizeResult {
            has_media: prompt.has_media(),
            tokens: prompt.tokens,
            bitmap_hashes: prompt.bitmap_hashes,
            chunk_pos: prompt.chunk_pos,
            chunk_pos_media: prompt.chunk_pos_media,
        })
    }

    /// Concatenate token pieces; media placeholders are skipped.
    pub fn detokenize(&self, tokens: &[TokenId]) -> Result<String> {
        let backend = self.backend.as_deref().ok_or(CactusError::NoModel)?;
        let bytes: Vec<u8> = tokens
            .iter()
            .filter(|&&t| t != NULL_TOKEN)
            .flat_map(|&t| backend.token_to_piece(t))
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Run a completion.
    ///
    /// `on_token` runs on the calling thread after each token with the text
    /// that became final, holding back partial stop strings and partial
    /// characters. Returning `false` interrupts the completion exactly like
    /// [`InterruptHandle::interrupt`].
    pub fn completion<F>(&mut self, params: &CompletionParams, on_token: F) -> Result<CompletionResult>
    where
        F: FnMut(&str) -> bool,
    {
        self.run(params, None, on_token)
    }

    fn run<F>(
        &mut self,
        params: &CompletionParams,
        plan: Option<SpeechPlan>,
        mut on_token: F,
    ) -> Result<CompletionResult>
    where
        F: FnMut(&str) -> bool,
    {
        let Self {
            id,
            caps,
            backend,
            ctx,
            multimodal,
            ..
        } = self;
        let backend = backend.as_deref_mut().ok_or(CactusError::NoModel)?;

        if ctx.is_predicting() {
            return Err(CactusError::Busy);
        }
        if !params.media.is_empty() && multimodal.is_none() {
            return Err(MultimodalError::Disabled.into());
        }

        let sampler = caps.sampler_factory.build(
            &params.sampling,
            SamplerContext {
                n_vocab: backend.n_vocab(),
                n_ctx: backend.n_ctx(),
                eos: backend.token_eos(),
            },
        )?;

        let continuation = params.continue_conversation && !ctx.window().is_empty();
        if !continuation {
            ctx.rewind(backend);
            if let Some(mm) = multimodal.as_mut() {
                mm.clear_history();
            }
        }
        match plan {
            Some(plan) => {
                ctx.set_guide_tokens(Some(plan.guide));
                ctx.set_audio_capture(Some(plan.capture));
            }
            None => {
                ctx.set_guide_tokens(params.guide_tokens.clone());
                ctx.set_audio_capture(None);
            }
        }

        ctx.begin(params, sampler)?;
        let mut timer = InferenceTimer::start(*id, caps.telemetry.clone());
        let outcome = generate(
            backend,
            ctx,
            multimodal.as_mut(),
            params,
            continuation,
            &mut timer,
            &mut on_token,
        );
        ctx.end();
        let metrics = timer.finish();
        outcome?;

        let result = ctx.result(&metrics);
        caps.logger.info(format_args!(
            "Completion finished: {} prompt tokens, {} predicted, {:.2} tokens/s{}",
            result.tokens_evaluated,
            result.tokens_predicted,
            result.timings.tokens_per_second,
            if result.interrupted { " (interrupted)" } else { "" }
        ));
        Ok(result)
    }

    /// Drop the conversation: tokens, backend cache, flags, guide tokens,
    /// media history and collected audio.
    pub fn rewind(&mut self) -> Result<()> {
        let backend = self.backend.as_deref_mut().ok_or(CactusError::NoModel)?;
        self.ctx.rewind(backend);
        if let Some(mm) = self.multimodal.as_mut() {
            mm.clear_history();
        }
        Ok(())
    }

    /// Embedding of `text`, normalised with the context's `embd_normalize`.
    ///
    /// Without embedding mode this returns zeros and logs a warning.
    pub fn embedding(&mut self, text: &str) -> Result<Vec<f32>> {
        let n_embd = self.backend.as_deref().ok_or(CactusError::NoModel)?.n_embd();
        if !self.params.embedding {
            self.caps.logger.warn(format_args!(
                "Embedding mode not enabled for this context"
            ));
            return Ok(vec![0.0; n_embd]);
        }

        self.run(&CompletionParams::new(text).with_n_predict(0), None, |_| true)?;

        let backend = self.backend.as_deref().ok_or(CactusError::NoModel)?;
        match backend.embeddings() {
            Some(embd) if embd.len() >= n_embd => {
                Ok(normalize(&embd[..n_embd], self.params.embd_normalize))
            }
            _ => {
                self.caps
                    .logger
                    .warn(format_args!("Backend returned no embeddings"));
                Ok(vec![0.0; n_embd])
            }
        }
    }

    /// Measure prompt-processing and generation throughput. Drops the
    /// conversation. See [`GenerationContext::bench`].
    pub fn bench(&mut self, pp: usize, tg: usize, pl: usize, nr: usize) -> Result<BenchResult> {
        let backend = self.backend.as_deref_mut().ok_or(CactusError::NoModel)?;
        let result = self.ctx.bench(backend, pp, tg, pl, nr)?;
        if let Some(mm) = self.multimodal.as_mut() {
            mm.clear_history();
        }
        Ok(result)
    }

    /// Render OpenAI-style `messages_json` into a prompt. `template` falls
    /// back to the model's own template.
    pub fn format_chat(
        &self,
        messages_json: &str,
        template: Option<&str>,
        options: &FormatOptions,
    ) -> Result<String> {
        let messages = parse_messages_json(messages_json, &*self.caps.logger)?;
        let template = template
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| self.backend.as_deref().and_then(|b| b.chat_template()));
        Ok(self
            .caps
            .formatter
            .format(&messages, template.as_deref(), options)?)
    }

    // -----------------------------------------------------------------
    // Multimodal
    // -----------------------------------------------------------------

    /// Load a projector. A previously loaded one is replaced.
    pub fn init_multimodal(&mut self, path: &str, use_gpu: bool) -> Result<()> {
        let backend = self.backend.as_deref().ok_or(CactusError::NoModel)?;
        let loader = self.caps.projector_loader.as_deref().ok_or_else(|| {
            CactusError::InvalidConfig("no projector loader configured".into())
        })?;
        if self.multimodal.take().is_some() {
            self.caps
                .logger
                .info(format_args!("Replacing loaded multimodal context"));
        }
        let mm = MultimodalContext::init(
            loader,
            path,
            use_gpu,
            self.params.n_threads,
            backend,
            self.caps.logger.clone(),
        )?;
        self.multimodal = Some(mm);
        Ok(())
    }

    pub fn is_multimodal_enabled(&self) -> bool {
        self.multimodal.is_some()
    }

    pub fn multimodal(&self) -> Option<&MultimodalContext> {
        self.multimodal.as_ref()
    }

    pub fn supports_vision(&self) -> bool {
        self.multimodal.as_ref().is_some_and(|mm| mm.supports_vision())
    }

    pub fn supports_audio(&self) -> bool {
        self.multimodal.as_ref().is_some_and(|mm| mm.supports_audio())
    }

    /// Free the projector and its media history. Safe to call repeatedly.
    pub fn release_multimodal(&mut self) {
        if self.multimodal.take().is_some() {
            self.caps
                .logger
                .info(format_args!("Multimodal context released"));
        }
    }

    // -----------------------------------------------------------------
    // Vocoder
    // -----------------------------------------------------------------

    /// Load a vocoder with this session's model settings.
    pub fn init_vocoder(&mut self, path: &str) -> Result<()> {
        let backend = self.backend.as_deref().ok_or(CactusError::NoModel)?;
        let vocoder = Vocoder::init(
            &*self.caps.loader,
            path,
            &self.spec,
            backend,
            self.caps.logger.clone(),
        )?;
        self.vocoder = Some(vocoder);
        Ok(())
    }

    pub fn is_vocoder_enabled(&self) -> bool {
        self.vocoder.is_some()
    }

    pub fn tts_type(&self) -> Option<TtsType> {
        self.vocoder.as_ref().map(Vocoder::tts_type)
    }

    /// Free the vocoder. Safe to call repeatedly.
    pub fn release_vocoder(&mut self) {
        if self.vocoder.take().is_some() {
            self.caps.logger.info(format_args!("Vocoder released"));
        }
    }

    /// Prompt that makes the model speak `text` in the voice of
    /// `speaker_json` (empty for the built-in speaker).
    pub fn formatted_audio_completion(&self, speaker_json: &str, text: &str) -> Result<String> {
        let vocoder = self.vocoder.as_ref().ok_or(CactusError::VocoderDisabled)?;
        Ok(vocoder.formatted_prompt(speaker_json, text)?)
    }

    pub fn audio_guide_tokens(&self, text: &str) -> Result<GuideTokens> {
        let vocoder = self.vocoder.as_ref().ok_or(CactusError::VocoderDisabled)?;
        let backend = self.backend.as_deref().ok_or(CactusError::NoModel)?;
        Ok(vocoder.guide_tokens(backend, text)?)
    }

    /// PCM samples for the audio-range tokens in `tokens`.
    pub fn decode_audio_tokens(&mut self, tokens: &[TokenId]) -> Result<Vec<f32>> {
        let n_threads = self.params.n_threads;
        let vocoder = self.vocoder.as_mut().ok_or(CactusError::VocoderDisabled)?;
        Ok(vocoder.decode_audio_tokens(tokens, n_threads)?)
    }

    /// Speak `text`: format the audio prompt, generate audio codes steered by
    /// guide tokens, then decode them. `params.prompt` and `params.media` are
    /// ignored.
    pub fn synthesize(
        &mut self,
        speaker_json: &str,
        text: &str,
        params: &CompletionParams,
    ) -> Result<Synthesis> {
        let (prompt, plan) = {
            let vocoder = self.vocoder.as_ref().ok_or(CactusError::VocoderDisabled)?;
            let backend = self.backend.as_deref().ok_or(CactusError::NoModel)?;
            let prompt = vocoder.formatted_prompt(speaker_json, text)?;
            let plan = SpeechPlan {
                guide: vocoder.guide_tokens(backend, text)?,
                capture: AudioCapture {
                    tts: vocoder.tts_type(),
                    end_token: vocoder.end_of_audio_token(backend)?,
                },
            };
            (prompt, plan)
        };

        let call = CompletionParams {
            prompt,
            media: Vec::new(),
            continue_conversation: false,
            ..params.clone()
        };
        let completion = self.run(&call, Some(plan), |_| true)?;

        let n_threads = params.n_threads.unwrap_or(self.params.n_threads);
        let tokens = self.ctx.audio_tokens().to_vec();
        let vocoder = self.vocoder.as_mut().ok_or(CactusError::VocoderDisabled)?;
        let audio = vocoder.decode_audio_tokens(&tokens, n_threads)?;
        Ok(Synthesis {
            audio,
            sample_rate: vocoder.sample_rate(),
            completion,
        })
    }

    // -----------------------------------------------------------------
    // LoRA adapters
    // -----------------------------------------------------------------

    /// Replace the adapter set; all or nothing.
    pub fn apply_lora_adapters(&mut self, adapters: &[LoraAdapter]) -> Result<()> {
        let backend = self.backend.as_deref_mut().ok_or(CactusError::NoModel)?;
        self.adapters.apply(backend, adapters, &*self.caps.logger)
    }

    pub fn remove_lora_adapters(&mut self) -> Result<()> {
        let backend = self.backend.as_deref_mut().ok_or(CactusError::NoModel)?;
        self.adapters.remove(backend, &*self.caps.logger)
    }

    pub fn lora_adapters(&self) -> &[LoraAdapter] {
        self.adapters.loaded()
    }

    /// Interrupt, free the subsystems, then the model. Safe to call
    /// repeatedly; later calls that need the model fail with `NoModel`.
    pub fn release(&mut self) {
        self.ctx.interrupt_handle().interrupt();
        self.release_multimodal();
        self.release_vocoder();
        if self.backend.take().is_some() {
            self.adapters.forget();
            self.caps.logger.info(format_args!("Session {} released", self.id));
        }
    }
}

/// Load the prompt and step until generation ends, streaming final text.
fn generate(
    backend: &mut dyn InferenceBackend,
    ctx: &mut GenerationContext,
    multimodal: Option<&mut MultimodalContext>,
    params: &CompletionParams,
    continuation: bool,
    timer: &mut InferenceTimer,
    on_token: &mut dyn FnMut(&str) -> bool,
) -> Result<()> {
    match multimodal {
        Some(mm) if !params.media.is_empty() => {
            ctx.load_media_prompt(backend, mm, &params.prompt, &params.media, params.n_keep)?
        }
        mm => {
            ctx.load_prompt(backend, &params.prompt, params.n_keep, continuation)?;
            // Media hashes describe positions the window no longer holds.
            if let Some(mm) = mm {
                if !ctx.window().tokens().contains(&NULL_TOKEN) {
                    mm.clear_history();
                }
            }
        }
    }
    timer.set_prompt_tokens(ctx.num_prompt_tokens());

    while ctx.has_next_token() && !ctx.is_interrupted() {
        if ctx.do_completion(backend)?.is_none() {
            break;
        }
        if params.n_predict == 0 {
            timer.mark_prefill_complete();
        } else {
            timer.mark_token();
        }
        if let Some(text) = ctx.take_stream_text(false) {
            if !on_token(&text) {
                ctx.cancel();
            }
        }
    }

    if !ctx.is_interrupted() {
        if let Some(rest) = ctx.take_stream_text(true) {
            on_token(&rest);
        }
    }
    Ok(())
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("model", &self.params.model)
            .field("loaded", &self.is_loaded())
            .field("ctx", &self.ctx)
            .field("multimodal", &self.multimodal)
            .field("vocoder", &self.vocoder)
            .finish()
    }
}
