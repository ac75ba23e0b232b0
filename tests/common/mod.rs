//! Scripted backend and sampler shared by the integration tests.
//!
//! The backend tokenizes one token per byte (plus a table of special
//! strings) and records every decode and adapter call in a [`CallLog`]. The
//! sampler ignores logits and replays a fixed script, then returns EOS. The
//! projector turns each media item into [`MEDIA_POS`] positions.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use cactus::{Capabilities, ContextParams, InterruptHandle, MemoryLogger, Session};
use cactus_engine::{
    AdapterHandle, BackendLoader, Bitmap, EngineError, InferenceBackend, InputChunk, MediaChunk,
    MediaKind, ModelSpec, Projector, ProjectorLoader, SampledToken, SequenceCache, TokenId,
    TokenProb, TokenSampler,
};
use cactus_sampling::{SamplerContext, SamplerFactory, SamplingParams};

pub const EOS: TokenId = 256;
pub const BOS: TokenId = 257;
pub const N_EMBD: usize = 4;
pub const VOCODER_EMBD: usize = 8;
pub const AUDIO_BASE: TokenId = 151_672;
pub const AUDIO_END: TokenId = 156_000;
pub const MEDIA_POS: usize = 8;
pub const MARKER: &str = "<__media__>";
/// A tiny image as a data URI.
pub const IMAGE_URI: &str = "data:image/png;base64,aGVsbG8=";

/// Everything the backend saw.
#[derive(Debug, Default)]
pub struct CallLog {
    /// `(pos, n_tokens)` per token decode call.
    pub decodes: Vec<(usize, usize)>,
    /// `(pos, n_rows)` per embedding decode call.
    pub embedded: Vec<(usize, usize)>,
    pub media_encodes: usize,
    pub kv_clears: usize,
    pub loaded_adapters: Vec<String>,
    pub active_adapters: Vec<(AdapterHandle, f32)>,
    pub set_adapter_calls: usize,
    pub encoded: Vec<Vec<TokenId>>,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub n_vocab: usize,
    pub add_bos: bool,
    /// Returned by `embeddings()` after any decode.
    pub embeddings: Option<Vec<f32>>,
    pub specials: Vec<(String, TokenId)>,
    /// Index of the decode call that fails.
    pub fail_decode_at: Option<usize>,
    /// Values reported to the load progress callback.
    pub progress: Vec<f32>,
    pub chat_template: Option<String>,
    /// Fires the handle once the decode call with this index has run.
    pub interrupt_on_decode: Option<(usize, InterruptHandle)>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_vocab: 300,
            add_bos: false,
            embeddings: None,
            specials: Vec::new(),
            fail_decode_at: None,
            progress: vec![0.5, 1.0],
            chat_template: None,
            interrupt_on_decode: None,
        }
    }
}

impl ModelConfig {
    /// Vocabulary large enough for audio codes, with the end-of-audio marker
    /// as a single token.
    pub fn tts() -> Self {
        Self {
            n_vocab: 160_000,
            specials: vec![("<|audio_end|>".into(), AUDIO_END)],
            ..Self::default()
        }
    }
}

pub struct ScriptedBackend {
    n_ctx: usize,
    n_embd: usize,
    vocoder: bool,
    config: ModelConfig,
    record: Arc<Mutex<CallLog>>,
    logits: Vec<f32>,
    embd: Option<Vec<f32>>,
}

impl ScriptedBackend {
    pub fn new(n_ctx: usize, config: ModelConfig) -> (Self, Arc<Mutex<CallLog>>) {
        let record = Arc::new(Mutex::new(CallLog::default()));
        (Self::with_record(n_ctx, config, record.clone(), false), record)
    }

    fn with_record(n_ctx: usize, config: ModelConfig, record: Arc<Mutex<CallLog>>, vocoder: bool) -> Self {
        Self {
            n_ctx,
            n_embd: if vocoder { VOCODER_EMBD } else { N_EMBD },
            vocoder,
            config,
            record,
            logits: vec![0.0; 8],
            embd: None,
        }
    }
}

impl SequenceCache for ScriptedBackend {
    fn kv_remove(&mut self, _p0: usize, _p1: Option<usize>) {}

    fn kv_shift(&mut self, _p0: usize, _p1: usize, _delta: isize) {}

    fn kv_clear(&mut self) {
        self.record.lock().unwrap().kv_clears += 1;
    }
}

impl InferenceBackend for ScriptedBackend {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn n_vocab(&self) -> usize {
        self.config.n_vocab
    }

    fn n_embd(&self) -> usize {
        self.n_embd
    }

    fn token_eos(&self) -> TokenId {
        EOS
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == EOS
    }

    fn is_control(&self, token: TokenId) -> bool {
        token == BOS
    }

    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> cactus_engine::Result<Vec<TokenId>> {
        let mut tokens = Vec::new();
        if add_special && self.config.add_bos {
            tokens.push(BOS);
        }
        let bytes = text.as_bytes();
        let mut i = 0;
        'outer: while i < bytes.len() {
            if parse_special {
                for (s, id) in &self.config.specials {
                    if bytes[i..].starts_with(s.as_bytes()) {
                        tokens.push(*id);
                        i += s.len();
                        continue 'outer;
                    }
                }
            }
            tokens.push(TokenId::from(bytes[i]));
            i += 1;
        }
        Ok(tokens)
    }

    fn token_to_piece(&self, token: TokenId) -> Vec<u8> {
        if (0..256).contains(&token) {
            return vec![token as u8];
        }
        if (AUDIO_BASE..AUDIO_END).contains(&token) {
            return format!("<|{}|>", token - AUDIO_BASE).into_bytes();
        }
        self.config
            .specials
            .iter()
            .find(|(_, id)| *id == token)
            .map(|(s, _)| s.clone().into_bytes())
            .unwrap_or_default()
    }

    fn decode(&mut self, tokens: &[TokenId], pos: usize) -> cactus_engine::Result<()> {
        let mut record = self.record.lock().unwrap();
        if self.config.fail_decode_at == Some(record.decodes.len()) || pos + tokens.len() > self.n_ctx {
            return Err(EngineError::Decode {
                pos,
                n_tokens: tokens.len(),
                reason: "scripted failure".into(),
            });
        }
        record.decodes.push((pos, tokens.len()));
        if let Some((at, handle)) = &self.config.interrupt_on_decode {
            if record.decodes.len() == at + 1 {
                handle.interrupt();
            }
        }
        self.embd = self.config.embeddings.clone();
        Ok(())
    }

    fn decode_embeddings(&mut self, _embd: &[f32], n_tokens: usize, pos: usize) -> cactus_engine::Result<()> {
        self.record.lock().unwrap().embedded.push((pos, n_tokens));
        Ok(())
    }

    fn encode(&mut self, tokens: &[TokenId]) -> cactus_engine::Result<()> {
        self.record.lock().unwrap().encoded.push(tokens.to_vec());
        self.embd = Some(vec![0.1; tokens.len() * self.n_embd]);
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }

    fn embeddings(&self) -> Option<&[f32]> {
        self.embd.as_deref()
    }

    fn load_adapter(&mut self, path: &str) -> cactus_engine::Result<AdapterHandle> {
        if path.contains("bad") {
            return Err(EngineError::Adapter {
                path: path.into(),
                reason: "corrupt adapter".into(),
            });
        }
        let mut record = self.record.lock().unwrap();
        record.loaded_adapters.push(path.into());
        Ok(AdapterHandle(record.loaded_adapters.len() as u64))
    }

    fn set_adapters(&mut self, adapters: &[(AdapterHandle, f32)]) -> cactus_engine::Result<()> {
        let mut record = self.record.lock().unwrap();
        record.active_adapters = adapters.to_vec();
        record.set_adapter_calls += 1;
        Ok(())
    }

    fn meta(&self, key: &str) -> Option<String> {
        match key {
            "general.architecture" if self.vocoder => Some("wavtokenizer-dec".into()),
            "general.architecture" => Some("llama".into()),
            "tokenizer.chat_template" => self.config.chat_template.clone(),
            _ => None,
        }
    }
}

/// Hands out scripted backends; paths containing `vocoder` get a vocoder.
pub struct ScriptedLoader {
    pub config: ModelConfig,
    pub record: Arc<Mutex<CallLog>>,
}

impl BackendLoader for ScriptedLoader {
    fn load(
        &self,
        spec: &ModelSpec,
        progress: &mut dyn FnMut(f32) -> bool,
    ) -> cactus_engine::Result<Box<dyn InferenceBackend>> {
        if spec.path.contains("missing") {
            return Err(EngineError::ModelLoad(format!("{}: not found", spec.path)));
        }
        for &p in &self.config.progress {
            if !progress(p) {
                return Err(EngineError::LoadAborted);
            }
        }
        let vocoder = spec.path.contains("vocoder");
        Ok(Box::new(ScriptedBackend::with_record(
            spec.context_size,
            self.config.clone(),
            self.record.clone(),
            vocoder,
        )))
    }
}

/// Vision projector splitting the prompt at [`MARKER`].
pub struct ScriptedProjector {
    record: Arc<Mutex<CallLog>>,
}

impl Projector for ScriptedProjector {
    fn supports_vision(&self) -> bool {
        true
    }

    fn supports_audio(&self) -> bool {
        false
    }

    fn n_embd(&self) -> usize {
        N_EMBD
    }

    fn default_marker(&self) -> &str {
        MARKER
    }

    fn decode_media(&self, bytes: &[u8]) -> cactus_engine::Result<Bitmap> {
        Ok(Bitmap {
            kind: MediaKind::Image,
            id: String::new(),
            data: bytes.to_vec(),
        })
    }

    fn tokenize(
        &self,
        backend: &dyn InferenceBackend,
        text: &str,
        bitmaps: &[Bitmap],
    ) -> cactus_engine::Result<Vec<InputChunk>> {
        let mut chunks = Vec::new();
        let mut media = bitmaps.iter();
        for (i, piece) in text.split(MARKER).enumerate() {
            if i > 0 {
                let bitmap = media
                    .next()
                    .ok_or_else(|| EngineError::Projector("marker without media".into()))?;
                chunks.push(InputChunk::Media(MediaChunk {
                    bitmap: bitmap.clone(),
                    n_tokens: MEDIA_POS,
                    n_pos: MEDIA_POS,
                }));
            }
            if !piece.is_empty() {
                chunks.push(InputChunk::Text(backend.tokenize(piece, i == 0, true)?));
            }
        }
        Ok(chunks)
    }

    fn encode(&mut self, chunk: &MediaChunk) -> cactus_engine::Result<Vec<f32>> {
        self.record.lock().unwrap().media_encodes += 1;
        Ok(vec![0.5; chunk.n_tokens * N_EMBD])
    }
}

/// Paths containing `missing` fail to load.
pub struct ScriptedProjectorLoader {
    pub record: Arc<Mutex<CallLog>>,
}

impl ProjectorLoader for ScriptedProjectorLoader {
    fn load(&self, path: &str, _use_gpu: bool, _n_threads: usize) -> cactus_engine::Result<Box<dyn Projector>> {
        if path.contains("missing") {
            return Err(EngineError::Projector(format!("{path}: not found")));
        }
        Ok(Box::new(ScriptedProjector {
            record: self.record.clone(),
        }))
    }
}

pub struct ScriptedSampler {
    script: VecDeque<TokenId>,
    n_vocab: usize,
    accepted: Arc<Mutex<Vec<(TokenId, bool)>>>,
}

impl ScriptedSampler {
    pub fn new(script: &[TokenId], n_vocab: usize) -> (Self, Arc<Mutex<Vec<(TokenId, bool)>>>) {
        let accepted = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                script: script.iter().copied().collect(),
                n_vocab,
                accepted: accepted.clone(),
            },
            accepted,
        )
    }
}

impl TokenSampler for ScriptedSampler {
    fn sample(&mut self, _logits: &[f32]) -> cactus_engine::Result<SampledToken> {
        let token = self.script.pop_front().unwrap_or(EOS);
        Ok(SampledToken {
            token,
            candidates: vec![
                TokenProb { token, prob: 0.9 },
                TokenProb {
                    token: self.n_vocab as TokenId + 5,
                    prob: 0.06,
                },
                TokenProb {
                    token: TokenId::from(b'a'),
                    prob: 0.04,
                },
            ],
        })
    }

    fn accept(&mut self, token: TokenId, apply_grammar: bool) {
        self.accepted.lock().unwrap().push((token, apply_grammar));
    }

    fn reset(&mut self) {
        self.accepted.lock().unwrap().clear();
    }
}

/// Every completion replays the same script.
pub struct ScriptedSamplerFactory {
    pub script: Vec<TokenId>,
    pub accepted: Arc<Mutex<Vec<(TokenId, bool)>>>,
}

impl SamplerFactory for ScriptedSamplerFactory {
    fn build(
        &self,
        _params: &SamplingParams,
        ctx: SamplerContext,
    ) -> Result<Box<dyn TokenSampler>, EngineError> {
        self.accepted.lock().unwrap().clear();
        Ok(Box::new(ScriptedSampler {
            script: self.script.iter().copied().collect(),
            n_vocab: ctx.n_vocab,
            accepted: self.accepted.clone(),
        }))
    }
}

/// One token per byte of `text`.
pub fn script(text: &str) -> Vec<TokenId> {
    text.bytes().map(TokenId::from).collect()
}

pub struct Harness {
    pub record: Arc<Mutex<CallLog>>,
    pub accepted: Arc<Mutex<Vec<(TokenId, bool)>>>,
    pub logger: MemoryLogger,
}

impl Harness {
    pub fn decode_calls(&self) -> usize {
        self.record.lock().unwrap().decodes.len()
    }
}

pub fn capabilities(config: ModelConfig, sampler_script: &[TokenId]) -> (Capabilities, Harness) {
    let record = Arc::new(Mutex::new(CallLog::default()));
    let accepted = Arc::new(Mutex::new(Vec::new()));
    let logger = MemoryLogger::new();
    let caps = Capabilities::new(Arc::new(ScriptedLoader {
        config,
        record: record.clone(),
    }))
    .with_projector_loader(Arc::new(ScriptedProjectorLoader {
        record: record.clone(),
    }))
    .with_sampler_factory(Arc::new(ScriptedSamplerFactory {
        script: sampler_script.to_vec(),
        accepted: accepted.clone(),
    }))
    .with_logger(Arc::new(logger.clone()));
    (
        caps,
        Harness {
            record,
            accepted,
            logger,
        },
    )
}

pub fn session_with(
    config: ModelConfig,
    params: ContextParams,
    sampler_script: &[TokenId],
) -> (Session, Harness) {
    let (caps, harness) = capabilities(config, sampler_script);
    let session = Session::load(caps, params, |_| true).expect("load scripted model");
    (session, harness)
}

pub fn session(n_ctx: usize, sampler_script: &[TokenId]) -> (Session, Harness) {
    session_with(
        ModelConfig::default(),
        ContextParams::new("model.gguf").with_n_ctx(n_ctx),
        sampler_script,
    )
}
