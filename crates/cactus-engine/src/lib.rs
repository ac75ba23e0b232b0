//! # cactus-engine
//!
//! The "narrow waist" of the cactus stack. Everything the generation context
//! consumes from the outside world is expressed here as a trait:
//!
//! - [`InferenceBackend`]: model weights, vocabulary, batched decode, KV cache edits
//! - [`BackendLoader`]: turns a [`ModelSpec`] into a backend, reporting progress
//! - [`TokenSampler`]: logits in, one token plus its candidate distribution out
//! - [`Projector`] / [`ProjectorLoader`]: vision/audio encoders for multimodal prompts
//! - [`PromptFormatter`]: chat messages + template → prompt string
//!
//! ## Design Notes
//!
//! ### Exclusive ownership
//! A backend belongs to exactly one session, so the methods that mutate model
//! state (`decode`, `encode`, cache edits, adapter swaps) take `&mut self`.
//! Backends only need to be `Send` so a session can be moved onto a worker thread.
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility. Media placeholder
//! positions in a token stream are marked with [`NULL_TOKEN`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Placeholder for positions occupied by media embeddings.
pub const NULL_TOKEN: TokenId = -1;

/// Errors reported by backend, projector, sampler and formatter implementations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("Model loading aborted by progress callback")]
    LoadAborted,

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Decode failed at position {pos} ({n_tokens} tokens): {reason}")]
    Decode {
        pos: usize,
        n_tokens: usize,
        reason: String,
    },

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Adapter '{path}' could not be loaded: {reason}")]
    Adapter { path: String, reason: String },

    #[error("Projector error: {0}")]
    Projector(String),

    #[error("Sampling failed: {0}")]
    Sampling(String),

    #[error("Prompt formatting failed: {0}")]
    Format(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

// ---------------------------------------------------------------------------
// Load-time configuration
// ---------------------------------------------------------------------------

/// KV cache element type for keys or values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CacheType {
    F32,
    #[default]
    F16,
    BF16,
    Q8_0,
    Q4_0,
    Q4_1,
    IQ4_NL,
    Q5_0,
    Q5_1,
}

impl CacheType {
    pub const ALL: [CacheType; 9] = [
        CacheType::F32,
        CacheType::F16,
        CacheType::BF16,
        CacheType::Q8_0,
        CacheType::Q4_0,
        CacheType::Q4_1,
        CacheType::IQ4_NL,
        CacheType::Q5_0,
        CacheType::Q5_1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::F32 => "f32",
            CacheType::F16 => "f16",
            CacheType::BF16 => "bf16",
            CacheType::Q8_0 => "q8_0",
            CacheType::Q4_0 => "q4_0",
            CacheType::Q4_1 => "q4_1",
            CacheType::IQ4_NL => "iq4_nl",
            CacheType::Q5_0 => "q5_0",
            CacheType::Q5_1 => "q5_1",
        }
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported cache type: {0}")]
pub struct UnknownCacheType(pub String);

impl FromStr for CacheType {
    type Err = UnknownCacheType;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        CacheType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownCacheType(s.to_string()))
    }
}

impl TryFrom<String> for CacheType {
    type Error = UnknownCacheType;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CacheType> for String {
    fn from(value: CacheType) -> Self {
        value.as_str().to_string()
    }
}

/// Pooling applied to per-token embeddings when the backend runs in embedding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingType {
    #[default]
    Unspecified,
    None,
    Mean,
    Cls,
    Last,
    Rank,
}

/// Everything a [`BackendLoader`] needs to bring a model up.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub path: String,
    pub context_size: usize,
    pub n_batch: usize,
    pub n_ubatch: usize,
    pub n_gpu_layers: i32,
    pub n_threads: usize,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub embedding: bool,
    pub pooling: PoolingType,
    pub flash_attn: bool,
    pub cache_type_k: CacheType,
    pub cache_type_v: CacheType,
}

impl ModelSpec {
    pub fn new(path: impl Into<String>, context_size: usize) -> Self {
        Self {
            path: path.into(),
            context_size,
            n_batch: 2048,
            n_ubatch: 512,
            n_gpu_layers: -1,
            n_threads: 4,
            use_mmap: true,
            use_mlock: false,
            embedding: false,
            pooling: PoolingType::Unspecified,
            flash_attn: false,
            cache_type_k: CacheType::F16,
            cache_type_v: CacheType::F16,
        }
    }
}

/// Opaque handle to an adapter loaded into a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdapterHandle(pub u64);

// ---------------------------------------------------------------------------
// Inference backend
// ---------------------------------------------------------------------------

/// Backend-side attention cache for the single sequence a session drives.
///
/// Positions are token indices. A `None` upper bound means "to the end".
pub trait SequenceCache {
    /// Drop cached cells in `[p0, p1)`.
    fn kv_remove(&mut self, p0: usize, p1: Option<usize>);

    /// Renumber cells in `[p0, p1)` by `delta` without re-evaluating them.
    fn kv_shift(&mut self, p0: usize, p1: usize, delta: isize);

    /// Drop every cached cell.
    fn kv_clear(&mut self);
}

/// A loaded model plus its evaluation context.
///
/// The generation context never touches tensors; it only sees token IDs,
/// logits and embedding rows through this trait.
pub trait InferenceBackend: SequenceCache + Send {
    /// Context capacity in tokens.
    fn n_ctx(&self) -> usize;

    fn n_vocab(&self) -> usize;

    /// Width of one embedding row.
    fn n_embd(&self) -> usize;

    fn token_eos(&self) -> TokenId;

    /// End-of-generation tokens (EOS, EOT, ...).
    fn is_eog(&self, token: TokenId) -> bool;

    fn is_control(&self, token: TokenId) -> bool;

    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool)
        -> Result<Vec<TokenId>>;

    /// Raw bytes of a token's text. Pieces may split a UTF-8 code point.
    fn token_to_piece(&self, token: TokenId) -> Vec<u8>;

    /// Evaluate `tokens` at positions `pos..pos + tokens.len()`; logits for the
    /// last one become available through [`InferenceBackend::logits`].
    fn decode(&mut self, tokens: &[TokenId], pos: usize) -> Result<()>;

    /// Evaluate pre-computed embedding rows (`n_tokens * n_embd` floats).
    fn decode_embeddings(&mut self, embd: &[f32], n_tokens: usize, pos: usize) -> Result<()>;

    /// Run the encoder over `tokens` at positions `0..tokens.len()`.
    fn encode(&mut self, tokens: &[TokenId]) -> Result<()>;

    /// Logits produced by the most recent decode.
    fn logits(&self) -> &[f32];

    /// Embeddings produced by the most recent decode/encode, if the context
    /// runs in embedding mode.
    fn embeddings(&self) -> Option<&[f32]>;

    fn load_adapter(&mut self, path: &str) -> Result<AdapterHandle>;

    /// Replace the active adapter set. An empty slice clears it.
    fn set_adapters(&mut self, adapters: &[(AdapterHandle, f32)]) -> Result<()>;

    /// GGUF-style metadata lookup.
    fn meta(&self, key: &str) -> Option<String>;

    fn chat_template(&self) -> Option<String> {
        self.meta("tokenizer.chat_template")
    }

    /// Short human-readable model description, e.g. `llama 1B Q4_0`.
    fn description(&self) -> String {
        self.meta("general.name")
            .or_else(|| self.meta("general.architecture"))
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Size of the model weights in bytes, when known.
    fn model_size(&self) -> u64 {
        0
    }

    /// Parameter count, when known.
    fn n_params(&self) -> u64 {
        0
    }
}

/// Loads backends from model files.
pub trait BackendLoader: Send + Sync {
    /// `progress` receives monotonically increasing values in `0.0..=1.0`;
    /// returning `false` aborts the load with [`EngineError::LoadAborted`].
    fn load(
        &self,
        spec: &ModelSpec,
        progress: &mut dyn FnMut(f32) -> bool,
    ) -> Result<Box<dyn InferenceBackend>>;
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

/// One entry of a candidate distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TokenProb {
    pub token: TokenId,
    pub prob: f32,
}

/// Token chosen by a sampler plus the candidates it chose from, most likely first.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledToken {
    pub token: TokenId,
    pub candidates: Vec<TokenProb>,
}

pub trait TokenSampler: Send {
    fn sample(&mut self, logits: &[f32]) -> Result<SampledToken>;

    /// Record `token` in the penalty history; `apply_grammar` advances any
    /// grammar state as well.
    fn accept(&mut self, token: TokenId, apply_grammar: bool);

    fn reset(&mut self);
}

// ---------------------------------------------------------------------------
// Multimodal projector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
}

/// Decoded media ready for the projector. `id` is the content hash.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    pub kind: MediaKind,
    pub id: String,
    pub data: Vec<u8>,
}

/// A run of media embeddings inside a tokenized prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaChunk {
    pub bitmap: Bitmap,
    /// Embedding rows the chunk produces.
    pub n_tokens: usize,
    /// Positions the chunk occupies in the sequence (may differ from
    /// `n_tokens` for models using M-RoPE).
    pub n_pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputChunk {
    Text(Vec<TokenId>),
    Media(MediaChunk),
}

impl InputChunk {
    /// Positions this chunk occupies in the token stream.
    pub fn n_pos(&self) -> usize {
        match self {
            InputChunk::Text(tokens) => tokens.len(),
            InputChunk::Media(media) => media.n_pos,
        }
    }
}

pub trait Projector: Send {
    fn supports_vision(&self) -> bool;

    fn supports_audio(&self) -> bool;

    /// Width of the embeddings this projector emits.
    fn n_embd(&self) -> usize;

    /// Marker substituted by media in a prompt, e.g. `<__media__>`.
    fn default_marker(&self) -> &str;

    /// Turn raw file bytes into a bitmap; `id` is assigned by the caller.
    fn decode_media(&self, bytes: &[u8]) -> Result<Bitmap>;

    /// Split `text` at each marker, interleaving the given bitmaps.
    fn tokenize(
        &self,
        backend: &dyn InferenceBackend,
        text: &str,
        bitmaps: &[Bitmap],
    ) -> Result<Vec<InputChunk>>;

    /// Compute `chunk.n_tokens * n_embd` embedding values for a media chunk.
    fn encode(&mut self, chunk: &MediaChunk) -> Result<Vec<f32>>;
}

pub trait ProjectorLoader: Send + Sync {
    fn load(&self, path: &str, use_gpu: bool, n_threads: usize) -> Result<Box<dyn Projector>>;
}

// ---------------------------------------------------------------------------
// Prompt formatting
// ---------------------------------------------------------------------------

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Structured-output and tool-calling extras passed to a formatter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    #[serde(default)]
    pub json_schema: Option<String>,
    #[serde(default)]
    pub tools: Option<String>,
    #[serde(default)]
    pub tool_choice: Option<String>,
}

pub trait PromptFormatter: Send + Sync {
    /// `template` is either a known template name or a raw template string;
    /// `None` means the model's own template.
    fn format(
        &self,
        messages: &[ChatMessage],
        template: Option<&str>,
        options: &FormatOptions,
    ) -> Result<String>;
}
