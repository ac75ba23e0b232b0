//! Session and completion configuration.
//!
//! Both structs deserialize with per-field defaults, so a binding can pass a
//! JSON document containing only the fields it sets.

use cactus_engine::{CacheType, ModelSpec, PoolingType};
use cactus_sampling::SamplingParams;
use cactus_vocoder::GuideTokens;
use serde::Deserialize;

use crate::error::{CactusError, Result};

/// Init-time options for a [`crate::Session`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContextParams {
    /// Path to the model file.
    pub model: String,

    /// Context size in tokens.
    #[serde(default = "default_n_ctx")]
    pub n_ctx: usize,

    /// Maximum tokens submitted to the backend in one decode call.
    #[serde(default = "default_n_batch")]
    pub n_batch: usize,

    #[serde(default = "default_n_ubatch")]
    pub n_ubatch: usize,

    /// Layers offloaded to the GPU; `-1` offloads all of them.
    #[serde(default = "default_n_gpu_layers")]
    pub n_gpu_layers: i32,

    #[serde(default = "default_n_threads")]
    pub n_threads: usize,

    #[serde(default = "default_true")]
    pub use_mmap: bool,

    #[serde(default)]
    pub use_mlock: bool,

    /// Run the model in embedding mode.
    #[serde(default)]
    pub embedding: bool,

    /// Embedding normalisation: `-1` none, `0` max-abs, `1` taxicab,
    /// `2` euclidean, `>2` p-norm.
    #[serde(default = "default_embd_normalize")]
    pub embd_normalize: i32,

    #[serde(default)]
    pub pooling: PoolingType,

    #[serde(default)]
    pub flash_attn: bool,

    #[serde(default)]
    pub cache_type_k: CacheType,

    #[serde(default)]
    pub cache_type_v: CacheType,

    /// Projector to load alongside the model.
    #[serde(default)]
    pub mmproj_path: Option<String>,

    #[serde(default = "default_true")]
    pub mmproj_use_gpu: bool,
}

fn default_n_ctx() -> usize {
    512
}
fn default_n_batch() -> usize {
    2048
}
fn default_n_ubatch() -> usize {
    512
}
fn default_n_gpu_layers() -> i32 {
    -1
}
fn default_n_threads() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_embd_normalize() -> i32 {
    2
}
fn default_n_predict() -> i32 {
    -1
}

impl ContextParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            n_ctx: default_n_ctx(),
            n_batch: default_n_batch(),
            n_ubatch: default_n_ubatch(),
            n_gpu_layers: default_n_gpu_layers(),
            n_threads: default_n_threads(),
            use_mmap: true,
            use_mlock: false,
            embedding: false,
            embd_normalize: default_embd_normalize(),
            pooling: PoolingType::Unspecified,
            flash_attn: false,
            cache_type_k: CacheType::F16,
            cache_type_v: CacheType::F16,
            mmproj_path: None,
            mmproj_use_gpu: true,
        }
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn with_n_ctx(mut self, n_ctx: usize) -> Self {
        self.n_ctx = n_ctx;
        self
    }

    pub fn with_n_batch(mut self, n_batch: usize) -> Self {
        self.n_batch = n_batch;
        self
    }

    pub fn with_n_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = n_threads;
        self
    }

    pub fn with_embedding(mut self, embedding: bool) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn with_embd_normalize(mut self, mode: i32) -> Self {
        self.embd_normalize = mode;
        self
    }

    pub fn with_cache_types(mut self, k: CacheType, v: CacheType) -> Self {
        self.cache_type_k = k;
        self.cache_type_v = v;
        self
    }

    pub fn with_mmproj(mut self, path: impl Into<String>, use_gpu: bool) -> Self {
        self.mmproj_path = Some(path.into());
        self.mmproj_use_gpu = use_gpu;
        self
    }

    /// # Errors
    /// - `InvalidConfig`: empty model path or a zero context, batch or
    ///   thread count
    pub fn validate(&self) -> Result<()> {
        if self.model.is_empty() {
            return Err(CactusError::InvalidConfig("model path is empty".into()));
        }
        if self.n_ctx == 0 {
            return Err(CactusError::InvalidConfig("n_ctx must be greater than zero".into()));
        }
        if self.n_batch == 0 {
            return Err(CactusError::InvalidConfig("n_batch must be greater than zero".into()));
        }
        if self.n_threads == 0 {
            return Err(CactusError::InvalidConfig("n_threads must be greater than zero".into()));
        }
        Ok(())
    }

    /// What the backend loader receives.
    pub fn to_model_spec(&self) -> ModelSpec {
        ModelSpec {
            path: self.model.clone(),
            context_size: self.n_ctx,
            n_batch: self.n_batch,
            n_ubatch: self.n_ubatch,
            n_gpu_layers: self.n_gpu_layers,
            n_threads: self.n_threads,
            use_mmap: self.use_mmap,
            use_mlock: self.use_mlock,
            embedding: self.embedding,
            pooling: self.pooling,
            flash_attn: self.flash_attn,
            cache_type_k: self.cache_type_k,
            cache_type_v: self.cache_type_v,
        }
    }
}

/// Per-call options for [`crate::Session::completion`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompletionParams {
    #[serde(default)]
    pub prompt: String,

    /// Media file paths or base64 data URIs; requires multimodal.
    #[serde(default)]
    pub media: Vec<String>,

    /// Tokens to generate; `-1` runs until EOS or a stop string, `0` only
    /// evaluates the prompt.
    #[serde(default = "default_n_predict")]
    pub n_predict: i32,

    /// Worker threads for audio decoding; the session default when unset.
    #[serde(default)]
    pub n_threads: Option<usize>,

    #[serde(default)]
    pub n_keep: i32,

    #[serde(flatten)]
    pub sampling: SamplingParams,

    #[serde(default)]
    pub stop: Vec<String>,

    /// Append to the previous turn's tokens instead of starting over.
    #[serde(default)]
    pub continue_conversation: bool,

    /// Tokens forced into the output in place of sampled ones.
    #[serde(default)]
    pub guide_tokens: Option<GuideTokens>,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            media: Vec::new(),
            n_predict: default_n_predict(),
            n_threads: None,
            n_keep: 0,
            sampling: SamplingParams::default(),
            stop: Vec::new(),
            continue_conversation: false,
            guide_tokens: None,
        }
    }
}

impl CompletionParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_n_predict(mut self, n_predict: i32) -> Self {
        self.n_predict = n_predict;
        self
    }

    pub fn with_n_keep(mut self, n_keep: i32) -> Self {
        self.n_keep = n_keep;
        self
    }

    pub fn with_n_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = Some(n_threads);
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_stop<I, S>(mut self, stop: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop = stop.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_media<I, S>(mut self, media: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.media = media.into_iter().map(Into::into).collect();
        self
    }

    pub fn continuing(mut self) -> Self {
        self.continue_conversation = true;
        self
    }

    pub fn with_guide_tokens(mut self, guide: GuideTokens) -> Self {
        self.guide_tokens = Some(guide);
        self
    }
}

/// One LoRA adapter and its scale.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoraAdapter {
    pub path: String,
    #[serde(default = "default_scale")]
    pub scale: f32,
}

fn default_scale() -> f32 {
    1.0
}

impl LoraAdapter {
    pub fn new(path: impl Into<String>, scale: f32) -> Self {
        Self {
            path: path.into(),
            scale,
        }
    }
}
