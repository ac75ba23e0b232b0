//! # cactus-multimodal
//!
//! Prompts that interleave text with images or audio.
//!
//! A [`MultimodalContext`] owns the projector for one session and remembers
//! the content hashes of the media it evaluated last. On the next prompt,
//! the shared token prefix is kept in the backend cache as long as every
//! media chunk inside it still carries the same hash; evaluation restarts at
//! the first chunk that differs.
//!
//! Media occupy [`NULL_TOKEN`] positions in the token buffer, one per
//! sequence position the projector reports for the chunk.

mod media;

use std::sync::Arc;

use cactus_engine::{
    Bitmap, EngineError, InferenceBackend, InputChunk, MediaKind, Projector, ProjectorLoader,
    TokenId, NULL_TOKEN,
};
use cactus_kv::TokenWindow;
use cactus_runtime::Logger;

pub use media::{content_hash, MediaSource};

#[derive(Debug, thiserror::Error)]
pub enum MultimodalError {
    #[error("Multimodal is not enabled but media paths are provided")]
    Disabled,

    #[error("Projector embedding width {projector} does not match model width {model}")]
    Incompatible { projector: usize, model: usize },

    #[error("HTTP/HTTPS URLs are not supported yet: {0}")]
    RemoteSource(String),

    #[error("Invalid base64 media: {0}")]
    InvalidDataUri(String),

    #[error("File does not exist or cannot be opened: {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Projector does not support {0:?} input")]
    UnsupportedKind(MediaKind),

    #[error("Not enough context space: prompt needs {needed} positions, context holds {capacity}")]
    ContextFull { needed: usize, capacity: usize },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type MultimodalResult<T> = Result<T, MultimodalError>;

/// A prompt after media loading and tokenization.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPrompt {
    /// Text tokens with [`NULL_TOKEN`] runs standing in for media.
    pub tokens: Vec<TokenId>,
    /// Content hash of each media item, in prompt order.
    pub bitmap_hashes: Vec<String>,
    /// Start position of every chunk.
    pub chunk_pos: Vec<usize>,
    /// Start position of every media chunk.
    pub chunk_pos_media: Vec<usize>,
    pub chunks: Vec<InputChunk>,
}

impl MediaPrompt {
    pub fn has_media(&self) -> bool {
        !self.chunk_pos_media.is_empty()
    }

    /// Index of the chunk that starts strictly before `pos` and ends after it.
    fn chunk_containing(&self, pos: usize) -> Option<usize> {
        self.chunk_pos.iter().enumerate().find_map(|(i, &start)| {
            let end = start + self.chunks[i].n_pos();
            (start < pos && pos < end).then_some(i)
        })
    }
}

/// Result of [`MultimodalContext::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaEvaluation {
    /// Positions taken over from the previous prompt without recomputation.
    pub reused: usize,
    /// Cursor after evaluation; tokens past it are still pending.
    pub n_past: usize,
    /// Length of the whole prompt in positions.
    pub n_tokens: usize,
}

/// Projector plus the media history of one session.
pub struct MultimodalContext {
    projector: Box<dyn Projector>,
    past_hashes: Vec<String>,
    logger: Arc<dyn Logger>,
}

impl MultimodalContext {
    /// Load a projector for `backend`'s model.
    ///
    /// # Errors
    /// - `Engine`: the loader failed
    /// - `Incompatible`: embedding widths differ
    pub fn init(
        loader: &dyn ProjectorLoader,
        path: &str,
        use_gpu: bool,
        n_threads: usize,
        backend: &dyn InferenceBackend,
        logger: Arc<dyn Logger>,
    ) -> MultimodalResult<Self> {
        logger.verbose(format_args!(
            "Initializing multimodal with mmproj path: {path}, threads={n_threads}"
        ));
        let projector = loader.load(path, use_gpu, n_threads)?;
        let ctx = Self::with_projector(projector, backend, logger)?;
        ctx.logger.info(format_args!(
            "Multimodal context initialized successfully with mmproj: {path}"
        ));
        Ok(ctx)
    }

    /// Wrap an already loaded projector.
    pub fn with_projector(
        projector: Box<dyn Projector>,
        backend: &dyn InferenceBackend,
        logger: Arc<dyn Logger>,
    ) -> MultimodalResult<Self> {
        if projector.n_embd() != backend.n_embd() {
            return Err(MultimodalError::Incompatible {
                projector: projector.n_embd(),
                model: backend.n_embd(),
            });
        }
        Ok(Self {
            projector,
            past_hashes: Vec::new(),
            logger,
        })
    }

    pub fn supports_vision(&self) -> bool {
        self.projector.supports_vision()
    }

    pub fn supports_audio(&self) -> bool {
        self.projector.supports_audio()
    }

    pub fn marker(&self) -> &str {
        self.projector.default_marker()
    }

    /// Hashes of the media evaluated by the last [`MultimodalContext::evaluate`].
    pub fn past_hashes(&self) -> &[String] {
        &self.past_hashes
    }

    /// Forget media history, e.g. after the token buffer was rewound.
    pub fn clear_history(&mut self) {
        self.past_hashes.clear();
    }

    fn load_bitmap(&self, source: &str) -> MultimodalResult<Bitmap> {
        let parsed = MediaSource::parse(source)?;
        self.logger
            .verbose(format_args!("Loading media: {}", parsed.describe()));
        if let MediaSource::Remote(url) = &parsed {
            self.logger
                .error(format_args!("HTTP/HTTPS URLs are not supported yet: {url}"));
        }

        let bytes = parsed.read()?;
        let mut bitmap = self.projector.decode_media(&bytes)?;
        if let Some(kind) = parsed.declared_kind() {
            bitmap.kind = kind;
        }

        let supported = match bitmap.kind {
            MediaKind::Image => self.supports_vision(),
            MediaKind::Audio => self.supports_audio(),
        };
        if !supported {
            return Err(MultimodalError::UnsupportedKind(bitmap.kind));
        }

        bitmap.id = content_hash(&bitmap.data);
        self.logger.verbose(format_args!("Media hash: {}", bitmap.id));
        Ok(bitmap)
    }

    /// Load every source and split `text` into text and media chunks.
    ///
    /// A marker is appended when `text` contains none.
    pub fn tokenize(
        &self,
        backend: &dyn InferenceBackend,
        text: &str,
        sources: &[String],
    ) -> MultimodalResult<MediaPrompt> {
        let marker = self.marker();
        let full_prompt = if text.contains(marker) {
            text.to_string()
        } else {
            format!("{text} {marker}")
        };

        let bitmaps = sources
            .iter()
            .map(|s| self.load_bitmap(s))
            .collect::<MultimodalResult<Vec<_>>>()?;
        let bitmap_hashes = bitmaps.iter().map(|b| b.id.clone()).collect();

        let chunks = self.projector.tokenize(backend, &full_prompt, &bitmaps)?;

        let mut tokens = Vec::new();
        let mut chunk_pos = Vec::with_capacity(chunks.len());
        let mut chunk_pos_media = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            chunk_pos.push(tokens.len());
            match chunk {
                InputChunk::Text(text_tokens) => {
                    self.logger.verbose(format_args!(
                        "Chunk {i}: type=TEXT, n_tokens={}",
                        text_tokens.len()
                    ));
                    tokens.extend_from_slice(text_tokens);
                }
                InputChunk::Media(media) => {
                    self.logger.verbose(format_args!(
                        "Chunk {i}: type={:?}, n_tokens={}, n_pos={}",
                        media.bitmap.kind, media.n_tokens, media.n_pos
                    ));
                    chunk_pos_media.push(tokens.len());
                    tokens.extend(std::iter::repeat(NULL_TOKEN).take(media.n_pos));
                }
            }
        }

        Ok(MediaPrompt {
            tokens,
            bitmap_hashes,
            chunk_pos,
            chunk_pos_media,
            chunks,
        })
    }

    /// Position at which evaluation of `prompt` must restart given what
    /// `window` already holds.
    fn reuse_point(&self, window: &TokenWindow, prompt: &MediaPrompt) -> usize {
        // Tokens past the cursor were never evaluated.
        let mut n_past = window.common_prefix(&prompt.tokens).min(window.n_past());

        // Chunks are evaluated whole, except that a trailing text chunk may be
        // left partly pending for the generation loop.
        if let Some(i) = prompt.chunk_containing(n_past) {
            let is_last = i + 1 == prompt.chunks.len();
            if !is_last || matches!(prompt.chunks[i], InputChunk::Media(_)) {
                n_past = prompt.chunk_pos[i];
                self.logger.verbose(format_args!("Adjusted n_past to {n_past}"));
            }
        }

        // A fully matched trailing media chunk has no logits behind it.
        if n_past == prompt.tokens.len() {
            if let (Some(InputChunk::Media(_)), Some(&start)) =
                (prompt.chunks.last(), prompt.chunk_pos.last())
            {
                n_past = start;
            }
        }

        if !self.past_hashes.is_empty() {
            for (i, hash) in prompt.bitmap_hashes.iter().enumerate() {
                let pos = prompt.chunk_pos_media[i];
                if n_past < pos || i >= self.past_hashes.len() {
                    break;
                }
                if *hash != self.past_hashes[i] {
                    self.logger.verbose(format_args!(
                        "Bitmap hash mismatch at position {i}, {hash} != {}",
                        self.past_hashes[i]
                    ));
                    n_past = pos;
                    break;
                }
            }
        }
        n_past
    }

    /// Evaluate a tokenized prompt, reusing whatever the cache already holds.
    ///
    /// On success `window` holds the prompt tokens with the cursor at the
    /// returned `n_past`. When the prompt ends in text, at least one token is
    /// left pending so the generation loop produces fresh logits.
    ///
    /// # Errors
    /// - `ContextFull`: the prompt does not fit
    /// - `Engine`: projector encoding or backend decoding failed
    pub fn evaluate(
        &mut self,
        backend: &mut dyn InferenceBackend,
        window: &mut TokenWindow,
        prompt: MediaPrompt,
        n_batch: usize,
    ) -> MultimodalResult<MediaEvaluation> {
        let capacity = backend.n_ctx();
        if prompt.tokens.len() >= capacity {
            return Err(MultimodalError::ContextFull {
                needed: prompt.tokens.len(),
                capacity,
            });
        }

        let reused = self.reuse_point(window, &prompt);
        backend.kv_remove(reused, None);
        self.logger.verbose(format_args!(
            "Evaluating chunks: n_past={reused}, n_batch={n_batch}"
        ));

        let n_batch = n_batch.max(1);
        let n_embd = backend.n_embd();
        let mut n_past = reused;

        for (i, chunk) in prompt.chunks.iter().enumerate() {
            if prompt.chunk_pos[i] < n_past {
                continue;
            }
            match chunk {
                InputChunk::Text(tokens) => {
                    for batch in tokens.chunks(n_batch) {
                        backend.decode(batch, n_past)?;
                        n_past += batch.len();
                    }
                }
                InputChunk::Media(media) => {
                    let embd = self.projector.encode(media)?;
                    let rows = embd.len() / n_embd.max(1);
                    let mut offset = 0;
                    while offset < rows {
                        let n = n_batch.min(rows - offset);
                        let slice = &embd[offset * n_embd..(offset + n) * n_embd];
                        backend.decode_embeddings(slice, n, n_past + offset)?;
                        offset += n;
                    }
                    n_past += media.n_pos;
                }
            }
        }

        let n_tokens = prompt.tokens.len();
        if n_past == n_tokens && n_past > 0 && prompt.tokens[n_past - 1] != NULL_TOKEN {
            n_past -= 1;
        }

        window.replace(prompt.tokens, n_past);
        self.past_hashes = prompt.bitmap_hashes;
        self.logger
            .verbose(format_args!("Multimodal processing completed"));

        Ok(MediaEvaluation {
            reused,
            n_past,
            n_tokens,
        })
    }

    /// [`MultimodalContext::tokenize`] then [`MultimodalContext::evaluate`].
    pub fn process(
        &mut self,
        backend: &mut dyn InferenceBackend,
        window: &mut TokenWindow,
        text: &str,
        sources: &[String],
        n_batch: usize,
    ) -> MultimodalResult<MediaEvaluation> {
        self.logger.verbose(format_args!(
            "Processing {} media, current context state: n_past={}, n_ctx={}",
            sources.len(),
            window.n_past(),
            backend.n_ctx()
        ));
        let prompt = self.tokenize(&*backend, text, sources)?;
        self.evaluate(backend, window, prompt, n_batch)
    }
}

impl std::fmt::Debug for MultimodalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultimodalContext")
            .field("vision", &self.supports_vision())
            .field("audio", &self.supports_audio())
            .field("past_hashes", &self.past_hashes)
            .finish()
    }
}
