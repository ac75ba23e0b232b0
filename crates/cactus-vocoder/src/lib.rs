//! # cactus-vocoder
//!
//! Speech output for OuteTTS-style models.
//!
//! The primary model is prompted with a speaker reference and the text to
//! speak ([`format_audio_prompt`]) and generates audio-code tokens, steered
//! by guide tokens ([`Vocoder::guide_tokens`]). The codes that fall in the
//! model family's audio range are then run through a WavTokenizer decoder
//! and turned into PCM by inverse STFT ([`embd_to_audio`]).
//!
//! Model families are described by data in [`TtsType::config`]; adding one
//! means adding a table row.

mod istft;
mod prompt;
mod text;

use std::ops::RangeInclusive;
use std::sync::Arc;

use cactus_engine::{BackendLoader, EngineError, InferenceBackend, ModelSpec, TokenId};
use cactus_runtime::Logger;
use serde::{Deserialize, Serialize};

pub use istft::{embd_to_audio, hann_window, N_FFT, N_HOP, N_WIN};
pub use prompt::{format_audio_prompt, Speaker, SpeakerWord, DEFAULT_AUDIO_DATA, DEFAULT_AUDIO_TEXT};
pub use text::{number_to_words, process_text};

/// Decoder architecture the vocoder model must report, when it reports one.
pub const VOCODER_ARCHITECTURE: &str = "wavtokenizer-dec";

/// Primary-model chat template that identifies OuteTTS 0.3.
const OUTETTS_V03_TEMPLATE: &str = "outetts-0.3";

#[derive(Debug, thiserror::Error)]
pub enum VocoderError {
    #[error("Unsupported vocoder architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("Invalid speaker profile: {0}")]
    Speaker(#[source] serde_json::Error),

    #[error("Vocoder context produced no embeddings")]
    NoEmbeddings,

    #[error("Vocoder returned {got} embedding values, expected at least {expected}")]
    EmbeddingShape { expected: usize, got: usize },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type VocoderResult<T> = Result<T, VocoderError>;

/// Supported text-to-speech model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TtsType {
    OuteTtsV0_2,
    OuteTtsV0_3,
}

/// Per-family constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtsConfig {
    pub name: &'static str,
    /// Token ids the vocoder understands, in primary-vocabulary numbering.
    pub audio_tokens: RangeInclusive<TokenId>,
    /// Text of the token that closes the audio section.
    pub end_marker: &'static str,
    pub sample_rate: u32,
    /// Token text placed between words of the spoken text.
    pub separator: &'static str,
}

static TTS_TABLE: [TtsConfig; 2] = [
    TtsConfig {
        name: "outetts-0.2",
        audio_tokens: 151672..=155772,
        end_marker: "<|audio_end|>",
        sample_rate: 24_000,
        separator: "<|text_sep|>",
    },
    TtsConfig {
        name: "outetts-0.3",
        audio_tokens: 151672..=155772,
        end_marker: "<|audio_end|>",
        sample_rate: 24_000,
        separator: "<|space|>",
    },
];

impl TtsType {
    pub fn config(self) -> &'static TtsConfig {
        match self {
            TtsType::OuteTtsV0_2 => &TTS_TABLE[0],
            TtsType::OuteTtsV0_3 => &TTS_TABLE[1],
        }
    }

    /// Identify the family from the vocoder's architecture metadata and the
    /// primary model's chat template.
    ///
    /// # Errors
    /// - `UnsupportedArchitecture`: the vocoder is not a WavTokenizer decoder
    pub fn detect(
        vocoder_architecture: Option<&str>,
        primary_template: Option<&str>,
    ) -> VocoderResult<Self> {
        if let Some(arch) = vocoder_architecture {
            if arch != VOCODER_ARCHITECTURE {
                return Err(VocoderError::UnsupportedArchitecture(arch.to_string()));
            }
        }
        Ok(match primary_template {
            Some(OUTETTS_V03_TEMPLATE) => TtsType::OuteTtsV0_3,
            _ => TtsType::OuteTtsV0_2,
        })
    }

    pub fn is_audio_token(self, token: TokenId) -> bool {
        self.config().audio_tokens.contains(&token)
    }

    /// Vocoder code for an audio token.
    pub fn audio_code(self, token: TokenId) -> Option<TokenId> {
        let range = &self.config().audio_tokens;
        range.contains(&token).then(|| token - range.start())
    }
}

/// Guide tokens for one utterance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuideTokens {
    /// First token of each word, preceded by the newline token.
    pub tokens: Vec<TokenId>,
    /// Token after which the next guide token is applied.
    #[serde(default)]
    pub resume_marker: Option<TokenId>,
}

/// A loaded vocoder model.
pub struct Vocoder {
    backend: Box<dyn InferenceBackend>,
    tts: TtsType,
    logger: Arc<dyn Logger>,
}

impl Vocoder {
    /// Load a vocoder for `primary`.
    ///
    /// The vocoder runs with the primary model's settings, in embedding mode
    /// and with the micro-batch as large as the batch.
    pub fn init(
        loader: &dyn BackendLoader,
        path: &str,
        primary_spec: &ModelSpec,
        primary: &dyn InferenceBackend,
        logger: Arc<dyn Logger>,
    ) -> VocoderResult<Self> {
        let spec = ModelSpec {
            path: path.to_string(),
            embedding: true,
            n_ubatch: primary_spec.n_batch,
            ..primary_spec.clone()
        };
        let backend = loader.load(&spec, &mut |_| true).inspect_err(|e| {
            logger.error(format_args!("Failed to load vocoder model: {path}: {e}"));
        })?;
        let vocoder = Self::with_backend(backend, primary, logger)?;
        vocoder.logger.info(format_args!(
            "Vocoder initialized successfully with model: {path} ({})",
            vocoder.tts.config().name
        ));
        Ok(vocoder)
    }

    /// Wrap an already loaded vocoder backend.
    pub fn with_backend(
        backend: Box<dyn InferenceBackend>,
        primary: &dyn InferenceBackend,
        logger: Arc<dyn Logger>,
    ) -> VocoderResult<Self> {
        let arch = backend.meta("general.architecture");
        let template = primary.chat_template();
        let tts = TtsType::detect(arch.as_deref(), template.as_deref())?;
        Ok(Self {
            backend,
            tts,
            logger,
        })
    }

    pub fn tts_type(&self) -> TtsType {
        self.tts
    }

    pub fn sample_rate(&self) -> u32 {
        self.tts.config().sample_rate
    }

    /// Prompt for speaking `text`. An empty `speaker_json` uses the built-in
    /// speaker.
    pub fn formatted_prompt(&self, speaker_json: &str, text: &str) -> VocoderResult<String> {
        let speaker = Speaker::from_json(speaker_json)?;
        Ok(format_audio_prompt(speaker.as_ref(), text, self.tts))
    }

    /// Guide tokens for `text`, tokenized with the primary model's vocabulary.
    pub fn guide_tokens(
        &self,
        primary: &dyn InferenceBackend,
        text: &str,
    ) -> VocoderResult<GuideTokens> {
        let clean = process_text(text, self.tts);
        let resume_marker = primary.tokenize("\n", false, true)?.first().copied();

        let mut tokens: Vec<TokenId> = resume_marker.into_iter().collect();
        for word in clean.split(self.tts.config().separator) {
            if let Some(&first) = primary.tokenize(word, false, true)?.first() {
                tokens.push(first);
            }
        }
        Ok(GuideTokens {
            tokens,
            resume_marker,
        })
    }

    /// Token id of the end-of-audio marker in the primary vocabulary, if it
    /// is a single token there.
    pub fn end_of_audio_token(
        &self,
        primary: &dyn InferenceBackend,
    ) -> VocoderResult<Option<TokenId>> {
        let tokens = primary.tokenize(self.tts.config().end_marker, false, true)?;
        Ok(match tokens.as_slice() {
            [single] => Some(*single),
            _ => None,
        })
    }

    /// Decode generated tokens to PCM samples. Tokens outside the audio
    /// range are ignored; no audio tokens at all yields no samples.
    pub fn decode_audio_tokens(
        &mut self,
        tokens: &[TokenId],
        n_threads: usize,
    ) -> VocoderResult<Vec<f32>> {
        let codes: Vec<TokenId> = tokens
            .iter()
            .filter_map(|&t| self.tts.audio_code(t))
            .collect();
        if codes.is_empty() {
            self.logger.warn(format_args!("No valid audio tokens found"));
            return Ok(Vec::new());
        }

        self.backend.encode(&codes)?;

        let n_codes = codes.len();
        let n_embd = self.backend.n_embd();
        let embd = self.backend.embeddings().ok_or(VocoderError::NoEmbeddings)?;
        let expected = n_codes * n_embd;
        if embd.len() < expected {
            return Err(VocoderError::EmbeddingShape {
                expected,
                got: embd.len(),
            });
        }

        self.logger.verbose(format_args!(
            "Decoding {n_codes} audio codes with {n_threads} threads"
        ));
        Ok(embd_to_audio(&embd[..expected], n_codes, n_embd, n_threads))
    }
}

impl std::fmt::Debug for Vocoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocoder").field("tts", &self.tts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_defaults_to_v02() {
        assert_eq!(TtsType::detect(None, None).unwrap(), TtsType::OuteTtsV0_2);
        assert_eq!(
            TtsType::detect(Some("wavtokenizer-dec"), Some("chatml")).unwrap(),
            TtsType::OuteTtsV0_2
        );
    }

    #[test]
    fn detect_v03_from_template() {
        assert_eq!(
            TtsType::detect(None, Some("outetts-0.3")).unwrap(),
            TtsType::OuteTtsV0_3
        );
    }

    #[test]
    fn detect_rejects_other_architectures() {
        assert!(matches!(
            TtsType::detect(Some("llama"), None),
            Err(VocoderError::UnsupportedArchitecture(a)) if a == "llama"
        ));
    }

    #[test]
    fn audio_range_bounds() {
        let t = TtsType::OuteTtsV0_2;
        assert!(!t.is_audio_token(151671));
        assert_eq!(t.audio_code(151672), Some(0));
        assert_eq!(t.audio_code(155772), Some(4100));
        assert_eq!(t.audio_code(155773), None);
    }

    #[test]
    fn table_rows_differ_only_in_separator() {
        let (a, b) = (TtsType::OuteTtsV0_2.config(), TtsType::OuteTtsV0_3.config());
        assert_eq!(a.audio_tokens, b.audio_tokens);
        assert_eq!(a.sample_rate, 24_000);
        assert_ne!(a.separator, b.separator);
    }
}
