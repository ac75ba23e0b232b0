//! Error types for the cactus crate.

use cactus_engine::EngineError;
use cactus_kv::WindowError;
use cactus_multimodal::MultimodalError;
use cactus_sampling::SamplingError;
use cactus_vocoder::VocoderError;
use thiserror::Error;

/// How a failure should be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad settings or an incompatible model. Nothing was kept.
    Configuration,
    /// The backend failed mid-call. The session is still usable.
    Resource,
    /// The call was not valid in the session's current state. Nothing changed.
    CallerContract,
}

/// Top-level error type for session operations.
#[derive(Error, Debug)]
pub enum CactusError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Context window error: {0}")]
    Window(#[from] WindowError),

    #[error("Sampling error: {0}")]
    Sampling(#[from] SamplingError),

    #[error(transparent)]
    Multimodal(#[from] MultimodalError),

    #[error(transparent)]
    Vocoder(#[from] VocoderError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("A completion is already in progress")]
    Busy,

    #[error("No model loaded")]
    NoModel,

    #[error("Vocoder is not enabled")]
    VocoderDisabled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session actor is not running")]
    ActorClosed,

    #[error("Failed to start session thread: {0}")]
    Thread(#[source] std::io::Error),
}

impl CactusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CactusError::Engine(e) => engine_kind(e),
            CactusError::Window(_) | CactusError::InvalidConfig(_) => ErrorKind::Configuration,
            CactusError::Sampling(_) => ErrorKind::Configuration,
            CactusError::Multimodal(e) => match e {
                MultimodalError::Incompatible { .. } => ErrorKind::Configuration,
                MultimodalError::Engine(e) => engine_kind(e),
                MultimodalError::Disabled
                | MultimodalError::RemoteSource(_)
                | MultimodalError::InvalidDataUri(_)
                | MultimodalError::Io { .. }
                | MultimodalError::UnsupportedKind(_)
                | MultimodalError::ContextFull { .. } => ErrorKind::CallerContract,
            },
            CactusError::Vocoder(e) => match e {
                VocoderError::UnsupportedArchitecture(_) => ErrorKind::Configuration,
                VocoderError::Speaker(_) => ErrorKind::CallerContract,
                VocoderError::NoEmbeddings | VocoderError::EmbeddingShape { .. } => {
                    ErrorKind::Resource
                }
                VocoderError::Engine(e) => engine_kind(e),
            },
            CactusError::Thread(_) => ErrorKind::Resource,
            CactusError::Json(_)
            | CactusError::Busy
            | CactusError::NoModel
            | CactusError::VocoderDisabled
            | CactusError::InvalidRequest(_)
            | CactusError::ActorClosed => ErrorKind::CallerContract,
        }
    }
}

fn engine_kind(err: &EngineError) -> ErrorKind {
    match err {
        EngineError::ModelLoad(_)
        | EngineError::LoadAborted
        | EngineError::Adapter { .. }
        | EngineError::Projector(_)
        | EngineError::Sampling(_)
        | EngineError::Unsupported(_) => ErrorKind::Configuration,
        EngineError::Decode { .. } | EngineError::Encode(_) => ErrorKind::Resource,
        EngineError::Tokenization(_) | EngineError::Format(_) => ErrorKind::CallerContract,
    }
}

pub type Result<T> = std::result::Result<T, CactusError>;
