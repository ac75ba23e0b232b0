//! On-device generation context engine.
//!
//! A [`Session`] wraps one loaded model and drives the token window, the
//! sample-decode-accept loop, stop-string detection and the optional
//! multimodal, text-to-speech and LoRA subsystems. The model runtime itself
//! is supplied through the [`cactus_engine::InferenceBackend`] trait.

pub mod adapters;
pub mod chat;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod session;

pub use adapters::AdapterManager;
pub use chat::{parse_messages_json, ChatTemplate, ChatTemplateFormatter};
pub use config::{CompletionParams, ContextParams, LoraAdapter};
pub use engine::actor::{ActorCommand, ActorEvent, SessionActor};
pub use engine::{
    AudioCapture, BenchResult, CompletionResult, GenerationContext, GenerationState,
    InterruptHandle, Timings, TokenOutput,
};
pub use error::{CactusError, ErrorKind, Result};
pub use session::{Capabilities, Session, Synthesis, TokenizeResult};

pub use cactus_engine::{ChatMessage, FormatOptions, TokenId};
pub use cactus_runtime::{LogLevel, Logger, MemoryLogger, NoopLogger, TracingLogger};
pub use cactus_sampling::SamplingParams;
pub use cactus_vocoder::GuideTokens;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
