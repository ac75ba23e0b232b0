//! # cactus-runtime
//!
//! Services a session is constructed with rather than reaching for globals:
//!
//! - [`logger`]: leveled [`Logger`] capability (tracing-backed, silent, or capturing)
//! - [`telemetry`]: time-to-first-token and decode throughput per completion

pub mod logger;
pub mod telemetry;

pub use logger::{LogLevel, LogRecord, Logger, MemoryLogger, NoopLogger, TracingLogger};
pub use telemetry::{InferenceMetrics, InferenceTimer, LogTelemetry, NoopTelemetry, TelemetryHook};
