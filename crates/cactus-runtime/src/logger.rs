//! Leveled logging capability injected into a session at construction.
//!
//! Verbosity is a property of the logger a session was given, so two
//! sessions in one process can log at different levels.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Log target used by [`TracingLogger`].
pub const LOG_TARGET: &str = "cactus";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Verbose => "VERBOSE",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Sink for diagnostic messages. Never used to signal failure.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, args: fmt::Arguments<'_>);

    /// Cheap pre-check so callers can skip building expensive messages.
    fn enabled(&self, _level: LogLevel) -> bool {
        true
    }

    fn verbose(&self, args: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Verbose) {
            self.log(LogLevel::Verbose, args);
        }
    }

    fn info(&self, args: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Info) {
            self.log(LogLevel::Info, args);
        }
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Warning) {
            self.log(LogLevel::Warning, args);
        }
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Error) {
            self.log(LogLevel::Error, args);
        }
    }
}

/// Forwards to `tracing` under the `cactus` target.
#[derive(Debug, Clone, Copy)]
pub struct TracingLogger {
    min_level: LogLevel,
}

impl TracingLogger {
    pub fn new(min_level: LogLevel) -> Self {
        Self { min_level }
    }

    /// Include verbose step-by-step generation traces.
    pub fn verbose() -> Self {
        Self::new(LogLevel::Verbose)
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

impl Logger for TracingLogger {
    fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        match level {
            LogLevel::Verbose => tracing::debug!(target: LOG_TARGET, "{}", args),
            LogLevel::Info => tracing::info!(target: LOG_TARGET, "{}", args),
            LogLevel::Warning => tracing::warn!(target: LOG_TARGET, "{}", args),
            LogLevel::Error => tracing::error!(target: LOG_TARGET, "{}", args),
        }
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn enabled(&self, _level: LogLevel) -> bool {
        false
    }

    fn log(&self, _level: LogLevel, _args: fmt::Arguments<'_>) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

/// Keeps every record in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogger {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether any record at `level` contains `needle`.
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|r| r.level == level && r.message.contains(needle))
    }

    pub fn count(&self, level: LogLevel) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.level == level)
            .count()
    }
}

impl Logger for MemoryLogger {
    fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LogRecord {
                level,
                message: args.to_string(),
            });
    }
}
