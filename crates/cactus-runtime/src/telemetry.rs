//! Telemetry hooks for generation performance measurement.
//!
//! Provides:
//! - [`InferenceMetrics`]: TTFT, tokens/sec, and generation summary
//! - [`TelemetryHook`] trait: callback interface for real-time metric reporting
//! - [`InferenceTimer`]: records timestamps and computes metrics
//! - [`NoopTelemetry`] / [`LogTelemetry`]: built-in hook implementations

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use uuid::Uuid;

/// Aggregate metrics from one completion.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceMetrics {
    /// Session the completion ran in.
    pub session_id: Uuid,
    /// Time to first token in milliseconds (prompt evaluation + first sample).
    pub ttft_ms: f64,
    /// Tokens generated per second after the first one.
    pub tokens_per_sec: f64,
    /// Number of prompt tokens evaluated.
    pub prompt_tokens: usize,
    /// Number of tokens sampled.
    pub generated_tokens: usize,
    /// Total wall-clock time in milliseconds.
    pub total_time_ms: f64,
}

impl InferenceMetrics {
    /// Time spent after the first token.
    pub fn decode_time_ms(&self) -> f64 {
        (self.total_time_ms - self.ttft_ms).max(0.0)
    }
}

/// Callback trait for real-time generation telemetry.
///
/// All methods have default no-op implementations so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Called once the first token is available.
    fn on_prefill_complete(&self, _ttft_ms: f64) {}

    /// Called after each sampled token.
    fn on_token_generated(&self, _token_idx: usize, _elapsed_ms: f64) {}

    /// Called when a completion finishes with the full metrics summary.
    fn on_generation_complete(&self, _metrics: &InferenceMetrics) {}
}

/// No-op telemetry hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Keeps the most recent completion's metrics for later inspection.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    last_report: Arc<Mutex<Option<InferenceMetrics>>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieve the last completed generation's metrics.
    pub fn last_metrics(&self) -> Option<InferenceMetrics> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_generation_complete(&self, metrics: &InferenceMetrics) {
        *self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(metrics.clone());
    }
}

/// Records timestamps during a completion to compute [`InferenceMetrics`].
///
/// Usage:
/// 1. Call [`InferenceTimer::start`] when the completion begins
/// 2. Call [`InferenceTimer::set_prompt_tokens`] once the prompt is loaded
/// 3. Call [`InferenceTimer::mark_token`] after each sampled token
/// 4. Call [`InferenceTimer::finish`] to compute final metrics
///
/// The first `mark_token` also marks prompt evaluation as complete.
pub struct InferenceTimer {
    session_id: Uuid,
    prompt_tokens: usize,
    start: Instant,
    first_token: Option<Instant>,
    token_count: usize,
    hook: Arc<dyn TelemetryHook>,
}

impl InferenceTimer {
    pub fn start(session_id: Uuid, hook: Arc<dyn TelemetryHook>) -> Self {
        Self {
            session_id,
            prompt_tokens: 0,
            start: Instant::now(),
            first_token: None,
            token_count: 0,
            hook,
        }
    }

    pub fn set_prompt_tokens(&mut self, n: usize) {
        self.prompt_tokens = n;
    }

    /// Mark prompt evaluation complete. Fires `on_prefill_complete` once.
    pub fn mark_prefill_complete(&mut self) {
        if self.first_token.is_some() {
            return;
        }
        let now = Instant::now();
        self.first_token = Some(now);
        self.hook
            .on_prefill_complete(now.duration_since(self.start).as_secs_f64() * 1000.0);
    }

    /// Mark a sampled token. Fires `on_token_generated`.
    pub fn mark_token(&mut self) {
        self.mark_prefill_complete();
        self.token_count += 1;
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.hook.on_token_generated(self.token_count, elapsed_ms);
    }

    /// Milliseconds since [`InferenceTimer::start`].
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Finalize and return metrics. Fires `on_generation_complete`.
    pub fn finish(self) -> InferenceMetrics {
        let total_time_ms = self.elapsed_ms();

        let ttft_ms = self
            .first_token
            .map(|t| t.duration_since(self.start).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        let decode_time_ms = total_time_ms - ttft_ms;
        let decoded = self.token_count.saturating_sub(1);
        let tokens_per_sec = if decode_time_ms > 0.0 && decoded > 0 {
            decoded as f64 / (decode_time_ms / 1000.0)
        } else {
            0.0
        };

        let metrics = InferenceMetrics {
            session_id: self.session_id,
            ttft_ms,
            tokens_per_sec,
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.token_count,
            total_time_ms,
        };

        tracing::debug!(
            session = %metrics.session_id,
            ttft_ms = metrics.ttft_ms,
            tokens_per_sec = metrics.tokens_per_sec,
            generated = metrics.generated_tokens,
            "completion timings"
        );

        self.hook.on_generation_complete(&metrics);
        metrics
    }
}
