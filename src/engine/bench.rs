//! Throughput measurement straight against the backend.
//!
//! Each repetition clears the cache, evaluates a `pp`-token prompt in one
//! batch, then runs `tg` generation steps of `pl` tokens each. Speeds are
//! reported as mean and sample standard deviation over the repetitions.

use std::time::Instant;

use cactus_engine::{InferenceBackend, TokenId};
use serde::Serialize;

use super::GenerationContext;
use crate::error::{CactusError, Result};

/// Token placed at every benchmark position.
const BENCH_TOKEN: TokenId = 0;

/// Outcome of [`GenerationContext::bench`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchResult {
    pub model_desc: String,
    pub model_size: u64,
    pub model_n_params: u64,
    /// Prompt processing, tokens/s.
    pub pp_avg: f64,
    pub pp_std: f64,
    /// Text generation, tokens/s.
    pub tg_avg: f64,
    pub tg_std: f64,
    /// Repetitions that ran to the end.
    pub repetitions: usize,
    /// An interrupt cut the run short; all speeds are zero.
    pub interrupted: bool,
}

impl BenchResult {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Mean and sample standard deviation.
fn mean_std(samples: &[f64]) -> (f64, f64) {
    let n = samples.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = samples.iter().sum::<f64>() / n as f64;
    if n == 1 {
        return (mean, 0.0);
    }
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    (mean, variance.sqrt())
}

fn rate(tokens: usize, start: Instant) -> f64 {
    let secs = start.elapsed().as_secs_f64();
    if secs > 0.0 {
        tokens as f64 / secs
    } else {
        0.0
    }
}

#[derive(Default)]
struct Samples {
    pp: Vec<f64>,
    tg: Vec<f64>,
}

impl GenerationContext {
    /// Benchmark `backend`: `nr` repetitions of a `pp`-token prompt followed
    /// by `tg` steps of `pl` tokens.
    ///
    /// The conversation is dropped first and the cache is left empty.
    ///
    /// # Errors
    /// - `Busy`: a completion is in progress
    /// - `InvalidRequest`: a size is zero, exceeds `n_batch` or does not fit
    ///   the context
    /// - `Engine`: a decode failed
    pub fn bench(
        &mut self,
        backend: &mut dyn InferenceBackend,
        pp: usize,
        tg: usize,
        pl: usize,
        nr: usize,
    ) -> Result<BenchResult> {
        if self.state.is_predicting {
            self.logger
                .error(format_args!("Cannot benchmark while predicting"));
            return Err(CactusError::Busy);
        }
        if pp == 0 || pl == 0 || nr == 0 {
            return Err(CactusError::InvalidRequest(format!(
                "benchmark sizes must be positive: pp={pp}, pl={pl}, nr={nr}"
            )));
        }
        if pp.max(pl) > self.n_batch {
            return Err(CactusError::InvalidRequest(format!(
                "benchmark batch exceeds n_batch={}: pp={pp}, pl={pl}",
                self.n_batch
            )));
        }
        let needed = pp + tg * pl;
        if needed > backend.n_ctx() {
            return Err(CactusError::InvalidRequest(format!(
                "benchmark needs {needed} positions, context holds {}",
                backend.n_ctx()
            )));
        }

        self.rewind(backend);
        self.state.is_predicting = true;
        self.logger.info(format_args!(
            "Starting benchmark: pp={pp}, tg={tg}, pl={pl}, nr={nr}"
        ));

        let mut samples = Samples::default();
        let outcome = self.run_bench(backend, pp, tg, pl, nr, &mut samples);
        backend.kv_clear();
        self.state.is_predicting = false;
        outcome?;

        let interrupted = self.interrupt.is_interrupted();
        let ((pp_avg, pp_std), (tg_avg, tg_std)) = if interrupted {
            ((0.0, 0.0), (0.0, 0.0))
        } else {
            (mean_std(&samples.pp), mean_std(&samples.tg))
        };
        let result = BenchResult {
            model_desc: backend.description(),
            model_size: backend.model_size(),
            model_n_params: backend.n_params(),
            pp_avg,
            pp_std,
            tg_avg,
            tg_std,
            repetitions: if interrupted { 0 } else { samples.pp.len() },
            interrupted,
        };
        self.logger.info(format_args!(
            "Benchmark finished: pp {pp_avg:.2} ± {pp_std:.2} t/s, tg {tg_avg:.2} ± {tg_std:.2} t/s"
        ));
        Ok(result)
    }

    fn run_bench(
        &mut self,
        backend: &mut dyn InferenceBackend,
        pp: usize,
        tg: usize,
        pl: usize,
        nr: usize,
        samples: &mut Samples,
    ) -> Result<()> {
        let prompt = vec![BENCH_TOKEN; pp];
        let step = vec![BENCH_TOKEN; pl];

        for _ in 0..nr {
            if self.interrupt.is_interrupted() {
                break;
            }
            backend.kv_clear();

            let t_pp = Instant::now();
            backend.decode(&prompt, 0)?;
            let pp_rate = rate(pp, t_pp);

            let t_tg = Instant::now();
            for k in 0..tg {
                if self.interrupt.is_interrupted() {
                    self.logger.info(format_args!("Benchmark interrupted"));
                    return Ok(());
                }
                backend.decode(&step, pp + k * pl)?;
            }
            samples.pp.push(pp_rate);
            samples.tg.push(rate(tg * pl, t_tg));
        }
        if self.interrupt.is_interrupted() {
            self.logger.info(format_args!("Benchmark interrupted"));
        }
        Ok(())
    }
}
