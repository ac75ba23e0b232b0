//! # cactus-sampling
//!
//! Sampling parameters and a reference [`TokenSampler`] for cactus.
//!
//! Supports:
//! - Greedy (argmax) when temperature is not positive
//! - Repeat / frequency / presence penalties over a sliding history
//! - Top-k, typical, top-p (nucleus) and min-p filtering
//! - Temperature scaling
//! - Mirostat 1.0 and 2.0
//! - Deterministic seeded RNG for reproducible generation
//!
//! Grammar-constrained sampling is not implemented by the reference sampler;
//! [`DefaultSamplerFactory`] refuses parameters that carry a grammar.

pub mod params;

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use cactus_engine::{EngineError, SampledToken, TokenId, TokenProb, TokenSampler};

pub use params::{SamplingParams, RANDOM_SEED};

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("Invalid logits array")]
    InvalidLogits,

    #[error("No valid tokens after filtering")]
    NoValidTokens,

    #[error("Unknown mirostat version {0} (expected 0, 1 or 2)")]
    InvalidMirostat(u8),

    #[error("Grammar-constrained sampling is not supported by this sampler")]
    GrammarUnsupported,
}

impl From<SamplingError> for EngineError {
    fn from(err: SamplingError) -> Self {
        EngineError::Sampling(err.to_string())
    }
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Deterministic RNG for reproducible sampling.
///
/// Uses a simple xorshift64 algorithm for fast, reproducible random numbers.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // Zero state would produce all zeros
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Seed from the clock when `seed` is [`RANDOM_SEED`].
    pub fn from_param(seed: u32) -> Self {
        if seed == RANDOM_SEED {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x9E37_79B9_7F4A_7C15);
            Self::new(nanos)
        } else {
            Self::new(seed as u64)
        }
    }

    /// Generate next random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Model facts a sampler needs besides logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerContext {
    pub n_vocab: usize,
    pub n_ctx: usize,
    pub eos: TokenId,
}

/// Builds a fresh sampler for each completion call.
pub trait SamplerFactory: Send + Sync {
    fn build(
        &self,
        params: &SamplingParams,
        ctx: SamplerContext,
    ) -> Result<Box<dyn TokenSampler>, EngineError>;
}

/// Builds the reference [`Sampler`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSamplerFactory;

impl SamplerFactory for DefaultSamplerFactory {
    fn build(
        &self,
        params: &SamplingParams,
        ctx: SamplerContext,
    ) -> Result<Box<dyn TokenSampler>, EngineError> {
        Ok(Box::new(Sampler::new(params.clone(), ctx)?))
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: TokenId,
    logit: f32,
    p: f32,
}

/// Reference sampler driven by [`SamplingParams`].
#[derive(Debug, Clone)]
pub struct Sampler {
    params: SamplingParams,
    ctx: SamplerContext,
    history: VecDeque<TokenId>,
    /// Mirostat target surprise accumulator.
    mu: f32,
    rng: SeededRng,
}

impl Sampler {
    /// # Errors
    /// - `InvalidMirostat`: mirostat version outside 0..=2
    /// - `GrammarUnsupported`: a grammar was supplied
    pub fn new(params: SamplingParams, ctx: SamplerContext) -> SamplingResult<Self> {
        if params.mirostat > 2 {
            return Err(SamplingError::InvalidMirostat(params.mirostat));
        }
        if !params.grammar.trim().is_empty() {
            return Err(SamplingError::GrammarUnsupported);
        }
        let rng = SeededRng::from_param(params.seed);
        let mu = 2.0 * params.mirostat_tau;
        Ok(Self {
            params,
            ctx,
            history: VecDeque::new(),
            mu,
            rng,
        })
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Penalty history, oldest first.
    pub fn history(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.history.iter().copied()
    }

    fn history_limit(&self) -> usize {
        match self.params.penalty_last_n {
            n if n < 0 => self.ctx.n_ctx,
            n => n as usize,
        }
    }

    /// Run the full sampling chain over `logits`.
    pub fn sample_token(&mut self, logits: &[f32]) -> SamplingResult<SampledToken> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }

        let mut cands: Vec<Candidate> = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| Candidate {
                id: i as TokenId,
                logit,
                p: 0.0,
            })
            .collect();

        if self.params.ignore_eos {
            if let Some(c) = cands.get_mut(self.ctx.eos as usize) {
                c.logit = f32::NEG_INFINITY;
            }
        }

        self.apply_penalties(&mut cands);

        if self.params.temperature <= 0.0 {
            softmax(&mut cands);
            return finish(cands, 0);
        }

        let chosen = match self.params.mirostat {
            1 => {
                apply_temperature(&mut cands, self.params.temperature);
                self.mirostat_v1(&mut cands)?
            }
            2 => {
                apply_temperature(&mut cands, self.params.temperature);
                self.mirostat_v2(&mut cands)?
            }
            _ => {
                apply_top_k(&mut cands, self.params.top_k);
                apply_typical(&mut cands, self.params.typical_p);
                apply_top_p(&mut cands, self.params.top_p);
                apply_min_p(&mut cands, self.params.min_p);
                apply_temperature(&mut cands, self.params.temperature);
                softmax(&mut cands);
                self.pick(&cands)?
            }
        };

        finish(cands, chosen)
    }

    fn apply_penalties(&self, cands: &mut [Candidate]) {
        if !self.params.penalties_enabled() || self.history.is_empty() {
            return;
        }

        let limit = self.history_limit();
        let skip = self.history.len().saturating_sub(limit);
        let mut counts: HashMap<TokenId, usize> = HashMap::new();
        for &token in self.history.iter().skip(skip) {
            *counts.entry(token).or_default() += 1;
        }

        for (token, count) in counts {
            let Some(c) = cands.get_mut(token as usize) else {
                continue;
            };
            // Dividing positive and multiplying negative logits always lowers them.
            if c.logit > 0.0 {
                c.logit /= self.params.penalty_repeat;
            } else {
                c.logit *= self.params.penalty_repeat;
            }
            c.logit -= count as f32 * self.params.penalty_freq + self.params.penalty_present;
        }
    }

    fn mirostat_v1(&mut self, cands: &mut Vec<Candidate>) -> SamplingResult<usize> {
        const M: usize = 100;
        let tau = self.params.mirostat_tau;
        let eta = self.params.mirostat_eta;
        let n_vocab = self.ctx.n_vocab.max(cands.len()) as f32;

        softmax(cands);

        // Estimate the Zipf exponent from the head of the distribution.
        let mut sum_ti_bi = 0.0f32;
        let mut sum_ti_sq = 0.0f32;
        for i in 0..M.min(cands.len()).saturating_sub(1) {
            if cands[i + 1].p <= 0.0 {
                break;
            }
            let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
            let b_i = (cands[i].p / cands[i + 1].p).ln();
            sum_ti_bi += t_i * b_i;
            sum_ti_sq += t_i * t_i;
        }
        let s_hat = if sum_ti_sq > 0.0 { sum_ti_bi / sum_ti_sq } else { 1.0 };

        let epsilon_hat = s_hat - 1.0;
        let k = ((epsilon_hat * 2f32.powf(self.mu)) / (1.0 - n_vocab.powf(-epsilon_hat)))
            .powf(1.0 / s_hat);
        let k = if k.is_finite() { k.max(1.0) as i32 } else { 1 };

        apply_top_k(cands, k);
        softmax(cands);
        let chosen = self.pick(cands)?;

        let surprise = -cands[chosen].p.log2();
        self.mu -= eta * (surprise - tau);
        Ok(chosen)
    }

    fn mirostat_v2(&mut self, cands: &mut Vec<Candidate>) -> SamplingResult<usize> {
        let tau = self.params.mirostat_tau;
        let eta = self.params.mirostat_eta;

        softmax(cands);
        let mu = self.mu;
        let keep = cands
            .iter()
            .position(|c| -c.p.log2() > mu)
            .unwrap_or(cands.len())
            .max(1);
        cands.truncate(keep);
        softmax(cands);

        let chosen = self.pick(cands)?;
        let surprise = -cands[chosen].p.log2();
        self.mu -= eta * (surprise - tau);
        Ok(chosen)
    }

    fn pick(&mut self, cands: &[Candidate]) -> SamplingResult<usize> {
        let r = self.rng.next_f32();
        let mut cumsum = 0.0;
        for (i, c) in cands.iter().enumerate() {
            cumsum += c.p;
            if r < cumsum {
                return Ok(i);
            }
        }

        // Rounding left r above the total: fall back to the last live candidate.
        cands
            .iter()
            .rposition(|c| c.p > 0.0)
            .ok_or(SamplingError::NoValidTokens)
    }
}

impl TokenSampler for Sampler {
    fn sample(&mut self, logits: &[f32]) -> cactus_engine::Result<SampledToken> {
        Ok(self.sample_token(logits)?)
    }

    fn accept(&mut self, token: TokenId, _apply_grammar: bool) {
        let limit = self.history_limit();
        if limit == 0 {
            return;
        }
        self.history.push_back(token);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    fn reset(&mut self) {
        self.history.clear();
        self.mu = 2.0 * self.params.mirostat_tau;
    }
}

fn finish(cands: Vec<Candidate>, chosen: usize) -> SamplingResult<SampledToken> {
    let picked = cands.get(chosen).ok_or(SamplingError::NoValidTokens)?;
    if picked.p.is_nan() || picked.p <= 0.0 {
        return Err(SamplingError::NoValidTokens);
    }
    let token = picked.id;
    let candidates = cands
        .into_iter()
        .filter(|c| c.p > 0.0)
        .map(|c| TokenProb {
            token: c.id,
            prob: c.p,
        })
        .collect();
    Ok(SampledToken { token, candidates })
}

/// Sort by logit (descending) and fill in normalized probabilities.
fn softmax(cands: &mut [Candidate]) {
    cands.sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(std::cmp::Ordering::Equal));
    let Some(max_logit) = cands.first().map(|c| c.logit) else {
        return;
    };
    if max_logit == f32::NEG_INFINITY {
        let uniform = 1.0 / cands.len() as f32;
        cands.iter_mut().for_each(|c| c.p = uniform);
        return;
    }

    let mut sum = 0.0;
    for c in cands.iter_mut() {
        c.p = (c.logit - max_logit).exp();
        sum += c.p;
    }
    for c in cands.iter_mut() {
        c.p /= sum;
    }
}

fn apply_temperature(cands: &mut [Candidate], temperature: f32) {
    if (temperature - 1.0).abs() > 1e-6 {
        for c in cands.iter_mut() {
            c.logit /= temperature;
        }
    }
}

fn apply_top_k(cands: &mut Vec<Candidate>, k: i32) {
    if k <= 0 || k as usize >= cands.len() {
        return;
    }
    softmax(cands);
    cands.truncate(k as usize);
}

fn apply_top_p(cands: &mut Vec<Candidate>, p: f32) {
    if p >= 1.0 {
        return;
    }
    softmax(cands);
    let mut cumsum = 0.0;
    let mut keep = cands.len();
    for (i, c) in cands.iter().enumerate() {
        cumsum += c.p;
        if cumsum >= p {
            keep = i + 1;
            break;
        }
    }
    cands.truncate(keep.max(1));
}

fn apply_min_p(cands: &mut Vec<Candidate>, p: f32) {
    if p <= 0.0 || cands.is_empty() {
        return;
    }
    softmax(cands);
    let threshold = cands[0].p * p;
    let keep = cands.iter().take_while(|c| c.p >= threshold).count();
    cands.truncate(keep.max(1));
}

/// Locally typical sampling: keep tokens whose surprise is closest to the
/// distribution's entropy until their mass reaches `p`.
fn apply_typical(cands: &mut Vec<Candidate>, p: f32) {
    if p >= 1.0 || cands.len() < 2 {
        return;
    }
    softmax(cands);
    let entropy: f32 = cands
        .iter()
        .filter(|c| c.p > 0.0)
        .map(|c| -c.p * c.p.ln())
        .sum();

    let mut scored: Vec<(f32, Candidate)> = cands
        .iter()
        .map(|&c| ((-c.p.ln() - entropy).abs(), c))
        .collect();
    scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumsum = 0.0;
    let mut keep = scored.len();
    for (i, (_, c)) in scored.iter().enumerate() {
        cumsum += c.p;
        if cumsum >= p {
            keep = i + 1;
            break;
        }
    }
    *cands = scored.into_iter().take(keep.max(1)).map(|(_, c)| c).collect();
}
