//! Per-completion sampling configuration.

use serde::Deserialize;

/// Seed value meaning "pick one at random".
pub const RANDOM_SEED: u32 = u32::MAX;

/// Sampling knobs accepted by a completion call.
///
/// Deserializes with per-field defaults, so a binding may send only the
/// fields it cares about.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SamplingParams {
    #[serde(default = "default_seed")]
    pub seed: u32,

    /// `<= 0` selects greedy decoding.
    #[serde(default = "default_temperature", alias = "temp")]
    pub temperature: f32,

    /// `<= 0` disables top-k.
    #[serde(default = "default_top_k")]
    pub top_k: i32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_min_p")]
    pub min_p: f32,

    #[serde(default = "default_typical_p", alias = "typ_p")]
    pub typical_p: f32,

    /// History length for penalties; `0` disables them, `-1` uses the whole context.
    #[serde(default = "default_penalty_last_n")]
    pub penalty_last_n: i32,

    #[serde(default = "default_penalty_repeat")]
    pub penalty_repeat: f32,

    #[serde(default)]
    pub penalty_freq: f32,

    #[serde(default)]
    pub penalty_present: f32,

    /// 0 = off, 1 = Mirostat, 2 = Mirostat 2.0.
    #[serde(default)]
    pub mirostat: u8,

    #[serde(default = "default_mirostat_tau")]
    pub mirostat_tau: f32,

    #[serde(default = "default_mirostat_eta")]
    pub mirostat_eta: f32,

    #[serde(default)]
    pub ignore_eos: bool,

    /// Alternatives recorded per generated token; 0 disables recording.
    #[serde(default)]
    pub n_probs: usize,

    /// Grammar constraint (GBNF). Empty means unconstrained.
    #[serde(default)]
    pub grammar: String,
}

fn default_seed() -> u32 {
    RANDOM_SEED
}

fn default_temperature() -> f32 {
    0.8
}

fn default_top_k() -> i32 {
    40
}

fn default_top_p() -> f32 {
    0.95
}

fn default_min_p() -> f32 {
    0.05
}

fn default_typical_p() -> f32 {
    1.0
}

fn default_penalty_last_n() -> i32 {
    64
}

fn default_penalty_repeat() -> f32 {
    1.0
}

fn default_mirostat_tau() -> f32 {
    5.0
}

fn default_mirostat_eta() -> f32 {
    0.1
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            min_p: default_min_p(),
            typical_p: default_typical_p(),
            penalty_last_n: default_penalty_last_n(),
            penalty_repeat: default_penalty_repeat(),
            penalty_freq: 0.0,
            penalty_present: 0.0,
            mirostat: 0,
            mirostat_tau: default_mirostat_tau(),
            mirostat_eta: default_mirostat_eta(),
            ignore_eos: false,
            n_probs: 0,
            grammar: String::new(),
        }
    }
}

impl SamplingParams {
    /// Deterministic argmax decoding.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_k(mut self, k: i32) -> Self {
        self.top_k = k;
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    pub fn with_min_p(mut self, p: f32) -> Self {
        self.min_p = p;
        self
    }

    pub fn with_typical_p(mut self, p: f32) -> Self {
        self.typical_p = p;
        self
    }

    pub fn with_penalties(mut self, last_n: i32, repeat: f32, freq: f32, present: f32) -> Self {
        self.penalty_last_n = last_n;
        self.penalty_repeat = repeat;
        self.penalty_freq = freq;
        self.penalty_present = present;
        self
    }

    pub fn with_mirostat(mut self, version: u8, tau: f32, eta: f32) -> Self {
        self.mirostat = version;
        self.mirostat_tau = tau;
        self.mirostat_eta = eta;
        self
    }

    pub fn with_ignore_eos(mut self, ignore: bool) -> Self {
        self.ignore_eos = ignore;
        self
    }

    pub fn with_n_probs(mut self, n: usize) -> Self {
        self.n_probs = n;
        self
    }

    pub fn with_grammar(mut self, grammar: impl Into<String>) -> Self {
        self.grammar = grammar.into();
        self
    }

    pub fn penalties_enabled(&self) -> bool {
        self.penalty_last_n != 0
            && (self.penalty_repeat != 1.0 || self.penalty_freq != 0.0 || self.penalty_present != 0.0)
    }
}
