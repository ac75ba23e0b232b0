//! Spectral frames to PCM via inverse STFT with overlap-add.
//!
//! Each vocoder embedding row holds `n_embd / 2` log-magnitudes followed by
//! `n_embd / 2` phases for one frame.

use std::f32::consts::PI;
use std::thread;

pub const N_FFT: usize = 1280;
pub const N_HOP: usize = 320;
pub const N_WIN: usize = 1280;

/// Upper bound applied to `exp(log_magnitude)`.
const MAX_MAGNITUDE: f32 = 1e2;

/// Periodic Hann window.
pub fn hann_window(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / len as f32).cos()))
        .collect()
}

/// Inverse real DFT of the half spectrum `spectrum` (`re, im` pairs) into
/// `out.len()` samples, scaled by the number of bins.
fn irfft(spectrum: &[f32], cos_table: &[f32], sin_table: &[f32], out: &mut [f32]) {
    let n = out.len();
    let bins = n / 2 + 1;
    let available = (spectrum.len() / 2).min(bins);
    for (k, sample) in out.iter_mut().enumerate() {
        let mut acc = 0.0f32;
        for m in 0..available {
            let idx = (k * m) % n;
            acc += spectrum[2 * m] * cos_table[idx] - spectrum[2 * m + 1] * sin_table[idx];
        }
        *sample = acc / bins as f32;
    }
}

/// Overlap-add `n_frames` frames of `win` samples spaced `hop` apart into a
/// signal of `n_out` samples shifted left by `pad`, then drop `2 * pad`
/// samples from the end.
fn fold(frames: &[f32], win: usize, hop: usize, pad: usize, n_out: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; n_out];
    for (l, frame) in frames.chunks(win).enumerate() {
        for (j, &v) in frame.iter().enumerate() {
            let pos = l * hop + j;
            if pos >= pad && pos - pad < n_out {
                out[pos - pad] += v;
            }
        }
    }
    out.truncate(n_out.saturating_sub(2 * pad));
    out
}

/// Convert `n_codes` rows of `n_embd` vocoder embeddings to PCM samples,
/// spreading frames over `n_threads` workers.
pub fn embd_to_audio(embd: &[f32], n_codes: usize, n_embd: usize, n_threads: usize) -> Vec<f32> {
    if n_codes == 0 || n_embd < 2 {
        return Vec::new();
    }
    let n_pad = (N_WIN - N_HOP) / 2;
    let n_out = (n_codes - 1) * N_HOP + N_WIN;
    let half = n_embd / 2;
    let window = hann_window(N_FFT);

    let (cos_table, sin_table): (Vec<f32>, Vec<f32>) = (0..N_FFT)
        .map(|i| {
            let angle = 2.0 * PI * i as f32 / N_FFT as f32;
            (angle.cos(), angle.sin())
        })
        .unzip();

    let spectra: Vec<Vec<f32>> = embd
        .chunks(n_embd)
        .take(n_codes)
        .map(|row| {
            (0..half)
                .flat_map(|k| {
                    let mag = row[k].exp().min(MAX_MAGNITUDE);
                    let phi = row[k + half];
                    [mag * phi.cos(), mag * phi.sin()]
                })
                .collect()
        })
        .collect();

    let mut frames = vec![0.0f32; n_codes * N_FFT];
    let n_threads = n_threads.clamp(1, n_codes);
    let mut buckets: Vec<Vec<(usize, &mut [f32])>> = (0..n_threads).map(|_| Vec::new()).collect();
    for (l, frame) in frames.chunks_mut(N_FFT).enumerate() {
        buckets[l % n_threads].push((l, frame));
    }

    thread::scope(|s| {
        for bucket in buckets {
            let (spectra, window) = (&spectra, &window);
            let (cos_table, sin_table) = (&cos_table, &sin_table);
            s.spawn(move || {
                for (l, frame) in bucket {
                    irfft(&spectra[l], cos_table, sin_table, frame);
                    for (sample, w) in frame.iter_mut().zip(window) {
                        *sample *= w;
                    }
                }
            });
        }
    });

    let window_sq: Vec<f32> = window.iter().map(|w| w * w).collect();
    let envelope_frames: Vec<f32> = (0..n_codes).flat_map(|_| window_sq.iter().copied()).collect();

    let mut audio = fold(&frames, N_WIN, N_HOP, n_pad, n_out);
    let envelope = fold(&envelope_frames, N_WIN, N_HOP, n_pad, n_out);
    for (sample, env) in audio.iter_mut().zip(&envelope) {
        *sample = if *env > 0.0 { *sample / env } else { 0.0 };
    }
    audio
}
