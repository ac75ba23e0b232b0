//! Embedding vector normalisation.

/// Largest magnitude after max-abs normalisation, just inside the `i16` range.
const MAX_ABS_SCALE: f32 = 32760.0;

/// Normalise `embd` according to `mode`:
///
/// | mode | divisor                      |
/// |------|------------------------------|
/// | `-1` | none                         |
/// | `0`  | `max(|x|) / 32760`           |
/// | `1`  | `sum(|x|)`                   |
/// | `2`  | `sqrt(sum(x^2))`             |
/// | `p`  | `sum(|x|^p)^(1/p)`           |
///
/// A zero divisor yields a zero vector.
pub fn normalize(embd: &[f32], mode: i32) -> Vec<f32> {
    let divisor: f64 = match mode {
        m if m < 0 => 1.0,
        0 => {
            let max = embd.iter().fold(0.0f32, |acc, x| acc.max(x.abs()));
            f64::from(max) / f64::from(MAX_ABS_SCALE)
        }
        1 => embd.iter().map(|x| f64::from(x.abs())).sum(),
        2 => embd.iter().map(|x| f64::from(*x) * f64::from(*x)).sum::<f64>().sqrt(),
        p => {
            let p = f64::from(p);
            embd.iter()
                .map(|x| f64::from(x.abs()).powf(p))
                .sum::<f64>()
                .powf(1.0 / p)
        }
    };
    let norm = if divisor > 0.0 { 1.0 / divisor } else { 0.0 };
    embd.iter().map(|x| (f64::from(*x) * norm) as f32).collect()
}
