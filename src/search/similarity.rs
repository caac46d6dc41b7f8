use crate::error::{Error, Result};

/// Self-dot products below this are treated as zero vectors.
pub const EPSILON: f64 = 1e-6;

/// Cosine similarity of two equal-length vectors, in [-1, 1].
///
/// A near-zero vector scores 0 against anything. Accumulates in f64.
/// Non-finite input that survives to the score is an `Integrity` error.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(Error::Integrity(format!(
            "vector length mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }

    let (mut dot, mut aa, mut bb) = (0f64, 0f64, 0f64);
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        aa += x * x;
        bb += y * y;
    }

    if aa < EPSILON || bb < EPSILON {
        return Ok(0.0);
    }
    let score = dot / (aa * bb).sqrt();
    if !score.is_finite() {
        return Err(Error::Integrity("similarity of non-finite vectors".into()));
    }
    Ok(score as f32)
}
