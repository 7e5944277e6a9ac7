//! Vector utilities shared by the embedding client and the stores.
//!
//! Pure helpers for similarity, the `[a,b,...]` vector literal used at the
//! storage boundary, and the deterministic fallback vector produced when an
//! embedding backend is unavailable.

use sha2::{Digest, Sha256};

use crate::error::{RagError, RagResult};

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty, zero-norm, or
/// length-mismatched input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Cosine distance, `1 - cosine_similarity`, in `[0.0, 2.0]`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Normalized similarity score `1 - distance`, clamped to `[0, 1]`.
pub fn score_from_distance(distance: f32) -> f64 {
    (1.0 - distance as f64).clamp(0.0, 1.0)
}

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Average several vectors of equal length and renormalize the result.
pub fn mean_pool(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let mut acc = vec![0.0f32; first.len()];
    for v in vectors {
        if v.len() != acc.len() {
            return None;
        }
        for (a, x) in acc.iter_mut().zip(v) {
            *a += x;
        }
    }
    let n = vectors.len() as f32;
    for a in acc.iter_mut() {
        *a /= n;
    }
    normalize(&mut acc);
    Some(acc)
}

/// Encode a vector as the compact literal stored in vector columns.
///
/// ```rust
/// use rag_harness_core::embedding::encode_vector_literal;
///
/// assert_eq!(encode_vector_literal(&[0.01, 0.5]).unwrap(), "[0.01,0.5]");
/// ```
pub fn encode_vector_literal(v: &[f32]) -> RagResult<String> {
    let mut out = String::with_capacity(v.len() * 10 + 2);
    out.push('[');
    for (i, x) in v.iter().enumerate() {
        if !x.is_finite() {
            return Err(RagError::validation(format!(
                "vector component {} is not finite",
                i
            )));
        }
        if i > 0 {
            out.push(',');
        }
        out.push_str(&x.to_string());
    }
    out.push(']');
    Ok(out)
}

/// Parse a literal produced by [`encode_vector_literal`].
pub fn parse_vector_literal(s: &str) -> RagResult<Vec<f32>> {
    let inner = s
        .trim()
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| RagError::validation("vector literal must be wrapped in brackets"))?;
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .map_err(|e| RagError::validation(format!("bad vector component '{}': {}", part, e)))
        })
        .collect()
}

/// Collapse runs of whitespace and trim, producing the embedding cache key text.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deterministic unit vector of length `dims` derived from the text's SHA-256.
///
/// Used in place of a real embedding when the backend fails and the
/// fallback policy is enabled. The same text always maps to the same vector,
/// so downstream storage and indexing stay structurally valid.
pub fn fallback_vector(text: &str, dims: usize) -> Vec<f32> {
    let normalized = normalize_whitespace(text);
    let seed = Sha256::digest(normalized.as_bytes());
    let mut out = Vec::with_capacity(dims);
    let mut counter: u32 = 0;
    while out.len() < dims {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(counter.to_le_bytes());
        let block = hasher.finalize();
        for pair in block.chunks_exact(2) {
            if out.len() == dims {
                break;
            }
            let raw = u16::from_le_bytes([pair[0], pair[1]]) as f32;
            out.push(raw / u16::MAX as f32 * 2.0 - 1.0);
        }
        counter += 1;
    }
    normalize(&mut out);
    if dims > 0 && out.iter().all(|x| *x == 0.0) {
        let uniform = 1.0 / (dims as f32).sqrt();
        out.iter_mut().for_each(|x| *x = uniform);
    }
    out
}

/// SHA-256 hex digest of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_distance(&v, &v).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_mismatched() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_score_is_clamped() {
        assert_eq!(score_from_distance(0.0), 1.0);
        assert_eq!(score_from_distance(1.5), 0.0);
        assert!((score_from_distance(0.25) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_literal_encoding() {
        let lit = encode_vector_literal(&[0.01, -2.5, 3.0]).unwrap();
        assert_eq!(lit, "[0.01,-2.5,3]");
        assert_eq!(parse_vector_literal(&lit).unwrap(), vec![0.01, -2.5, 3.0]);
        assert!(parse_vector_literal("[]").unwrap().is_empty());
        assert!(parse_vector_literal("0.1,0.2").is_err());
    }

    #[test]
    fn test_literal_rejects_nan() {
        let err = encode_vector_literal(&[0.1, f32::NAN]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_fallback_vector_is_deterministic_unit() {
        let a = fallback_vector("hello   world", 384);
        let b = fallback_vector("hello world", 384);
        let c = fallback_vector("goodbye", 384);
        assert_eq!(a.len(), 384);
        assert_eq!(a, b, "whitespace-normalized text maps to the same vector");
        assert_ne!(a, c);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_mean_pool() {
        let pooled = mean_pool(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        assert!((pooled[0] - pooled[1]).abs() < 1e-6);
        assert!(mean_pool(&[vec![1.0], vec![1.0, 2.0]]).is_none());
        assert!(mean_pool(&[]).is_none());
    }
}
