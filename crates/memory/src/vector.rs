//! Vector math and float32 serialization for fact embeddings.
//!
//! Embeddings are stored as little-endian byte sequences so the redb value
//! bytes are portable across architectures and directly comparable to what a
//! Python/JS sibling implementation would produce.

/// Cosine similarity between two equal-length vectors. Returns 0.0 for a
/// zero-length or zero-norm vector rather than producing NaN.
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
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Mean (centroid) of a slice of equal-length vectors. Returns an empty
/// vector if `vectors` is empty.
pub fn centroid(vectors: &[Vec<f32>]) -> Vec<f32> {
    let Some(dim) = vectors.first().map(|v| v.len()) else {
        return Vec::new();
    };
    let mut sum = vec![0.0f32; dim];
    for v in vectors {
        for (acc, x) in sum.iter_mut().zip(v.iter()) {
            *acc += x;
        }
    }
    let n = vectors.len() as f32;
    for x in &mut sum {
        *x /= n;
    }
    sum
}

/// L2-normalize a vector in place. No-op on a zero vector.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Serialize a float32 vector to little-endian bytes.
pub fn serialize_vector(v: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(v.len() * 4);
    for x in v {
        bytes.extend_from_slice(&x.to_le_bytes());
    }
    bytes
}

/// Deserialize a little-endian byte sequence back into a float32 vector.
/// Trailing bytes that don't form a complete f32 are dropped.
pub fn deserialize_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_vectors_is_one() {
        let v = vec![0.1, 0.2, 0.3, 0.4];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_mismatched_length_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn centroid_of_two_vectors() {
        let vectors = vec![vec![0.0, 0.0], vec![2.0, 4.0]];
        assert_eq!(centroid(&vectors), vec![1.0, 2.0]);
    }

    #[test]
    fn centroid_of_empty_is_empty() {
        assert!(centroid(&[]).is_empty());
    }

    #[test]
    fn serialization_round_trips() {
        let original = vec![0.0, -1.5, 3.25, f32::MIN_POSITIVE, -0.0001];
        let bytes = serialize_vector(&original);
        let restored = deserialize_vector(&bytes);
        assert_eq!(original, restored);
    }

    #[test]
    fn normalize_produces_unit_vector() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }
}
