//! Vector helpers shared by the store (nearest-neighbor scans) and the clustering engine.

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.is_empty() || right.is_empty() || left.len() != right.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut left_norm_sq = 0.0f32;
    let mut right_norm_sq = 0.0f32;
    for (left_value, right_value) in left.iter().zip(right.iter()) {
        dot += left_value * right_value;
        left_norm_sq += left_value * left_value;
        right_norm_sq += right_value * right_value;
    }
    if left_norm_sq <= f32::EPSILON || right_norm_sq <= f32::EPSILON {
        return 0.0;
    }
    (dot / (left_norm_sq.sqrt() * right_norm_sq.sqrt())).clamp(-1.0, 1.0)
}

/// Cosine distance in `[0, 2]`.
pub fn cosine_distance(left: &[f32], right: &[f32]) -> f32 {
    (1.0 - cosine_similarity(left, right)).clamp(0.0, 2.0)
}

pub fn normalize_vector(mut vector: Vec<f32>) -> Option<Vec<f32>> {
    if vector.iter().any(|value| !value.is_finite()) {
        return None;
    }
    let norm_sq = vector
        .iter()
        .map(|value| value * value)
        .fold(0.0f32, |acc, value| acc + value);
    if norm_sq <= f32::EPSILON {
        return None;
    }

    let norm = norm_sq.sqrt();
    for value in &mut vector {
        *value /= norm;
    }

    Some(vector)
}

/// `centroid + (candidate - centroid) / (weight + 1)`, re-normalized to unit length.
///
/// `weight` is the prototype's effective member weight, capped by the caller so old
/// prototypes keep adapting instead of freezing.
pub fn moving_centroid(centroid: &[f32], candidate: &[f32], weight: u64) -> Vec<f32> {
    let step = 1.0 / (weight as f32 + 1.0);
    let updated = centroid
        .iter()
        .zip(candidate.iter())
        .map(|(current, incoming)| current + (incoming - current) * step)
        .collect::<Vec<_>>();
    normalize_vector(updated.clone()).unwrap_or(updated)
}

/// Member-count weighted mean of two centroids, re-normalized to unit length.
pub fn weighted_merge(left: &[f32], left_count: u64, right: &[f32], right_count: u64) -> Vec<f32> {
    let total = (left_count + right_count).max(1) as f32;
    let left_weight = left_count as f32 / total;
    let right_weight = right_count as f32 / total;
    let merged = left
        .iter()
        .zip(right.iter())
        .map(|(l, r)| l * left_weight + r * right_weight)
        .collect::<Vec<_>>();
    normalize_vector(merged.clone()).unwrap_or(merged)
}

pub fn mean_vector(vectors: &[&[f32]]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let dim = first.len();
    if dim == 0 || vectors.iter().any(|vector| vector.len() != dim) {
        return None;
    }
    let mut sum = vec![0.0f32; dim];
    for vector in vectors {
        for (acc, value) in sum.iter_mut().zip(vector.iter()) {
            *acc += value;
        }
    }
    let count = vectors.len() as f32;
    for value in &mut sum {
        *value /= count;
    }
    normalize_vector(sum)
}
