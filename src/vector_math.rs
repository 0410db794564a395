//! Distance and averaging helpers over fixed-dimension `f32` vectors.
//!
//! Every function here expects its inputs to share one dimensionality. A
//! mismatch is a caller bug and panics, except for [`add_into`] and
//! [`subtract_from`], which back the aggregate store and report
//! [`VectorError::DimensionMismatch`] instead.

use thiserror::Error;

/// Errors raised by the checked aggregate helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VectorError {
    /// The two operands have different lengths.
    #[error("vector length mismatch: {expected} vs {actual}")]
    DimensionMismatch {
        /// Length of the accumulator.
        expected: usize,
        /// Length of the incoming vector.
        actual: usize,
    },
}

/// Squared Euclidean distance, accumulated in `f64`.
pub fn squared_distance(a: &[f32], b: &[f32]) -> f64 {
    assert_same_len(a, b);
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let diff = f64::from(x - y);
            diff * diff
        })
        .sum()
}

/// Euclidean distance (square root of [`squared_distance`]).
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f64 {
    squared_distance(a, b).sqrt()
}

/// Cosine similarity in `[-1, 1]`; zero-length vectors score `0.0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    assert_same_len(a, b);
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Elementwise sum of `vectors`; `None` when the slice is empty.
pub fn sum<V: AsRef<[f32]>>(vectors: &[V]) -> Option<Vec<f32>> {
    let (first, rest) = vectors.split_first()?;
    let mut total = first.as_ref().to_vec();
    for vector in rest {
        let vector = vector.as_ref();
        assert_same_len(&total, vector);
        for (acc, val) in total.iter_mut().zip(vector) {
            *acc += val;
        }
    }
    Some(total)
}

/// Elementwise mean of `vectors`; `None` when the slice is empty.
pub fn average<V: AsRef<[f32]>>(vectors: &[V]) -> Option<Vec<f32>> {
    let mut total = sum(vectors)?;
    let count = vectors.len() as f32;
    for val in total.iter_mut() {
        *val /= count;
    }
    Some(total)
}

/// Adds `vector` into `acc` in place.
pub fn add_into(acc: &mut [f32], vector: &[f32]) -> Result<(), VectorError> {
    check_len(acc, vector)?;
    for (a, v) in acc.iter_mut().zip(vector) {
        *a += v;
    }
    Ok(())
}

/// Subtracts `vector` from `acc` in place. Values are not clamped.
pub fn subtract_from(acc: &mut [f32], vector: &[f32]) -> Result<(), VectorError> {
    check_len(acc, vector)?;
    for (a, v) in acc.iter_mut().zip(vector) {
        *a -= v;
    }
    Ok(())
}

fn check_len(acc: &[f32], vector: &[f32]) -> Result<(), VectorError> {
    if acc.len() != vector.len() {
        return Err(VectorError::DimensionMismatch {
            expected: acc.len(),
            actual: vector.len(),
        });
    }
    Ok(())
}

fn assert_same_len(a: &[f32], b: &[f32]) {
    assert_eq!(
        a.len(),
        b.len(),
        "vector dimensionality mismatch: {} vs {}",
        a.len(),
        b.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn distances_match_known_values() {
        assert!(close(squared_distance(&[0.0, 0.0], &[3.0, 4.0]), 25.0));
        assert!(close(euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]), 5.0));
        assert!(close(squared_distance(&[-1.0, -1.0], &[1.0, 1.0]), 8.0));
        assert!(close(squared_distance(&[], &[]), 0.0));
        assert!(close(euclidean_distance(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]), 0.0));
    }

    #[test]
    #[should_panic(expected = "dimensionality mismatch")]
    fn mismatched_distance_panics() {
        squared_distance(&[1.0], &[1.0, 2.0]);
    }

    #[test]
    fn average_of_vectors() {
        let avg = average(&[vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]).expect("non-empty");
        assert_eq!(avg, vec![0.5, 0.5, 0.0]);
        assert!(average::<Vec<f32>>(&[]).is_none());
    }

    #[test]
    fn checked_add_and_subtract_round_trip() {
        let mut acc = vec![1.0, 2.0];
        add_into(&mut acc, &[0.5, -1.0]).expect("same length");
        assert_eq!(acc, vec![1.5, 1.0]);
        subtract_from(&mut acc, &[0.5, -1.0]).expect("same length");
        assert_eq!(acc, vec![1.0, 2.0]);

        let err = add_into(&mut acc, &[1.0]).expect_err("length mismatch");
        assert_eq!(
            err,
            VectorError::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        );
        assert_eq!(acc, vec![1.0, 2.0]);
    }

    #[test]
    fn cosine_handles_orthogonal_and_zero() {
        assert!(close(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0));
        assert!(close(cosine_similarity(&[2.0, 0.0], &[1.0, 0.0]), 1.0));
        assert!(close(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0));
    }
}
