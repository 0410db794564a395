//! Exponential-decay weighting of timestamped rating vectors.

use chrono::{DateTime, Utc};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// A vector paired with the moment its signal was recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedVector {
    /// Embedding values.
    pub vector: Vec<f32>,
    /// When the rating was made.
    pub timestamp: DateTime<Utc>,
}

impl TimestampedVector {
    /// Pairs a vector with its timestamp.
    pub fn new(vector: Vec<f32>, timestamp: DateTime<Utc>) -> Self {
        Self { vector, timestamp }
    }
}

/// Decay weight for a signal `age_days` old.
///
/// Negative ages (timestamps after `now`) produce weights above one; the
/// weight is deliberately left unclamped.
pub fn decay_weight(age_days: f64, half_life_days: f64) -> f64 {
    let lambda = std::f64::consts::LN_2 / half_life_days;
    (-lambda * age_days).exp()
}

/// Fractional days between `timestamp` and `now`.
pub fn age_in_days(now: DateTime<Utc>, timestamp: DateTime<Utc>) -> f64 {
    (now - timestamp).num_milliseconds() as f64 / MILLIS_PER_DAY
}

/// Weighted average of `vectors`, newer signals weighing more.
///
/// Returns `None` for an empty input or when the weights sum to exactly zero.
pub fn weighted_average(
    vectors: &[TimestampedVector],
    half_life_days: f64,
    now: DateTime<Utc>,
) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let mut weighted_sum = vec![0.0f64; first.vector.len()];
    let mut total_weight = 0.0f64;

    for entry in vectors {
        assert_eq!(
            entry.vector.len(),
            weighted_sum.len(),
            "vector dimensionality mismatch: {} vs {}",
            weighted_sum.len(),
            entry.vector.len()
        );
        let weight = decay_weight(age_in_days(now, entry.timestamp), half_life_days);
        for (acc, val) in weighted_sum.iter_mut().zip(&entry.vector) {
            *acc += weight * f64::from(*val);
        }
        total_weight += weight;
    }

    if total_weight == 0.0 {
        return None;
    }

    Some(
        weighted_sum
            .into_iter()
            .map(|val| (val / total_weight) as f32)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn empty_input_is_absent() {
        assert!(weighted_average(&[], 90.0, now()).is_none());
    }

    #[test]
    fn equal_timestamps_give_plain_average() {
        let ts = now() - Duration::days(12);
        let vectors = vec![
            TimestampedVector::new(vec![1.0, 0.0, 0.0], ts),
            TimestampedVector::new(vec![0.0, 1.0, 0.0], ts),
        ];
        let avg = weighted_average(&vectors, 90.0, now()).expect("present");
        for (got, want) in avg.iter().zip([0.5f32, 0.5, 0.0]) {
            assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
        }
    }

    #[test]
    fn half_life_halves_the_weight() {
        let half_life = 30.0;
        let fresh = decay_weight(0.0, half_life);
        let aged = decay_weight(half_life, half_life);
        assert!((aged - fresh / 2.0).abs() < 1e-12);

        // [1,0] aged one half-life weighs 0.5, [0,1] fresh weighs 1.0.
        let vectors = vec![
            TimestampedVector::new(vec![1.0, 0.0], now() - Duration::days(30)),
            TimestampedVector::new(vec![0.0, 1.0], now()),
        ];
        let avg = weighted_average(&vectors, half_life, now()).expect("present");
        assert!((avg[0] - 1.0 / 3.0).abs() < 1e-6);
        assert!((avg[1] - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn future_timestamps_weigh_more_than_one() {
        let age = age_in_days(now(), now() + Duration::days(10));
        assert!(age < 0.0);
        assert!(decay_weight(age, 10.0) > 1.0);
    }
}
