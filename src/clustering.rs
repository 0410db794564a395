//! K-means with k-means++ seeding over a user's liked-item vectors.
//!
//! The engine draws randomness only from the generator passed in, so the same
//! inputs and the same seeded stream always produce the same centroids and
//! assignments. Empty clusters are never pruned here: their centroid carries
//! over unchanged and callers use [`count_assignments`] to skip them.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::vector_math::{euclidean_distance, squared_distance};

/// Tunables for recomputing a user's interest clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of interest clusters to build.
    pub num_clusters: usize,
    /// Liked items required before clustering runs at all.
    pub min_items_for_clustering: usize,
    /// Upper bound on Lloyd iterations.
    pub max_iterations: usize,
    /// Stop once no centroid moves farther than this.
    pub convergence_threshold: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_clusters: 3,
            min_items_for_clustering: 6,
            max_iterations: 50,
            convergence_threshold: 1e-4,
        }
    }
}

/// Output of [`kmeans`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterResult {
    /// One centroid per requested cluster.
    pub centroids: Vec<Vec<f32>>,
    /// Cluster index for each input point, in input order.
    pub assignments: Vec<usize>,
}

impl ClusterResult {
    /// True when no clustering was performed.
    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }
}

/// Partitions `points` into `k` clusters.
///
/// Returns an empty result for no points or `k == 0`. `k` may exceed the
/// number of points; the surplus clusters keep their seeded centroid and end
/// up with zero members.
pub fn kmeans<R>(
    points: &[Vec<f32>],
    k: usize,
    max_iterations: usize,
    convergence_threshold: f64,
    rng: &mut R,
) -> ClusterResult
where
    R: Rng + ?Sized,
{
    if points.is_empty() || k == 0 {
        return ClusterResult::default();
    }

    let mut centroids = seed_centroids(points, k, rng);
    let mut assignments = vec![0usize; points.len()];

    for _ in 0..max_iterations {
        assign_points(points, &centroids, &mut assignments);
        let updated = recompute_centroids(points, &assignments, &centroids);
        let movement = max_movement(&centroids, &updated);
        centroids = updated;
        if movement < convergence_threshold {
            break;
        }
    }

    ClusterResult {
        centroids,
        assignments,
    }
}

/// Counts members per cluster, ignoring out-of-range indices.
pub fn count_assignments(assignments: &[usize], k: usize) -> Vec<usize> {
    let mut counts = vec![0usize; k];
    for &cluster in assignments {
        if let Some(count) = counts.get_mut(cluster) {
            *count += 1;
        }
    }
    counts
}

/// k-means++: first centroid uniform, the rest sampled proportionally to the
/// squared distance from the nearest centroid chosen so far.
fn seed_centroids<R>(points: &[Vec<f32>], k: usize, rng: &mut R) -> Vec<Vec<f32>>
where
    R: Rng + ?Sized,
{
    let mut centroids = Vec::with_capacity(k);
    centroids.push(points[rng.gen_range(0..points.len())].clone());

    let mut distances = vec![0.0f64; points.len()];
    while centroids.len() < k {
        let mut total = 0.0f64;
        for (slot, point) in distances.iter_mut().zip(points) {
            let nearest = centroids
                .iter()
                .map(|centroid| squared_distance(point, centroid))
                .fold(f64::MAX, f64::min);
            *slot = nearest;
            total += nearest;
        }

        let target = rng.gen::<f64>() * total;
        let mut cumulative = 0.0f64;
        let mut chosen = 0usize;
        for (idx, distance) in distances.iter().enumerate() {
            cumulative += distance;
            if cumulative >= target {
                chosen = idx;
                break;
            }
        }
        centroids.push(points[chosen].clone());
    }

    centroids
}

fn assign_points(points: &[Vec<f32>], centroids: &[Vec<f32>], assignments: &mut [usize]) {
    for (slot, point) in assignments.iter_mut().zip(points) {
        *slot = nearest_centroid(point, centroids);
    }
}

/// Index of the closest centroid; ties go to the lowest index.
fn nearest_centroid(point: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0usize;
    let mut best_distance = f64::MAX;
    for (idx, centroid) in centroids.iter().enumerate() {
        let distance = squared_distance(point, centroid);
        if distance < best_distance {
            best_distance = distance;
            best = idx;
        }
    }
    best
}

fn recompute_centroids(
    points: &[Vec<f32>],
    assignments: &[usize],
    previous: &[Vec<f32>],
) -> Vec<Vec<f32>> {
    let dim = points[0].len();
    let mut sums = vec![vec![0.0f32; dim]; previous.len()];
    let mut counts = vec![0usize; previous.len()];

    for (point, &cluster) in points.iter().zip(assignments) {
        counts[cluster] += 1;
        for (acc, val) in sums[cluster].iter_mut().zip(point) {
            *acc += val;
        }
    }

    sums.into_iter()
        .zip(counts)
        .zip(previous)
        .map(|((mut sum, count), old)| {
            if count == 0 {
                return old.clone();
            }
            for val in sum.iter_mut() {
                *val /= count as f32;
            }
            sum
        })
        .collect()
}

fn max_movement(old: &[Vec<f32>], new: &[Vec<f32>]) -> f64 {
    old.iter()
        .zip(new)
        .map(|(a, b)| euclidean_distance(a, b))
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn rng(seed: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(seed)
    }

    #[test]
    fn empty_input_or_zero_k_yields_nothing() {
        let result = kmeans(&[], 3, 50, 1e-4, &mut rng(42));
        assert!(result.is_empty());
        assert!(result.assignments.is_empty());

        let points = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let result = kmeans(&points, 0, 50, 1e-4, &mut rng(42));
        assert!(result.is_empty());
        assert!(result.assignments.is_empty());
    }

    #[test]
    fn single_cluster_is_the_mean() {
        let points = vec![
            vec![0.0, 0.0],
            vec![2.0, 0.0],
            vec![0.0, 2.0],
            vec![2.0, 2.0],
            vec![1.0, 6.0],
        ];
        let result = kmeans(&points, 1, 50, 1e-4, &mut rng(7));
        assert_eq!(result.centroids.len(), 1);
        assert_eq!(result.assignments, vec![0; 5]);
        assert!((result.centroids[0][0] - 1.0).abs() < 1e-5);
        assert!((result.centroids[0][1] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn separates_two_obvious_groups() {
        let points = vec![
            vec![0.0, 0.0],
            vec![0.1, 0.1],
            vec![-0.1, 0.1],
            vec![0.1, -0.1],
            vec![10.0, 10.0],
            vec![10.1, 10.1],
            vec![9.9, 10.1],
            vec![10.1, 9.9],
        ];
        let result = kmeans(&points, 2, 50, 1e-4, &mut rng(42));
        assert_eq!(result.centroids.len(), 2);

        let low = result.assignments[0];
        let high = result.assignments[4];
        assert_ne!(low, high);
        assert!(result.assignments[..4].iter().all(|&a| a == low));
        assert!(result.assignments[4..].iter().all(|&a| a == high));
        assert!(euclidean_distance(&result.centroids[low], &[0.025, 0.025]) < 0.5);
        assert!(euclidean_distance(&result.centroids[high], &[10.025, 10.025]) < 0.5);
    }

    #[test]
    fn same_seed_same_output() {
        let points: Vec<Vec<f32>> = (0..40)
            .map(|i| {
                let x = (i % 7) as f32 * 1.3;
                let y = (i % 5) as f32 * 0.7 + (i / 10) as f32;
                vec![x, y, (x * y).sin()]
            })
            .collect();
        let first = kmeans(&points, 4, 25, 1e-6, &mut rng(99));
        let second = kmeans(&points, 4, 25, 1e-6, &mut rng(99));
        assert_eq!(first, second);
    }

    #[test]
    fn more_clusters_than_points_keeps_k_centroids() {
        let points = vec![vec![0.0, 0.0], vec![1.0, 1.0]];
        let result = kmeans(&points, 5, 50, 1e-4, &mut rng(42));
        assert_eq!(result.centroids.len(), 5);
        assert_eq!(result.assignments.len(), 2);
        assert!(result
            .centroids
            .iter()
            .flatten()
            .all(|value| value.is_finite()));

        let counts = count_assignments(&result.assignments, 5);
        assert_eq!(counts.iter().sum::<usize>(), 2);
        assert!(counts.iter().filter(|&&c| c == 0).count() >= 3);
    }

    #[test]
    fn identical_points_do_not_break_seeding() {
        let points = vec![vec![1.0, 1.0]; 4];
        let result = kmeans(&points, 3, 10, 1e-4, &mut rng(1));
        assert_eq!(result.centroids.len(), 3);
        assert_eq!(result.assignments, vec![0; 4]);
    }

    #[test]
    fn ties_go_to_lowest_index() {
        let centroids = vec![vec![1.0, 0.0], vec![-1.0, 0.0]];
        assert_eq!(nearest_centroid(&[0.0, 0.0], &centroids), 0);
    }

    #[test]
    fn counts_ignore_out_of_range() {
        assert_eq!(count_assignments(&[0, 2, 2, 7], 3), vec![1, 0, 2]);
    }
}
