//! Recomputes a user's interest clusters from their liked items.

use std::sync::Arc;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::clustering::{count_assignments, kmeans, ClusterConfig};
use crate::model::{InterestCluster, RatedItemVector, RatingKind};
use crate::store::{ClusterStore, RatingStore, StoreError};

/// Failure while rebuilding clusters.
#[derive(Debug, Error)]
pub enum ClusterUpdateError {
    /// Liked-item vectors could not be read.
    #[error("fetching positive ratings: {0}")]
    Ratings(#[source] StoreError),
    /// Liked-item vectors disagree on dimensionality.
    #[error("liked item {item_id} has {actual} dimensions, expected {expected}")]
    Dimension {
        /// Offending item.
        item_id: String,
        /// Width of the first liked vector.
        expected: usize,
        /// Width of the offending vector.
        actual: usize,
    },
    /// New clusters could not be stored.
    #[error("storing clusters: {0}")]
    Store(#[source] StoreError),
}

/// Runs k-means over liked items and replaces the stored clusters.
#[derive(Clone)]
pub struct ClusterUpdater {
    ratings: Arc<dyn RatingStore>,
    clusters: Arc<dyn ClusterStore>,
    clock: Arc<dyn Clock>,
}

impl ClusterUpdater {
    /// Wires the updater to its stores.
    pub fn new(
        ratings: Arc<dyn RatingStore>,
        clusters: Arc<dyn ClusterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ratings,
            clusters,
            clock,
        }
    }

    /// Rebuilds `user_id`'s clusters and returns how many were stored.
    ///
    /// With fewer liked items than `config.min_items_for_clustering` the
    /// stored clusters are cleared (best effort) and zero is returned.
    /// Clusters that end up with no members are not stored.
    pub async fn update_clusters<R>(
        &self,
        user_id: &str,
        config: &ClusterConfig,
        rng: &mut R,
    ) -> Result<usize, ClusterUpdateError>
    where
        R: Rng + ?Sized + Send,
    {
        let liked = self
            .ratings
            .rated_vectors(user_id, RatingKind::Positive)
            .await
            .map_err(ClusterUpdateError::Ratings)?;

        if let Some(first) = liked.first() {
            let expected = first.vector.len();
            if let Some(bad) = RatedItemVector::first_mismatch(&liked, expected) {
                return Err(ClusterUpdateError::Dimension {
                    item_id: bad.item_id.clone(),
                    expected,
                    actual: bad.vector.len(),
                });
            }
        }

        if liked.len() < config.min_items_for_clustering {
            debug!(
                user_id,
                count = liked.len(),
                min = config.min_items_for_clustering,
                "not enough liked items for clustering"
            );
            if let Err(err) = self.clusters.replace_clusters(user_id, &[]).await {
                warn!(user_id, error = %err, "failed to clear interest clusters");
            }
            return Ok(0);
        }

        let points: Vec<Vec<f32>> = liked.into_iter().map(|r| r.vector).collect();
        let k = config.num_clusters.min(points.len());
        let result = kmeans(
            &points,
            k,
            config.max_iterations,
            config.convergence_threshold,
            rng,
        );
        let counts = count_assignments(&result.assignments, k);
        let updated_at = self.clock.now();

        let clusters: Vec<InterestCluster> = result
            .centroids
            .into_iter()
            .zip(counts.iter().copied())
            .enumerate()
            .filter(|(_, (_, members))| *members > 0)
            .map(|(cluster_index, (centroid, member_count))| InterestCluster {
                cluster_index,
                centroid,
                member_count,
                updated_at,
            })
            .collect();

        self.clusters
            .replace_clusters(user_id, &clusters)
            .await
            .map_err(ClusterUpdateError::Store)?;
        debug!(user_id, k, cluster_counts = ?counts, "updated interest clusters");
        Ok(clusters.len())
    }
}
