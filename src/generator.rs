//! Candidate generation from a user's rating signals.
//!
//! Queries the similarity index once per interest cluster centroid and once
//! for the temporally weighted positive vector, penalizes hits when the user
//! has negative ratings, then merges, filters and ranks the result.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::model::{CandidateSource, InterestCluster, RatedItemVector, RatingKind, ScoredCandidate};
use crate::store::{
    ClusterStore, ExclusionStore, RatingStore, SimilaritySearch, StoreError, StoreResult,
};
use crate::temporal::weighted_average;
use crate::vector_math::average;

/// Tuning knobs for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateConfig {
    /// Days after which a rating counts half.
    pub temporal_half_life_days: f64,
    /// Strength of the thumbs-down penalty, in `[0, 1]`.
    pub negative_signal_weight: f64,
    /// Query by interest cluster centroids as well.
    pub use_interest_clusters: bool,
    /// Hits requested per centroid; the temporal query asks for twice this.
    pub candidates_per_cluster: usize,
    /// Deadline for each similarity query.
    #[serde(with = "duration_secs")]
    pub search_timeout: Duration,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            temporal_half_life_days: 90.0,
            negative_signal_weight: 0.3,
            use_interest_clusters: true,
            candidates_per_cluster: 20,
            search_timeout: Duration::from_secs(10),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Failure that aborts a generation call.
#[derive(Debug, Error)]
pub enum GenerateError {
    /// Positive ratings could not be read; nothing can be generated without them.
    #[error("fetching positive ratings for {user_id}: {source}")]
    PositiveSignals {
        /// Affected user.
        user_id: String,
        /// Underlying store failure.
        #[source]
        source: StoreError,
    },
    /// Liked-item vectors disagree on dimensionality.
    #[error("liked item {item_id} of {user_id} has {actual} dimensions, expected {expected}")]
    Dimension {
        /// Affected user.
        user_id: String,
        /// Offending item.
        item_id: String,
        /// Width of the first liked vector.
        expected: usize,
        /// Width of the offending vector.
        actual: usize,
    },
}

/// Produces ranked candidates for one user.
#[derive(Clone)]
pub struct CandidateGenerator {
    search: Arc<dyn SimilaritySearch>,
    ratings: Arc<dyn RatingStore>,
    clusters: Arc<dyn ClusterStore>,
    exclusions: Arc<dyn ExclusionStore>,
    clock: Arc<dyn Clock>,
    config: GenerateConfig,
}

impl CandidateGenerator {
    /// Wires the generator to its collaborators.
    pub fn new(
        search: Arc<dyn SimilaritySearch>,
        ratings: Arc<dyn RatingStore>,
        clusters: Arc<dyn ClusterStore>,
        exclusions: Arc<dyn ExclusionStore>,
        clock: Arc<dyn Clock>,
        config: GenerateConfig,
    ) -> Self {
        Self {
            search,
            ratings,
            clusters,
            exclusions,
            clock,
            config,
        }
    }

    /// Configuration used by [`generate`](Self::generate).
    pub fn config(&self) -> &GenerateConfig {
        &self.config
    }

    /// Up to `limit` candidates, best first, using the stored configuration.
    pub async fn generate(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ScoredCandidate>, GenerateError> {
        self.generate_with(user_id, limit, &self.config).await
    }

    /// Same as [`generate`](Self::generate) with an explicit configuration.
    pub async fn generate_with(
        &self,
        user_id: &str,
        limit: usize,
        config: &GenerateConfig,
    ) -> Result<Vec<ScoredCandidate>, GenerateError> {
        let excluded = self.excluded(user_id).await;

        let positives = self
            .ratings
            .rated_vectors(user_id, RatingKind::Positive)
            .await
            .map_err(|source| GenerateError::PositiveSignals {
                user_id: user_id.to_string(),
                source,
            })?;
        let Some(first) = positives.first() else {
            debug!(user_id, "no positive ratings, nothing to generate");
            return Ok(Vec::new());
        };
        let dims = first.vector.len();
        if let Some(bad) = RatedItemVector::first_mismatch(&positives, dims) {
            return Err(GenerateError::Dimension {
                user_id: user_id.to_string(),
                item_id: bad.item_id.clone(),
                expected: dims,
                actual: bad.vector.len(),
            });
        }

        let negative = self.negative_vector(user_id, dims, config).await;
        let penalty = negative.map(|_| config.negative_signal_weight);

        let (from_clusters, from_temporal) = tokio::join!(
            self.cluster_candidates(user_id, config, penalty),
            self.temporal_candidates(user_id, &positives, config, penalty),
        );

        let mut candidates = from_clusters;
        candidates.extend(from_temporal);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let ranked = rank_candidates(candidates, &excluded, limit);
        debug!(user_id, returned = ranked.len(), "candidates generated");
        Ok(ranked)
    }

    async fn excluded(&self, user_id: &str) -> HashSet<String> {
        match self.exclusions.list_excluded(user_id).await {
            Ok(set) => set,
            Err(err) => {
                warn!(user_id, error = %err, "failed to list read items");
                HashSet::new()
            }
        }
    }

    async fn negative_vector(
        &self,
        user_id: &str,
        dims: usize,
        config: &GenerateConfig,
    ) -> Option<Vec<f32>> {
        if config.negative_signal_weight <= 0.0 {
            return None;
        }
        match self
            .ratings
            .rated_vectors(user_id, RatingKind::Negative)
            .await
        {
            Ok(negatives) => {
                let vectors: Vec<&[f32]> = negatives
                    .iter()
                    .map(|r| r.vector.as_slice())
                    .filter(|vector| vector.len() == dims)
                    .collect();
                if vectors.len() < negatives.len() {
                    warn!(
                        user_id,
                        dropped = negatives.len() - vectors.len(),
                        dims,
                        "ignoring negative ratings with mismatched dimensions"
                    );
                }
                average(&vectors)
            }
            Err(err) => {
                warn!(user_id, error = %err, "failed to fetch negative ratings");
                None
            }
        }
    }

    async fn cluster_candidates(
        &self,
        user_id: &str,
        config: &GenerateConfig,
        penalty: Option<f64>,
    ) -> Vec<ScoredCandidate> {
        if !config.use_interest_clusters {
            return Vec::new();
        }
        let clusters: Vec<InterestCluster> = match self.clusters.clusters(user_id).await {
            Ok(clusters) => clusters,
            Err(err) => {
                warn!(user_id, error = %err, "failed to fetch interest clusters");
                return Vec::new();
            }
        };
        if clusters.is_empty() {
            return Vec::new();
        }

        let queries = clusters.iter().map(|cluster| {
            self.query(
                &cluster.centroid,
                CandidateSource::Cluster(cluster.cluster_index),
                config.candidates_per_cluster,
                config.search_timeout,
                penalty,
            )
        });
        let mut out = Vec::new();
        for result in join_all(queries).await {
            match result {
                Ok(hits) => out.extend(hits),
                Err(err) => {
                    // one failed centroid drops the whole cluster source
                    warn!(user_id, error = %err, "cluster similarity search failed");
                    return Vec::new();
                }
            }
        }
        out
    }

    async fn temporal_candidates(
        &self,
        user_id: &str,
        positives: &[RatedItemVector],
        config: &GenerateConfig,
        penalty: Option<f64>,
    ) -> Vec<ScoredCandidate> {
        let timestamped: Vec<_> = positives.iter().map(RatedItemVector::timestamped).collect();
        let Some(query) = weighted_average(
            &timestamped,
            config.temporal_half_life_days,
            self.clock.now(),
        ) else {
            return Vec::new();
        };
        let limit = config.candidates_per_cluster.saturating_mul(2);
        match self
            .query(
                &query,
                CandidateSource::Temporal,
                limit,
                config.search_timeout,
                penalty,
            )
            .await
        {
            Ok(hits) => hits,
            Err(err) => {
                warn!(user_id, error = %err, "temporal similarity search failed");
                Vec::new()
            }
        }
    }

    async fn query(
        &self,
        vector: &[f32],
        source: CandidateSource,
        limit: usize,
        deadline: Duration,
        penalty: Option<f64>,
    ) -> StoreResult<Vec<ScoredCandidate>> {
        let hits = tokio::time::timeout(deadline, self.search.search(&[], vector, limit))
            .await
            .map_err(|_| StoreError::Timeout(deadline))??;
        Ok(hits
            .into_iter()
            .map(|hit| ScoredCandidate {
                item_id: hit.item_id,
                score: apply_penalty(hit.score, penalty),
                source,
            })
            .collect())
    }
}

/// Lowers `score` by `weight * score * 0.5` when a negative signal exists.
pub fn apply_penalty(score: f64, weight: Option<f64>) -> f64 {
    match weight {
        Some(weight) => score - weight * score * 0.5,
        None => score,
    }
}

/// Deduplicates by item keeping the best score, drops `excluded` items,
/// sorts best first and keeps `limit`.
pub fn rank_candidates(
    candidates: Vec<ScoredCandidate>,
    excluded: &HashSet<String>,
    limit: usize,
) -> Vec<ScoredCandidate> {
    let mut best: HashMap<String, ScoredCandidate> = HashMap::new();
    for candidate in candidates {
        if excluded.contains(&candidate.item_id) {
            continue;
        }
        match best.get(&candidate.item_id) {
            Some(existing) if existing.score >= candidate.score => {}
            _ => {
                best.insert(candidate.item_id.clone(), candidate);
            }
        }
    }
    let mut ranked: Vec<ScoredCandidate> = best.into_values().collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked.truncate(limit);
    ranked
}
