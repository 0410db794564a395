//! Serving path: precomputed lists when fresh, on-demand generation otherwise.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::generator::{CandidateGenerator, GenerateError};
use crate::model::{ItemRecord, PrecomputedRecommendation, ScoredCandidate};
use crate::store::{
    ExclusionStore, ItemRecordFetcher, PrecomputedStore, RegenerationStatusStore, StoreError,
    StoreResult,
};

/// Serving configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendConfig {
    /// Precomputed lists older than this are ignored.
    pub stale_threshold: Duration,
    /// Precomputed rows read before read-filtering; larger than any serving limit.
    pub fetch_limit: usize,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::hours(48),
            fetch_limit: 200,
        }
    }
}

/// A recommendation request that could not be served.
#[derive(Debug, Error)]
pub enum RecommendError {
    /// On-demand generation failed.
    #[error(transparent)]
    Generate(#[from] GenerateError),
    /// Item records could not be loaded.
    #[error("fetching item records: {0}")]
    Records(#[source] StoreError),
}

/// Answers "what should this user read next".
#[derive(Clone)]
pub struct Recommender {
    generator: CandidateGenerator,
    precomputed: Arc<dyn PrecomputedStore>,
    status: Arc<dyn RegenerationStatusStore>,
    exclusions: Arc<dyn ExclusionStore>,
    records: Arc<dyn ItemRecordFetcher>,
    clock: Arc<dyn Clock>,
    config: RecommendConfig,
}

impl Recommender {
    /// Wires the serving path.
    pub fn new(
        generator: CandidateGenerator,
        precomputed: Arc<dyn PrecomputedStore>,
        status: Arc<dyn RegenerationStatusStore>,
        exclusions: Arc<dyn ExclusionStore>,
        records: Arc<dyn ItemRecordFetcher>,
        clock: Arc<dyn Clock>,
        config: RecommendConfig,
    ) -> Self {
        Self {
            generator,
            precomputed,
            status,
            exclusions,
            records,
            clock,
            config,
        }
    }

    /// Up to `limit` item records for `user_id`, best first.
    pub async fn recommend_for(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ItemRecord>, RecommendError> {
        let scored = match self.fresh_precomputed(user_id, limit).await {
            Ok(Some(hit)) if !hit.is_empty() => {
                debug!(user_id, count = hit.len(), "serving precomputed recommendations");
                hit
            }
            Ok(_) => self.generate_on_demand(user_id, limit).await?,
            Err(err) => {
                warn!(user_id, error = %err, "failed to read precomputed recommendations, generating on demand");
                self.generate_on_demand(user_id, limit).await?
            }
        };
        if scored.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = scored.iter().map(|c| c.item_id.clone()).collect();
        let records = self
            .records
            .fetch_records(&ids)
            .await
            .map_err(RecommendError::Records)?;
        Ok(order_records(&ids, records))
    }

    /// `None` when no list exists or it is stale.
    async fn fresh_precomputed(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StoreResult<Option<Vec<ScoredCandidate>>> {
        let Some(generated_at) = self.precomputed.generated_at(user_id).await? else {
            return Ok(None);
        };
        let age = self.clock.now() - generated_at;
        if age > self.config.stale_threshold {
            debug!(user_id, %generated_at, age_secs = age.num_seconds(), "precomputed recommendations are stale");
            return Ok(None);
        }

        let rows = self
            .precomputed
            .precomputed(user_id, self.config.fetch_limit)
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let read = self.read_items(user_id).await;
        Ok(Some(
            rows.into_iter()
                .filter(|row| !read.contains(&row.item_id))
                .take(limit)
                .map(PrecomputedRecommendation::into_candidate)
                .collect(),
        ))
    }

    async fn read_items(&self, user_id: &str) -> HashSet<String> {
        self.exclusions
            .list_excluded(user_id)
            .await
            .unwrap_or_else(|err| {
                warn!(user_id, error = %err, "failed to list read items");
                HashSet::new()
            })
    }

    async fn generate_on_demand(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ScoredCandidate>, GenerateError> {
        let signals_through = self.clock.now();
        let scored = self.generator.generate(user_id, limit).await?;
        if !scored.is_empty() {
            self.cache(user_id, &scored, signals_through).await;
        }
        Ok(scored)
    }

    async fn cache(&self, user_id: &str, scored: &[ScoredCandidate], signals_through: DateTime<Utc>) {
        let generated_at = self.clock.now();
        let rows = PrecomputedRecommendation::from_ranked(user_id, scored, generated_at);
        if let Err(err) = self.precomputed.replace_precomputed(user_id, &rows).await {
            warn!(user_id, error = %err, "failed to cache on-demand recommendations");
            return;
        }
        if let Err(err) = self
            .status
            .mark_regenerated(user_id, generated_at, signals_through)
            .await
        {
            warn!(user_id, error = %err, "failed to mark user as regenerated");
        }
        debug!(user_id, count = rows.len(), "stored on-demand recommendations");
    }
}

/// Arranges `records` in `ids` order, dropping ids with no record.
fn order_records(ids: &[String], records: Vec<ItemRecord>) -> Vec<ItemRecord> {
    let mut by_id: HashMap<String, ItemRecord> = records
        .into_iter()
        .map(|record| (record.item_id.clone(), record))
        .collect();
    ids.iter().filter_map(|id| by_id.remove(id)).collect()
}
