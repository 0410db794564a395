//! Batch regeneration of clusters and precomputed lists for flagged users.
//!
//! Users are processed by a bounded pool of concurrent workers. A failure
//! for one user is logged and counted; the user keeps its flag and is picked
//! up again on the next run.

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::clustering::ClusterConfig;
use crate::clusters::{ClusterUpdateError, ClusterUpdater};
use crate::generator::{CandidateGenerator, GenerateError};
use crate::hashing::user_seed;
use crate::model::PrecomputedRecommendation;
use crate::store::{PrecomputedStore, RegenerationStatusStore, StoreError};

/// Batch driver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Recommendations precomputed per user.
    pub candidate_limit: usize,
    /// Users processed at once.
    pub concurrency: usize,
    /// Base seed; each user's clustering stream derives from it.
    pub seed: u64,
    /// Clustering parameters.
    pub clusters: ClusterConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            candidate_limit: 200,
            concurrency: 4,
            seed: 0,
            clusters: ClusterConfig::default(),
        }
    }
}

/// Outcome counts of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Users fully regenerated.
    pub success_count: usize,
    /// Users that failed and stay flagged.
    pub fail_count: usize,
}

/// The run could not start.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Flagged users could not be listed.
    #[error("listing users needing regeneration: {0}")]
    Listing(#[source] StoreError),
}

#[derive(Debug, Error)]
enum UserError {
    #[error("updating clusters: {0}")]
    Clusters(#[from] ClusterUpdateError),
    #[error("generating recommendations: {0}")]
    Generate(#[from] GenerateError),
    #[error("replacing precomputed recommendations: {0}")]
    Store(#[source] StoreError),
    #[error("marking user regenerated: {0}")]
    Status(#[source] StoreError),
}

/// Regenerates every user flagged as needing it.
#[derive(Clone)]
pub struct BatchRegenerator {
    updater: ClusterUpdater,
    generator: CandidateGenerator,
    precomputed: Arc<dyn PrecomputedStore>,
    status: Arc<dyn RegenerationStatusStore>,
    clock: Arc<dyn Clock>,
    config: BatchConfig,
}

impl BatchRegenerator {
    /// Wires the driver.
    pub fn new(
        updater: ClusterUpdater,
        generator: CandidateGenerator,
        precomputed: Arc<dyn PrecomputedStore>,
        status: Arc<dyn RegenerationStatusStore>,
        clock: Arc<dyn Clock>,
        config: BatchConfig,
    ) -> Self {
        Self {
            updater,
            generator,
            precomputed,
            status,
            clock,
            config,
        }
    }

    /// Processes all flagged users once.
    pub async fn run(&self) -> Result<BatchReport, BatchError> {
        let users = self
            .status
            .users_needing_regeneration()
            .await
            .map_err(BatchError::Listing)?;
        if users.is_empty() {
            info!("no users need recommendation regeneration");
            return Ok(BatchReport::default());
        }
        info!(user_count = users.len(), "starting recommendation regeneration");

        let concurrency = self.config.concurrency.max(1);
        let outcomes: Vec<bool> = stream::iter(users)
            .map(|user_id| async move {
                match self.regenerate_user(&user_id).await {
                    Ok(count) => {
                        debug!(user_id = %user_id, count, "stored recommendations for user");
                        true
                    }
                    Err(err) => {
                        error!(user_id = %user_id, error = %err, "failed to regenerate user");
                        false
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let success_count = outcomes.iter().filter(|&&ok| ok).count();
        let report = BatchReport {
            success_count,
            fail_count: outcomes.len() - success_count,
        };
        info!(
            success_count = report.success_count,
            fail_count = report.fail_count,
            "recommendation regeneration complete"
        );
        Ok(report)
    }

    async fn regenerate_user(&self, user_id: &str) -> Result<usize, UserError> {
        let signals_through = self.clock.now();
        let mut rng = ChaCha8Rng::seed_from_u64(user_seed(self.config.seed, user_id));
        self.updater
            .update_clusters(user_id, &self.config.clusters, &mut rng)
            .await?;

        let scored = self
            .generator
            .generate(user_id, self.config.candidate_limit)
            .await?;
        let generated_at = self.clock.now();
        let rows = PrecomputedRecommendation::from_ranked(user_id, &scored, generated_at);
        self.precomputed
            .replace_precomputed(user_id, &rows)
            .await
            .map_err(UserError::Store)?;
        self.status
            .mark_regenerated(user_id, generated_at, signals_through)
            .await
            .map_err(UserError::Status)?;
        Ok(rows.len())
    }
}
