//! Command-line and environment configuration shared by the binaries.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tracing_subscriber::{fmt, EnvFilter};

use crate::batch::{BatchConfig, BatchRegenerator};
use crate::clock::Clock;
use crate::clustering::ClusterConfig;
use crate::clusters::ClusterUpdater;
use crate::generator::{CandidateGenerator, GenerateConfig};
use crate::orchestrator::{RecommendConfig, Recommender};
use crate::rating::RatingService;
use crate::store::{
    AggregateVectorStore, ClusterStore, ExclusionStore, ItemRecordFetcher, ItemVectorFetcher,
    PgStore, PrecomputedStore, RatingStore, RegenerationStatusStore, SchemaName,
    SimilaritySearch,
};

/// Postgres connection settings.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Postgres connection string (postgres://...)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Schema holding the recommender tables
    #[arg(long, env = "FEEDREC_SCHEMA", default_value = "public")]
    pub schema: String,

    /// Connections in the per-user pool
    #[arg(long, env = "FEEDREC_CONNECTIONS", default_value_t = 4)]
    pub connections: usize,
}

impl StoreArgs {
    /// Opens the Postgres store.
    pub async fn connect(&self) -> Result<PgStore> {
        let schema = SchemaName::new(self.schema.clone())?;
        PgStore::connect(&self.database_url, schema, self.connections)
            .await
            .with_context(|| format!("failed to connect to Postgres at {}", self.database_url))
    }
}

/// Recommendation tuning knobs.
#[derive(Args, Debug, Clone)]
pub struct TuningArgs {
    /// Days after which a rating carries half its weight
    #[arg(long, env = "FEEDREC_HALF_LIFE_DAYS", default_value_t = 90.0)]
    pub half_life_days: f64,

    /// Thumbs-down penalty strength between 0 and 1
    #[arg(long, env = "FEEDREC_NEGATIVE_WEIGHT", default_value_t = 0.3)]
    pub negative_weight: f64,

    /// Query by interest cluster centroids
    #[arg(long, env = "FEEDREC_USE_CLUSTERS", default_value_t = true, action = clap::ArgAction::Set)]
    pub use_clusters: bool,

    /// Candidates requested per cluster centroid
    #[arg(long, env = "FEEDREC_CANDIDATES_PER_CLUSTER", default_value_t = 20)]
    pub candidates_per_cluster: usize,

    /// Seconds allowed for each similarity query
    #[arg(long, env = "FEEDREC_SEARCH_TIMEOUT_SECS", default_value_t = 10)]
    pub search_timeout_secs: u64,

    /// Hours before a precomputed list counts as stale
    #[arg(long, env = "FEEDREC_STALE_HOURS", default_value_t = 48)]
    pub stale_hours: i64,

    /// Precomputed rows read before filtering out read items
    #[arg(long, env = "FEEDREC_FETCH_LIMIT", default_value_t = 200)]
    pub fetch_limit: usize,

    /// Interest clusters per user
    #[arg(long, env = "FEEDREC_NUM_CLUSTERS", default_value_t = 3)]
    pub num_clusters: usize,

    /// Liked items required before clustering
    #[arg(long, env = "FEEDREC_MIN_CLUSTER_ITEMS", default_value_t = 6)]
    pub min_cluster_items: usize,

    /// Maximum k-means iterations
    #[arg(long, env = "FEEDREC_MAX_ITERATIONS", default_value_t = 50)]
    pub max_iterations: usize,

    /// Centroid movement below which k-means stops
    #[arg(long, env = "FEEDREC_CONVERGENCE", default_value_t = 1e-4)]
    pub convergence_threshold: f64,

    /// Recommendations precomputed per user by the batch driver
    #[arg(long, env = "FEEDREC_CANDIDATE_LIMIT", default_value_t = 200)]
    pub candidate_limit: usize,

    /// Users regenerated concurrently
    #[arg(long, env = "FEEDREC_CONCURRENCY", default_value_t = 4)]
    pub concurrency: usize,

    /// Base seed for per-user clustering randomness
    #[arg(long, env = "FEEDREC_SEED", default_value_t = 0)]
    pub seed: u64,
}

impl Default for TuningArgs {
    fn default() -> Self {
        let generate = GenerateConfig::default();
        let recommend = RecommendConfig::default();
        let batch = BatchConfig::default();
        Self {
            half_life_days: generate.temporal_half_life_days,
            negative_weight: generate.negative_signal_weight,
            use_clusters: generate.use_interest_clusters,
            candidates_per_cluster: generate.candidates_per_cluster,
            search_timeout_secs: generate.search_timeout.as_secs(),
            stale_hours: recommend.stale_threshold.num_hours(),
            fetch_limit: recommend.fetch_limit,
            num_clusters: batch.clusters.num_clusters,
            min_cluster_items: batch.clusters.min_items_for_clustering,
            max_iterations: batch.clusters.max_iterations,
            convergence_threshold: batch.clusters.convergence_threshold,
            candidate_limit: batch.candidate_limit,
            concurrency: batch.concurrency,
            seed: batch.seed,
        }
    }
}

impl TuningArgs {
    /// Generation settings.
    pub fn build_generate_config(&self) -> Result<GenerateConfig> {
        anyhow::ensure!(
            self.half_life_days > 0.0,
            "half-life must be positive, got {}",
            self.half_life_days
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.negative_weight),
            "negative weight must be within [0, 1], got {}",
            self.negative_weight
        );
        anyhow::ensure!(
            self.candidates_per_cluster > 0,
            "candidates per cluster must be positive"
        );
        Ok(GenerateConfig {
            temporal_half_life_days: self.half_life_days,
            negative_signal_weight: self.negative_weight,
            use_interest_clusters: self.use_clusters,
            candidates_per_cluster: self.candidates_per_cluster,
            search_timeout: Duration::from_secs(self.search_timeout_secs.max(1)),
        })
    }

    /// Serving settings.
    pub fn build_recommend_config(&self) -> Result<RecommendConfig> {
        anyhow::ensure!(self.stale_hours >= 0, "stale threshold must not be negative");
        anyhow::ensure!(self.fetch_limit > 0, "fetch limit must be positive");
        Ok(RecommendConfig {
            stale_threshold: chrono::Duration::hours(self.stale_hours),
            fetch_limit: self.fetch_limit,
        })
    }

    /// Clustering settings.
    pub fn build_cluster_config(&self) -> Result<ClusterConfig> {
        anyhow::ensure!(self.num_clusters > 0, "cluster count must be positive");
        anyhow::ensure!(
            self.convergence_threshold >= 0.0,
            "convergence threshold must not be negative"
        );
        Ok(ClusterConfig {
            num_clusters: self.num_clusters,
            min_items_for_clustering: self.min_cluster_items,
            max_iterations: self.max_iterations,
            convergence_threshold: self.convergence_threshold,
        })
    }

    /// Batch driver settings.
    pub fn build_batch_config(&self) -> Result<BatchConfig> {
        anyhow::ensure!(self.candidate_limit > 0, "candidate limit must be positive");
        Ok(BatchConfig {
            candidate_limit: self.candidate_limit,
            concurrency: self.concurrency.max(1),
            seed: self.seed,
            clusters: self.build_cluster_config()?,
        })
    }

    /// Wires every service over one backing store.
    pub fn build_services<S>(&self, store: Arc<S>, clock: Arc<dyn Clock>) -> Result<Services>
    where
        S: SimilaritySearch
            + ItemVectorFetcher
            + ItemRecordFetcher
            + ExclusionStore
            + RatingStore
            + ClusterStore
            + AggregateVectorStore
            + PrecomputedStore
            + RegenerationStatusStore
            + 'static,
    {
        let generator = CandidateGenerator::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            clock.clone(),
            self.build_generate_config()?,
        );
        let clusters = ClusterUpdater::new(store.clone(), store.clone(), clock.clone());
        let recommender = Recommender::new(
            generator.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            clock.clone(),
            self.build_recommend_config()?,
        );
        let batch = BatchRegenerator::new(
            clusters.clone(),
            generator,
            store.clone(),
            store.clone(),
            clock.clone(),
            self.build_batch_config()?,
        );
        let ratings = RatingService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store,
            clock,
        );
        Ok(Services {
            recommender,
            batch,
            clusters,
            ratings,
        })
    }
}

/// Every entry point, wired over one store.
#[derive(Clone)]
pub struct Services {
    /// Serving path.
    pub recommender: Recommender,
    /// Batch regeneration driver.
    pub batch: BatchRegenerator,
    /// Cluster rebuilds.
    pub clusters: ClusterUpdater,
    /// Rating and read-state ingestion.
    pub ratings: RatingService,
}

/// Installs the stderr log subscriber. `RUST_LOG` applies when `verbose` is
/// zero; each `-v` raises the level from `info` up to `trace`.
pub fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::MemoryStore;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        tuning: TuningArgs,
    }

    #[test]
    fn parsed_defaults_match_struct_defaults() {
        let cli = TestCli::try_parse_from(["test"]).unwrap();
        let tuning = cli.tuning;
        assert_eq!(tuning.build_generate_config().unwrap(), GenerateConfig::default());
        assert_eq!(tuning.build_recommend_config().unwrap(), RecommendConfig::default());
        assert_eq!(tuning.build_batch_config().unwrap(), BatchConfig::default());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = TestCli::try_parse_from([
            "test",
            "--use-clusters",
            "false",
            "--negative-weight",
            "0",
            "--stale-hours",
            "6",
        ])
        .unwrap();
        let generate = cli.tuning.build_generate_config().unwrap();
        assert!(!generate.use_interest_clusters);
        assert_eq!(generate.negative_signal_weight, 0.0);
        assert_eq!(
            cli.tuning.build_recommend_config().unwrap().stale_threshold,
            chrono::Duration::hours(6)
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut tuning = TuningArgs::default();
        tuning.negative_weight = 1.5;
        assert!(tuning.build_generate_config().is_err());

        let mut tuning = TuningArgs::default();
        tuning.half_life_days = 0.0;
        assert!(tuning.build_generate_config().is_err());

        let mut tuning = TuningArgs::default();
        tuning.num_clusters = 0;
        assert!(tuning.build_batch_config().is_err());
    }

    #[test]
    fn services_wire_over_memory_store() {
        let store = Arc::new(MemoryStore::new());
        assert!(TuningArgs::default()
            .build_services(store, Arc::new(SystemClock))
            .is_ok());
    }
}
