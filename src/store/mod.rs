//! Collaborator contracts the recommendation core depends on.
//!
//! Everything the generator, serving path and batch driver read or write
//! goes through these traits. [`memory::MemoryStore`] implements all of them
//! in-process; [`postgres::PgStore`] backs them with Postgres and pgvector.
//!
//! Per-user mutations (`add_contribution`, `remove_contribution`,
//! `replace_clusters`, `replace_precomputed`, `set_rating`, the status
//! markers) each run as one atomic unit scoped to a single user.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{
    AggregateVector, InterestCluster, ItemRecord, PrecomputedRecommendation, RatedItemVector,
    RatingKind, RatingState, RegenerationStatus,
};
use crate::vector_math::VectorError;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, SchemaName};

/// Failures reported by a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Postgres driver error.
    #[error("postgres: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    /// Vector arithmetic inside a store operation failed.
    #[error(transparent)]
    Vector(#[from] VectorError),
    /// A call did not finish within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Stored data could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
    /// A schema or table identifier was rejected.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    /// The backend refused or could not serve the call.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Shorthand for store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// One nearest-neighbour hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarItem {
    /// Matching item.
    pub item_id: String,
    /// Similarity, higher is closer.
    pub score: f64,
}

impl SimilarItem {
    /// Builds a hit.
    pub fn new(item_id: impl Into<String>, score: f64) -> Self {
        Self {
            item_id: item_id.into(),
            score,
        }
    }
}

/// Nearest-neighbour lookup over item embeddings.
#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    /// Up to `limit` items closest to `query`, best first, skipping `exclude`.
    async fn search(
        &self,
        exclude: &[String],
        query: &[f32],
        limit: usize,
    ) -> StoreResult<Vec<SimilarItem>>;
}

/// Per-item embedding lookup.
#[async_trait]
pub trait ItemVectorFetcher: Send + Sync {
    /// The item's embedding, or `None` when the item has none.
    async fn fetch_item_vector(&self, item_id: &str) -> StoreResult<Option<Vec<f32>>>;
}

/// Hydrates item ids into full records.
#[async_trait]
pub trait ItemRecordFetcher: Send + Sync {
    /// Records for the ids that exist, in any order.
    async fn fetch_records(&self, ids: &[String]) -> StoreResult<Vec<ItemRecord>>;
}

/// Items a user must not be recommended (already read).
#[async_trait]
pub trait ExclusionStore: Send + Sync {
    /// The user's exclusion set.
    async fn list_excluded(&self, user_id: &str) -> StoreResult<HashSet<String>>;

    /// Adds or removes `item_id` from the exclusion set.
    async fn set_read(&self, user_id: &str, item_id: &str, read: bool) -> StoreResult<()>;
}

/// Stored rating vectors.
#[async_trait]
pub trait RatingStore: Send + Sync {
    /// The user's rated vectors of one kind. Ratings without a vector are skipped.
    async fn rated_vectors(
        &self,
        user_id: &str,
        kind: RatingKind,
    ) -> StoreResult<Vec<RatedItemVector>>;

    /// Replaces the user's rating for `item_id`.
    async fn set_rating(
        &self,
        user_id: &str,
        item_id: &str,
        state: RatingState,
        vector: Option<&[f32]>,
        rated_at: DateTime<Utc>,
    ) -> StoreResult<()>;
}

/// A user's interest clusters.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Stored clusters ordered by index.
    async fn clusters(&self, user_id: &str) -> StoreResult<Vec<InterestCluster>>;

    /// Deletes every stored cluster and inserts `clusters` in one step.
    async fn replace_clusters(
        &self,
        user_id: &str,
        clusters: &[InterestCluster],
    ) -> StoreResult<()>;
}

/// Running per-user vector sum with per-item contribution flags.
#[async_trait]
pub trait AggregateVectorStore: Send + Sync {
    /// Folds `vector` into the sum unless `item_id` already contributes.
    /// Returns whether anything changed.
    async fn add_contribution(
        &self,
        user_id: &str,
        item_id: &str,
        vector: &[f32],
    ) -> StoreResult<bool>;

    /// Takes `item_id` out of the sum if it contributes. Without a vector
    /// only the flag and count change. Returns whether anything changed.
    async fn remove_contribution(
        &self,
        user_id: &str,
        item_id: &str,
        vector: Option<&[f32]>,
    ) -> StoreResult<bool>;

    /// Current aggregate, `None` before the first contribution.
    async fn aggregate(&self, user_id: &str) -> StoreResult<Option<AggregateVector>>;
}

/// Cached recommendation lists.
#[async_trait]
pub trait PrecomputedStore: Send + Sync {
    /// When the user's current list was generated, if there is one.
    async fn generated_at(&self, user_id: &str) -> StoreResult<Option<DateTime<Utc>>>;

    /// Up to `limit` rows ordered by position.
    async fn precomputed(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<PrecomputedRecommendation>>;

    /// Deletes the user's list and inserts `rows` in one step. An empty
    /// `rows` leaves the user with no list.
    async fn replace_precomputed(
        &self,
        user_id: &str,
        rows: &[PrecomputedRecommendation],
    ) -> StoreResult<()>;
}

/// Regeneration trigger/ack bookkeeping.
#[async_trait]
pub trait RegenerationStatusStore: Send + Sync {
    /// Users whose flag is set.
    async fn users_needing_regeneration(&self) -> StoreResult<Vec<String>>;

    /// Sets the flag and records the signal time.
    async fn mark_needs_regeneration(&self, user_id: &str, at: DateTime<Utc>) -> StoreResult<()>;

    /// Records a regeneration and clears the flag unless a signal newer than
    /// `signals_through` arrived meanwhile.
    async fn mark_regenerated(
        &self,
        user_id: &str,
        generated_at: DateTime<Utc>,
        signals_through: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Current status row, if any.
    async fn status(&self, user_id: &str) -> StoreResult<Option<RegenerationStatus>>;
}
