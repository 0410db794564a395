#![warn(missing_docs)]
//! Core library for feedrec, a multi-interest article recommender.
//!
//! Ratings feed per-user interest clusters and a temporally weighted taste
//! vector; both drive similarity queries whose hits are penalized by
//! thumbs-down signals, ranked, and cached as precomputed lists that the
//! serving path prefers while they are fresh.

pub mod batch;
pub mod clock;
pub mod clustering;
pub mod clusters;
pub mod config;
pub mod generator;
mod hashing;
pub mod model;
pub mod orchestrator;
pub mod rating;
pub mod store;
pub mod temporal;
pub mod vector_math;

pub use batch::{BatchConfig, BatchError, BatchRegenerator, BatchReport};
pub use clock::{Clock, FixedClock, SystemClock};
pub use clustering::{count_assignments, kmeans, ClusterConfig, ClusterResult};
pub use clusters::{ClusterUpdateError, ClusterUpdater};
pub use config::{init_logging, Services, StoreArgs, TuningArgs};
pub use generator::{CandidateGenerator, GenerateConfig, GenerateError};
pub use hashing::user_seed;
pub use model::{
    AggregateVector, CandidateSource, InterestCluster, ItemRecord, PrecomputedRecommendation,
    RatedItemVector, RatingKind, RatingState, RegenerationStatus, ScoredCandidate,
};
pub use orchestrator::{RecommendConfig, RecommendError, Recommender};
pub use rating::{RatingError, RatingService};
pub use store::{MemoryStore, PgStore, SchemaName, SimilarItem, StoreError, StoreResult};
pub use vector_math::VectorError;
