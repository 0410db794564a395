//! Domain records shared by the generator, the serving path and the stores.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::temporal::TimestampedVector;

/// Direction of a user's rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingKind {
    /// Thumbs up.
    Positive,
    /// Thumbs down.
    Negative,
}

/// Thumbs-up/down state of one (user, item) pair.
///
/// Both flags false clears the rating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingState {
    /// User liked the item.
    pub thumbs_up: bool,
    /// User disliked the item.
    pub thumbs_down: bool,
}

impl RatingState {
    /// A thumbs-up rating.
    pub fn up() -> Self {
        Self {
            thumbs_up: true,
            thumbs_down: false,
        }
    }

    /// A thumbs-down rating.
    pub fn down() -> Self {
        Self {
            thumbs_up: false,
            thumbs_down: true,
        }
    }

    /// No rating.
    pub fn cleared() -> Self {
        Self::default()
    }

    /// Rating kinds this state records a vector under.
    pub fn kinds(&self) -> impl Iterator<Item = RatingKind> {
        let up = self.thumbs_up.then_some(RatingKind::Positive);
        let down = self.thumbs_down.then_some(RatingKind::Negative);
        up.into_iter().chain(down)
    }
}

/// A rated item's embedding, as stored for the rating user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatedItemVector {
    /// Rated item.
    pub item_id: String,
    /// Item embedding at rating time.
    pub vector: Vec<f32>,
    /// Positive or negative.
    pub kind: RatingKind,
    /// When the rating was last set.
    pub rated_at: DateTime<Utc>,
}

impl RatedItemVector {
    /// View used by temporal weighting.
    pub fn timestamped(&self) -> TimestampedVector {
        TimestampedVector::new(self.vector.clone(), self.rated_at)
    }

    /// First entry whose width differs from `expected`.
    pub fn first_mismatch(rated: &[RatedItemVector], expected: usize) -> Option<&RatedItemVector> {
        rated.iter().find(|r| r.vector.len() != expected)
    }
}

/// One of a user's interest clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterestCluster {
    /// Index the clustering run assigned.
    pub cluster_index: usize,
    /// Mean of the member vectors.
    pub centroid: Vec<f32>,
    /// Number of liked items in the cluster.
    pub member_count: usize,
    /// When the clustering run finished.
    pub updated_at: DateTime<Utc>,
}

/// Running sum of the item vectors currently folded into a user's profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateVector {
    /// Owning user.
    pub user_id: String,
    /// Elementwise sum of contributing vectors.
    pub vector_sum: Vec<f32>,
    /// Number of contributing items.
    pub count: u64,
}

/// Where a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateSource {
    /// Query by the centroid of the interest cluster with this index.
    Cluster(usize),
    /// Query by the temporally weighted positive vector.
    Temporal,
}

impl fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateSource::Cluster(index) => write!(f, "cluster_{index}"),
            CandidateSource::Temporal => f.write_str("temporal"),
        }
    }
}

/// Unrecognised source tag.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown candidate source tag `{0}`")]
pub struct ParseSourceError(pub String);

impl FromStr for CandidateSource {
    type Err = ParseSourceError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        if tag == "temporal" {
            return Ok(CandidateSource::Temporal);
        }
        tag.strip_prefix("cluster_")
            .and_then(|index| index.parse().ok())
            .map(CandidateSource::Cluster)
            .ok_or_else(|| ParseSourceError(tag.to_string()))
    }
}

impl Serialize for CandidateSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CandidateSource {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        tag.parse().map_err(serde::de::Error::custom)
    }
}

/// A candidate item scored within one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    /// Candidate item.
    pub item_id: String,
    /// Similarity score after penalties.
    pub score: f64,
    /// Query strategy that produced the hit.
    pub source: CandidateSource,
}

/// A row of a user's cached recommendation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecomputedRecommendation {
    /// Owning user.
    pub user_id: String,
    /// Recommended item.
    pub item_id: String,
    /// Score at generation time.
    pub score: f64,
    /// Query strategy that produced the hit.
    pub source: CandidateSource,
    /// Zero-based rank.
    pub position: usize,
    /// When the list was generated.
    pub generated_at: DateTime<Utc>,
}

impl PrecomputedRecommendation {
    /// Numbers `candidates` by position for storage.
    pub fn from_ranked(
        user_id: &str,
        candidates: &[ScoredCandidate],
        generated_at: DateTime<Utc>,
    ) -> Vec<Self> {
        candidates
            .iter()
            .enumerate()
            .map(|(position, candidate)| Self {
                user_id: user_id.to_string(),
                item_id: candidate.item_id.clone(),
                score: candidate.score,
                source: candidate.source,
                position,
                generated_at,
            })
            .collect()
    }

    /// Back into the ephemeral candidate shape.
    pub fn into_candidate(self) -> ScoredCandidate {
        ScoredCandidate {
            item_id: self.item_id,
            score: self.score,
            source: self.source,
        }
    }
}

/// Trigger/ack record between rating changes and regeneration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegenerationStatus {
    /// Owning user.
    pub user_id: String,
    /// Last successful regeneration.
    pub last_generated_at: Option<DateTime<Utc>>,
    /// Last rating change.
    pub last_signal_at: Option<DateTime<Utc>>,
    /// Set on rating change, cleared by regeneration.
    pub needs_regeneration: bool,
}

impl RegenerationStatus {
    /// Status of a user nobody has touched yet.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            last_generated_at: None,
            last_signal_at: None,
            needs_regeneration: false,
        }
    }

    /// Records a rating change.
    pub fn record_signal(&mut self, at: DateTime<Utc>) {
        self.last_signal_at = Some(self.last_signal_at.map_or(at, |prev| prev.max(at)));
        self.needs_regeneration = true;
    }

    /// Records a finished regeneration that read signals up to
    /// `signals_through`. The flag stays set when a newer signal arrived
    /// while the regeneration ran.
    pub fn record_regenerated(&mut self, generated_at: DateTime<Utc>, signals_through: DateTime<Utc>) {
        self.last_generated_at = Some(generated_at);
        let newer_signal = self
            .last_signal_at
            .map_or(false, |signal| signal > signals_through);
        self.needs_regeneration = newer_signal;
    }
}

/// Full content record returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Stable item identifier.
    pub item_id: String,
    /// Headline.
    pub title: String,
    /// Canonical URL.
    pub link: String,
    /// Opening text excerpt.
    pub text_start: String,
    /// Comma separated author list.
    pub authors: String,
    /// Publication time.
    pub published: DateTime<Utc>,
}
