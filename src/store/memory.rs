//! In-process backend implementing every store contract.
//!
//! Each user's state sits behind its own async mutex; the outer map lock is
//! held only long enough to find (or create) that slot, so users never wait
//! on each other. The item catalog answers similarity queries by brute-force
//! cosine scan.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use super::{
    AggregateVectorStore, ClusterStore, ExclusionStore, ItemRecordFetcher, ItemVectorFetcher,
    PrecomputedStore, RatingStore, RegenerationStatusStore, SimilarItem, SimilaritySearch,
    StoreResult,
};
use crate::model::{
    AggregateVector, InterestCluster, ItemRecord, PrecomputedRecommendation, RatedItemVector,
    RatingKind, RatingState, RegenerationStatus,
};
use crate::vector_math::{add_into, cosine_similarity, subtract_from};

#[derive(Debug, Clone)]
struct StoredRating {
    state: RatingState,
    vector: Option<Vec<f32>>,
    rated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct UserState {
    ratings: HashMap<String, StoredRating>,
    read: HashSet<String>,
    vector_sum: Option<Vec<f32>>,
    vector_count: u64,
    contributions: HashSet<String>,
    clusters: Vec<InterestCluster>,
    precomputed: Vec<PrecomputedRecommendation>,
    status: Option<RegenerationStatus>,
}

#[derive(Debug, Clone)]
struct CatalogItem {
    record: ItemRecord,
    vector: Option<Vec<f32>>,
}

/// Memory-resident implementation of all store traits.
#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<String, Arc<Mutex<UserState>>>>,
    items: RwLock<HashMap<String, CatalogItem>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a catalog item.
    pub async fn insert_item(&self, record: ItemRecord, vector: Option<Vec<f32>>) {
        let mut items = self.items.write().await;
        items.insert(record.item_id.clone(), CatalogItem { record, vector });
    }

    /// Removes a catalog item entirely.
    pub async fn remove_item(&self, item_id: &str) -> bool {
        self.items.write().await.remove(item_id).is_some()
    }

    async fn user(&self, user_id: &str) -> Arc<Mutex<UserState>> {
        let mut users = self.users.lock().await;
        Arc::clone(users.entry(user_id.to_string()).or_default())
    }

    /// Slot for a user that has written something; reads never create one.
    async fn existing_user(&self, user_id: &str) -> Option<Arc<Mutex<UserState>>> {
        self.users.lock().await.get(user_id).cloned()
    }

    async fn all_users(&self) -> Vec<(String, Arc<Mutex<UserState>>)> {
        let users = self.users.lock().await;
        users
            .iter()
            .map(|(id, state)| (id.clone(), Arc::clone(state)))
            .collect()
    }
}

#[async_trait]
impl SimilaritySearch for MemoryStore {
    async fn search(
        &self,
        exclude: &[String],
        query: &[f32],
        limit: usize,
    ) -> StoreResult<Vec<SimilarItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let items = self.items.read().await;
        let mut hits: Vec<SimilarItem> = items
            .values()
            .filter(|item| !exclude.contains(&item.record.item_id))
            .filter_map(|item| {
                let vector = item.vector.as_ref()?;
                if vector.len() != query.len() {
                    return None;
                }
                Some(SimilarItem::new(
                    item.record.item_id.clone(),
                    cosine_similarity(query, vector),
                ))
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

#[async_trait]
impl ItemVectorFetcher for MemoryStore {
    async fn fetch_item_vector(&self, item_id: &str) -> StoreResult<Option<Vec<f32>>> {
        let items = self.items.read().await;
        Ok(items.get(item_id).and_then(|item| item.vector.clone()))
    }
}

#[async_trait]
impl ItemRecordFetcher for MemoryStore {
    async fn fetch_records(&self, ids: &[String]) -> StoreResult<Vec<ItemRecord>> {
        let items = self.items.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| items.get(id).map(|item| item.record.clone()))
            .collect())
    }
}

#[async_trait]
impl ExclusionStore for MemoryStore {
    async fn list_excluded(&self, user_id: &str) -> StoreResult<HashSet<String>> {
        let Some(user) = self.existing_user(user_id).await else {
            return Ok(HashSet::new());
        };
        let state = user.lock().await;
        Ok(state.read.clone())
    }

    async fn set_read(&self, user_id: &str, item_id: &str, read: bool) -> StoreResult<()> {
        let user = self.user(user_id).await;
        let mut state = user.lock().await;
        if read {
            state.read.insert(item_id.to_string());
        } else {
            state.read.remove(item_id);
        }
        Ok(())
    }
}

#[async_trait]
impl RatingStore for MemoryStore {
    async fn rated_vectors(
        &self,
        user_id: &str,
        kind: RatingKind,
    ) -> StoreResult<Vec<RatedItemVector>> {
        let Some(user) = self.existing_user(user_id).await else {
            return Ok(Vec::new());
        };
        let state = user.lock().await;
        let mut out: Vec<RatedItemVector> = state
            .ratings
            .iter()
            .filter(|(_, rating)| rating.state.kinds().any(|k| k == kind))
            .filter_map(|(item_id, rating)| {
                Some(RatedItemVector {
                    item_id: item_id.clone(),
                    vector: rating.vector.clone()?,
                    kind,
                    rated_at: rating.rated_at,
                })
            })
            .collect();
        out.sort_by(|a, b| a.rated_at.cmp(&b.rated_at).then_with(|| a.item_id.cmp(&b.item_id)));
        Ok(out)
    }

    async fn set_rating(
        &self,
        user_id: &str,
        item_id: &str,
        state: RatingState,
        vector: Option<&[f32]>,
        rated_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let user = self.user(user_id).await;
        let mut user_state = user.lock().await;
        if state == RatingState::cleared() {
            user_state.ratings.remove(item_id);
            return Ok(());
        }
        user_state.ratings.insert(
            item_id.to_string(),
            StoredRating {
                state,
                vector: vector.map(<[f32]>::to_vec),
                rated_at,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn clusters(&self, user_id: &str) -> StoreResult<Vec<InterestCluster>> {
        let Some(user) = self.existing_user(user_id).await else {
            return Ok(Vec::new());
        };
        let state = user.lock().await;
        Ok(state.clusters.clone())
    }

    async fn replace_clusters(
        &self,
        user_id: &str,
        clusters: &[InterestCluster],
    ) -> StoreResult<()> {
        let user = self.user(user_id).await;
        let mut state = user.lock().await;
        let mut clusters = clusters.to_vec();
        clusters.sort_by_key(|cluster| cluster.cluster_index);
        state.clusters = clusters;
        Ok(())
    }
}

#[async_trait]
impl AggregateVectorStore for MemoryStore {
    async fn add_contribution(
        &self,
        user_id: &str,
        item_id: &str,
        vector: &[f32],
    ) -> StoreResult<bool> {
        let user = self.user(user_id).await;
        let mut state = user.lock().await;
        if state.contributions.contains(item_id) {
            return Ok(false);
        }
        let mut sum = state
            .vector_sum
            .clone()
            .unwrap_or_else(|| vec![0.0; vector.len()]);
        add_into(&mut sum, vector)?;
        state.vector_sum = Some(sum);
        state.vector_count += 1;
        state.contributions.insert(item_id.to_string());
        Ok(true)
    }

    async fn remove_contribution(
        &self,
        user_id: &str,
        item_id: &str,
        vector: Option<&[f32]>,
    ) -> StoreResult<bool> {
        let Some(user) = self.existing_user(user_id).await else {
            return Ok(false);
        };
        let mut state = user.lock().await;
        if !state.contributions.contains(item_id) {
            return Ok(false);
        }
        if let (Some(vector), Some(current)) = (vector, state.vector_sum.as_ref()) {
            let mut sum = current.clone();
            subtract_from(&mut sum, vector)?;
            state.vector_sum = Some(sum);
        }
        state.vector_count = state.vector_count.saturating_sub(1);
        state.contributions.remove(item_id);
        Ok(true)
    }

    async fn aggregate(&self, user_id: &str) -> StoreResult<Option<AggregateVector>> {
        let Some(user) = self.existing_user(user_id).await else {
            return Ok(None);
        };
        let state = user.lock().await;
        Ok(state.vector_sum.as_ref().map(|sum| AggregateVector {
            user_id: user_id.to_string(),
            vector_sum: sum.clone(),
            count: state.vector_count,
        }))
    }
}

#[async_trait]
impl PrecomputedStore for MemoryStore {
    async fn generated_at(&self, user_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let Some(user) = self.existing_user(user_id).await else {
            return Ok(None);
        };
        let state = user.lock().await;
        Ok(state.precomputed.iter().map(|row| row.generated_at).max())
    }

    async fn precomputed(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<PrecomputedRecommendation>> {
        let Some(user) = self.existing_user(user_id).await else {
            return Ok(Vec::new());
        };
        let state = user.lock().await;
        Ok(state.precomputed.iter().take(limit).cloned().collect())
    }

    async fn replace_precomputed(
        &self,
        user_id: &str,
        rows: &[PrecomputedRecommendation],
    ) -> StoreResult<()> {
        let user = self.user(user_id).await;
        let mut state = user.lock().await;
        let mut rows = rows.to_vec();
        rows.sort_by_key(|row| row.position);
        state.precomputed = rows;
        Ok(())
    }
}

#[async_trait]
impl RegenerationStatusStore for MemoryStore {
    async fn users_needing_regeneration(&self) -> StoreResult<Vec<String>> {
        let mut out = Vec::new();
        for (user_id, user) in self.all_users().await {
            let state = user.lock().await;
            if state
                .status
                .as_ref()
                .map_or(false, |status| status.needs_regeneration)
            {
                out.push(user_id);
            }
        }
        out.sort();
        Ok(out)
    }

    async fn mark_needs_regeneration(&self, user_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let user = self.user(user_id).await;
        let mut state = user.lock().await;
        state
            .status
            .get_or_insert_with(|| RegenerationStatus::new(user_id))
            .record_signal(at);
        Ok(())
    }

    async fn mark_regenerated(
        &self,
        user_id: &str,
        generated_at: DateTime<Utc>,
        signals_through: DateTime<Utc>,
    ) -> StoreResult<()> {
        let user = self.user(user_id).await;
        let mut state = user.lock().await;
        state
            .status
            .get_or_insert_with(|| RegenerationStatus::new(user_id))
            .record_regenerated(generated_at, signals_through);
        Ok(())
    }

    async fn status(&self, user_id: &str) -> StoreResult<Option<RegenerationStatus>> {
        let Some(user) = self.existing_user(user_id).await else {
            return Ok(None);
        };
        let state = user.lock().await;
        Ok(state.status.clone())
    }
}
