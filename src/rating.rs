//! Rating and read-state ingestion.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::model::{RatingKind, RatingState};
use crate::store::{
    AggregateVectorStore, ExclusionStore, ItemVectorFetcher, RatingStore,
    RegenerationStatusStore, StoreError,
};

/// A rating or read-state change that did not take effect.
#[derive(Debug, Error)]
pub enum RatingError {
    /// The rating row could not be written.
    #[error("storing rating: {0}")]
    Rating(#[source] StoreError),
    /// The rating was stored but the aggregate vector could not follow it.
    #[error("updating aggregate vector: {0}")]
    Aggregate(#[source] StoreError),
    /// The read flag could not be written.
    #[error("storing read state: {0}")]
    Read(#[source] StoreError),
}

/// Applies thumbs-up/down and read changes and flags the user for regeneration.
#[derive(Clone)]
pub struct RatingService {
    vectors: Arc<dyn ItemVectorFetcher>,
    ratings: Arc<dyn RatingStore>,
    aggregate: Arc<dyn AggregateVectorStore>,
    exclusions: Arc<dyn ExclusionStore>,
    status: Arc<dyn RegenerationStatusStore>,
    clock: Arc<dyn Clock>,
}

impl RatingService {
    /// Wires the service.
    pub fn new(
        vectors: Arc<dyn ItemVectorFetcher>,
        ratings: Arc<dyn RatingStore>,
        aggregate: Arc<dyn AggregateVectorStore>,
        exclusions: Arc<dyn ExclusionStore>,
        status: Arc<dyn RegenerationStatusStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            vectors,
            ratings,
            aggregate,
            exclusions,
            status,
            clock,
        }
    }

    /// Sets `user_id`'s rating of `item_id`.
    ///
    /// A thumbs-up on an item with an embedding folds it into the user's
    /// aggregate vector; a cleared rating or thumbs-down takes it back out.
    /// When the embedding lookup itself fails the rating is still stored,
    /// keeping any vector saved with the previous rating, and the aggregate
    /// is left untouched.
    pub async fn set_rating(
        &self,
        user_id: &str,
        item_id: &str,
        state: RatingState,
    ) -> Result<(), RatingError> {
        let fetched = match self.vectors.fetch_item_vector(item_id).await {
            Ok(vector) => {
                if vector.is_none() {
                    debug!(item_id, "item has no vector");
                }
                Some(vector)
            }
            Err(err) => {
                warn!(user_id, item_id, error = %err, "failed to fetch item vector, skipping aggregate sync");
                None
            }
        };
        let stored_vector = match &fetched {
            Some(vector) => vector.clone(),
            None => self.previous_vector(user_id, item_id).await,
        };

        let now = self.clock.now();
        self.ratings
            .set_rating(user_id, item_id, state, stored_vector.as_deref(), now)
            .await
            .map_err(RatingError::Rating)?;
        debug!(
            user_id,
            item_id,
            thumbs_up = state.thumbs_up,
            thumbs_down = state.thumbs_down,
            "set item rating"
        );

        let synced = match (state.thumbs_up, fetched.as_ref()) {
            (_, None) => Ok(false),
            (true, Some(Some(vector))) => {
                self.aggregate.add_contribution(user_id, item_id, vector).await
            }
            (true, Some(None)) => Ok(false),
            (false, Some(vector)) => {
                self.aggregate
                    .remove_contribution(user_id, item_id, vector.as_deref())
                    .await
            }
        };

        if let Err(err) = self.status.mark_needs_regeneration(user_id, now).await {
            warn!(user_id, error = %err, "failed to mark user for regeneration");
        }

        match synced {
            Ok(changed) => {
                debug!(user_id, item_id, changed, "aggregate vector synced");
                Ok(())
            }
            Err(err) => Err(RatingError::Aggregate(err)),
        }
    }

    async fn previous_vector(&self, user_id: &str, item_id: &str) -> Option<Vec<f32>> {
        for kind in [RatingKind::Positive, RatingKind::Negative] {
            match self.ratings.rated_vectors(user_id, kind).await {
                Ok(rated) => {
                    if let Some(found) = rated.into_iter().find(|r| r.item_id == item_id) {
                        return Some(found.vector);
                    }
                }
                Err(err) => {
                    warn!(user_id, item_id, error = %err, "failed to read previous rating vector");
                    return None;
                }
            }
        }
        None
    }

    /// Marks `item_id` read or unread for `user_id`.
    pub async fn set_read(&self, user_id: &str, item_id: &str, read: bool) -> Result<(), RatingError> {
        self.exclusions
            .set_read(user_id, item_id, read)
            .await
            .map_err(RatingError::Read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::model::ItemRecord;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    async fn service() -> (Arc<MemoryStore>, RatingService) {
        let store = Arc::new(MemoryStore::new());
        let published = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for (id, vector) in [("a", Some(vec![1.0, 2.0])), ("plain", None)] {
            let record = ItemRecord {
                item_id: id.to_string(),
                title: id.to_string(),
                link: String::new(),
                text_start: String::new(),
                authors: String::new(),
                published,
            };
            store.insert_item(record, vector).await;
        }
        let clock = Arc::new(FixedClock(published));
        let service = RatingService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            clock,
        );
        (store, service)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn thumbs_up_then_down_round_trips_aggregate() {
        let (store, service) = service().await;
        service.set_rating("u", "a", RatingState::up()).await.unwrap();
        let agg = store.aggregate("u").await.unwrap().unwrap();
        assert_eq!((agg.vector_sum.clone(), agg.count), (vec![1.0, 2.0], 1));
        assert_eq!(store.rated_vectors("u", RatingKind::Positive).await.unwrap().len(), 1);

        service.set_rating("u", "a", RatingState::down()).await.unwrap();
        let agg = store.aggregate("u").await.unwrap().unwrap();
        assert_eq!((agg.vector_sum, agg.count), (vec![0.0, 0.0], 0));
        assert!(store.rated_vectors("u", RatingKind::Positive).await.unwrap().is_empty());
        assert_eq!(store.rated_vectors("u", RatingKind::Negative).await.unwrap().len(), 1);

        assert!(store.status("u").await.unwrap().unwrap().needs_regeneration);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn item_without_vector_is_rated_but_not_aggregated() {
        let (store, service) = service().await;
        service.set_rating("u", "plain", RatingState::up()).await.unwrap();
        assert!(store.aggregate("u").await.unwrap().is_none());
        assert!(store.rated_vectors("u", RatingKind::Positive).await.unwrap().is_empty());
        assert_eq!(
            store.users_needing_regeneration().await.unwrap(),
            vec!["u".to_string()]
        );
    }

    struct VectorsOffline;

    #[async_trait::async_trait]
    impl ItemVectorFetcher for VectorsOffline {
        async fn fetch_item_vector(&self, _: &str) -> crate::store::StoreResult<Option<Vec<f32>>> {
            Err(StoreError::Unavailable("embedding index offline".to_string()))
        }
    }

    fn offline_service(store: &Arc<MemoryStore>) -> RatingService {
        let clock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()));
        RatingService::new(
            Arc::new(VectorsOffline),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            clock,
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn vector_lookup_failure_leaves_aggregate_alone() {
        let (store, service) = service().await;
        service.set_rating("u", "a", RatingState::up()).await.unwrap();

        offline_service(&store)
            .set_rating("u", "a", RatingState::up())
            .await
            .unwrap();
        let agg = store.aggregate("u").await.unwrap().unwrap();
        assert_eq!((agg.vector_sum.clone(), agg.count), (vec![1.0, 2.0], 1));
        let liked = store.rated_vectors("u", RatingKind::Positive).await.unwrap();
        assert_eq!(liked.len(), 1);
        assert_eq!(liked[0].vector, vec![1.0, 2.0]);

        // a later successful thumbs-up must not fold the item in twice
        service.set_rating("u", "a", RatingState::up()).await.unwrap();
        let agg = store.aggregate("u").await.unwrap().unwrap();
        assert_eq!((agg.vector_sum, agg.count), (vec![1.0, 2.0], 1));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn thumbs_down_during_lookup_failure_keeps_vector() {
        let (store, service) = service().await;
        service.set_rating("u", "a", RatingState::up()).await.unwrap();

        offline_service(&store)
            .set_rating("u", "a", RatingState::down())
            .await
            .unwrap();
        let disliked = store.rated_vectors("u", RatingKind::Negative).await.unwrap();
        assert_eq!(disliked.len(), 1);
        assert_eq!(disliked[0].vector, vec![1.0, 2.0]);
        assert!(store.rated_vectors("u", RatingKind::Positive).await.unwrap().is_empty());
        let agg = store.aggregate("u").await.unwrap().unwrap();
        assert_eq!(agg.count, 1);

        // the next reachable change restores the sum
        service.set_rating("u", "a", RatingState::down()).await.unwrap();
        let agg = store.aggregate("u").await.unwrap().unwrap();
        assert_eq!((agg.vector_sum, agg.count), (vec![0.0, 0.0], 0));
        assert!(store.status("u").await.unwrap().unwrap().needs_regeneration);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn read_state_toggles_exclusion() {
        let (store, service) = service().await;
        service.set_read("u", "a", true).await.unwrap();
        assert!(store.list_excluded("u").await.unwrap().contains("a"));
        service.set_read("u", "a", false).await.unwrap();
        assert!(store.list_excluded("u").await.unwrap().is_empty());
    }
}
