use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use feedrec::store::{
    ExclusionStore, PrecomputedStore, RatingStore, RegenerationStatusStore, SimilaritySearch,
};
use feedrec::{
    kmeans, CandidateGenerator, CandidateSource, Clock, FixedClock, GenerateConfig, ItemRecord,
    MemoryStore, RatingState, ScoredCandidate, SimilarItem, StoreResult, TuningArgs,
};
use pretty_assertions::assert_eq;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 1, 8, 0, 0).unwrap()
}

#[derive(Default)]
struct CannedSearch {
    hits: Vec<SimilarItem>,
    calls: Mutex<usize>,
}

impl CannedSearch {
    fn new(hits: &[(&str, f64)]) -> Self {
        Self {
            hits: hits
                .iter()
                .map(|(id, score)| SimilarItem::new(*id, *score))
                .collect(),
            calls: Mutex::new(0),
        }
    }
}

#[async_trait]
impl SimilaritySearch for CannedSearch {
    async fn search(
        &self,
        _exclude: &[String],
        _query: &[f32],
        limit: usize,
    ) -> StoreResult<Vec<SimilarItem>> {
        *self.calls.lock().unwrap() += 1;
        Ok(self.hits.iter().take(limit).cloned().collect())
    }
}

fn generator(store: &Arc<MemoryStore>, search: Arc<CannedSearch>, weight: f64) -> CandidateGenerator {
    CandidateGenerator::new(
        search,
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(FixedClock(now())),
        GenerateConfig {
            negative_signal_weight: weight,
            ..GenerateConfig::default()
        },
    )
}

async fn like_two(store: &MemoryStore) {
    for (item, vector) in [("p1", [1.0f32, 0.0, 0.0]), ("p2", [0.0, 1.0, 0.0])] {
        store
            .set_rating("user", item, RatingState::up(), Some(&vector[..]), now())
            .await
            .unwrap();
    }
}

fn temporal(item_id: &str, score: f64) -> ScoredCandidate {
    ScoredCandidate {
        item_id: item_id.to_string(),
        score,
        source: CandidateSource::Temporal,
    }
}

#[tokio::test(flavor = "current_thread")]
async fn two_likes_without_penalty() {
    let store = Arc::new(MemoryStore::new());
    like_two(&store).await;
    let search = Arc::new(CannedSearch::new(&[("rec1", 0.9), ("rec2", 0.8)]));

    let out = generator(&store, search, 0.0)
        .generate("user", 10)
        .await
        .unwrap();
    assert_eq!(out, vec![temporal("rec1", 0.9), temporal("rec2", 0.8)]);
}

#[tokio::test(flavor = "current_thread")]
async fn thumbs_down_penalizes_by_own_score() {
    let store = Arc::new(MemoryStore::new());
    like_two(&store).await;
    store
        .set_rating("user", "n1", RatingState::down(), Some(&[0.0f32, 0.0, 1.0][..]), now())
        .await
        .unwrap();
    let search = Arc::new(CannedSearch::new(&[("rec1", 0.9), ("rec2", 0.8)]));

    let out = generator(&store, search, 0.3)
        .generate("user", 10)
        .await
        .unwrap();
    assert_eq!(out.len(), 2);
    assert!((out[0].score - 0.765).abs() < 1e-9);
    assert!((out[1].score - 0.68).abs() < 1e-9);
    assert_eq!(out[0].item_id, "rec1");
}

#[tokio::test(flavor = "current_thread")]
async fn no_likes_means_no_search() {
    let store = Arc::new(MemoryStore::new());
    let search = Arc::new(CannedSearch::new(&[("rec1", 0.9)]));

    let out = generator(&store, search.clone(), 0.3)
        .generate("user", 10)
        .await
        .unwrap();
    assert!(out.is_empty());
    assert_eq!(*search.calls.lock().unwrap(), 0);
}

fn article(id: &str) -> ItemRecord {
    ItemRecord {
        item_id: id.to_string(),
        title: format!("Article {id}"),
        link: format!("https://feed.test/a/{id}"),
        text_start: "Lorem ipsum".to_string(),
        authors: "Ada, Grace".to_string(),
        published: now() - Duration::days(3),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn rate_regenerate_then_serve() {
    let store = Arc::new(MemoryStore::new());
    let catalog = [
        ("ml-1", [1.0f32, 0.0]),
        ("ml-2", [0.95, 0.05]),
        ("ml-3", [0.9, 0.1]),
        ("bio-1", [0.0, 1.0]),
        ("bio-2", [0.1, 0.9]),
    ];
    for (id, vector) in catalog {
        store.insert_item(article(id), Some(vector.to_vec())).await;
    }

    let clock: Arc<dyn Clock> = Arc::new(FixedClock(now()));
    let services = TuningArgs::default()
        .build_services(store.clone(), clock)
        .unwrap();

    services
        .ratings
        .set_rating("reader", "ml-1", RatingState::up())
        .await
        .unwrap();
    services.ratings.set_read("reader", "ml-1", true).await.unwrap();
    assert_eq!(
        store.users_needing_regeneration().await.unwrap(),
        vec!["reader".to_string()]
    );

    let report = services.batch.run().await.unwrap();
    assert_eq!((report.success_count, report.fail_count), (1, 0));
    assert!(store.users_needing_regeneration().await.unwrap().is_empty());
    assert_eq!(store.generated_at("reader").await.unwrap(), Some(now()));

    let served = services.recommender.recommend_for("reader", 2).await.unwrap();
    let ids: Vec<&str> = served.iter().map(|r| r.item_id.as_str()).collect();
    assert_eq!(ids, vec!["ml-2", "ml-3"]);

    // reading an item hides it from the cached list without regeneration
    services.ratings.set_read("reader", "ml-2", true).await.unwrap();
    let served = services.recommender.recommend_for("reader", 2).await.unwrap();
    let ids: Vec<&str> = served.iter().map(|r| r.item_id.as_str()).collect();
    assert_eq!(ids, vec!["ml-3", "bio-2"]);
    assert!(store.list_excluded("reader").await.unwrap().contains("ml-2"));
    assert!(!store.status("reader").await.unwrap().unwrap().needs_regeneration);
    assert_eq!(
        store
            .rated_vectors("reader", feedrec::RatingKind::Positive)
            .await
            .unwrap()
            .len(),
        1
    );
    let cached = store.precomputed("reader", 10).await.unwrap();
    // already-read items never make it into the cached list
    let cached_ids: Vec<&str> = cached.iter().map(|r| r.item_id.as_str()).collect();
    assert_eq!(cached_ids, vec!["ml-2", "ml-3", "bio-2", "bio-1"]);
}

#[test]
fn seeded_clustering_is_reproducible() {
    let points: Vec<Vec<f32>> = (0..30)
        .map(|i| {
            let group = (i % 3) as f32 * 5.0;
            vec![group + (i as f32) * 0.01, group - (i as f32) * 0.02]
        })
        .collect();

    let first = kmeans(&points, 3, 50, 1e-4, &mut ChaCha8Rng::seed_from_u64(42));
    let second = kmeans(&points, 3, 50, 1e-4, &mut ChaCha8Rng::seed_from_u64(42));
    assert_eq!(first, second);
    assert_eq!(first.centroids.len(), 3);
    assert_eq!(first.assignments.len(), 30);
}
