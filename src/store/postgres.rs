//! Postgres + pgvector backend.
//!
//! Users are routed to one connection of a fixed pool by stable hash, so all
//! of a user's mutations are serialized on that connection while different
//! users proceed in parallel. Every multi-statement mutation runs inside a
//! transaction; the aggregate row is locked with `SELECT ... FOR UPDATE`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error};

use super::{
    AggregateVectorStore, ClusterStore, ExclusionStore, ItemRecordFetcher, ItemVectorFetcher,
    PrecomputedStore, RatingStore, RegenerationStatusStore, SimilarItem, SimilaritySearch,
    StoreError, StoreResult,
};
use crate::hashing::shard_for;
use crate::model::{
    AggregateVector, CandidateSource, InterestCluster, ItemRecord, PrecomputedRecommendation,
    RatedItemVector, RatingKind, RatingState, RegenerationStatus,
};
use crate::vector_math::{add_into, subtract_from};

/// Postgres schema holding the recommender tables.
#[derive(Debug, Clone)]
pub struct SchemaName {
    schema: String,
}

impl SchemaName {
    /// Validates and wraps a schema name.
    pub fn new(schema: impl Into<String>) -> StoreResult<Self> {
        let schema = schema.into();
        if schema.trim().is_empty() {
            return Err(StoreError::InvalidIdentifier(
                "schema name is required".to_string(),
            ));
        }
        Ok(Self { schema })
    }

    /// Raw schema string.
    pub fn as_str(&self) -> &str {
        &self.schema
    }

    /// Quoted schema reference.
    pub fn quoted(&self) -> String {
        quote_ident(&self.schema)
    }

    /// Fully-qualified, quoted reference to `table` in this schema.
    pub fn table(&self, table: &str) -> String {
        format!("{}.{}", self.quoted(), quote_ident(table))
    }

    /// Index name safe to use unquoted.
    fn index_name(&self, table: &str, suffix: &str) -> String {
        format!(
            "{}_{}_{}",
            sanitize_ident(&self.schema),
            sanitize_ident(table),
            suffix
        )
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn sanitize_ident(input: &str) -> String {
    input
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

#[derive(Debug, Clone)]
struct Tables {
    items: String,
    ratings: String,
    reads: String,
    vectors: String,
    contributions: String,
    clusters: String,
    precomputed: String,
    status: String,
}

impl Tables {
    fn new(schema: &SchemaName) -> Self {
        Self {
            items: schema.table("items"),
            ratings: schema.table("user_ratings"),
            reads: schema.table("user_reads"),
            vectors: schema.table("user_vectors"),
            contributions: schema.table("user_vector_contributions"),
            clusters: schema.table("user_interest_clusters"),
            precomputed: schema.table("precomputed_recommendations"),
            status: schema.table("recommendation_status"),
        }
    }
}

/// Store backed by a small pool of Postgres connections.
pub struct PgStore {
    schema: SchemaName,
    tables: Tables,
    clients: Vec<Mutex<Client>>,
    next_shared: AtomicUsize,
}

impl PgStore {
    /// Opens `connections` connections (at least one) to `database_url`.
    pub async fn connect(
        database_url: &str,
        schema: SchemaName,
        connections: usize,
    ) -> StoreResult<Self> {
        let connections = connections.max(1);
        let mut clients = Vec::with_capacity(connections);
        for slot in 0..connections {
            let (client, connection) = tokio_postgres::connect(database_url, NoTls).await?;
            tokio::spawn(async move {
                if let Err(err) = connection.await {
                    error!(slot, error = %err, "postgres connection error");
                }
            });
            clients.push(Mutex::new(client));
        }
        debug!(connections, schema = schema.as_str(), "postgres store connected");
        Ok(Self::from_clients(schema, clients))
    }

    /// Wraps already-open clients.
    pub fn from_clients(schema: SchemaName, clients: Vec<Mutex<Client>>) -> Self {
        let tables = Tables::new(&schema);
        Self {
            schema,
            tables,
            clients,
            next_shared: AtomicUsize::new(0),
        }
    }

    /// Creates the pgvector extension, the schema and every table.
    /// `dims` fixes the embedding width of the vector columns.
    pub async fn prepare_schema(&self, dims: usize) -> StoreResult<()> {
        if dims == 0 {
            return Err(StoreError::InvalidIdentifier(
                "embedding dimension must be positive".to_string(),
            ));
        }
        let t = &self.tables;
        let statements = [
            "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema.quoted()),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    item_id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    link TEXT NOT NULL,
                    text_start TEXT NOT NULL DEFAULT '',
                    authors TEXT NOT NULL DEFAULT '',
                    published TIMESTAMPTZ NOT NULL,
                    embedding VECTOR({dims})
                )",
                t.items
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    user_id TEXT NOT NULL,
                    item_id TEXT NOT NULL,
                    thumbs_up BOOLEAN NOT NULL,
                    thumbs_down BOOLEAN NOT NULL,
                    embedding VECTOR({dims}),
                    rated_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (user_id, item_id)
                )",
                t.ratings
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    user_id TEXT NOT NULL,
                    item_id TEXT NOT NULL,
                    PRIMARY KEY (user_id, item_id)
                )",
                t.reads
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    user_id TEXT PRIMARY KEY,
                    vector_sum VECTOR({dims}),
                    count BIGINT NOT NULL DEFAULT 0
                )",
                t.vectors
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    user_id TEXT NOT NULL,
                    item_id TEXT NOT NULL,
                    PRIMARY KEY (user_id, item_id)
                )",
                t.contributions
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    user_id TEXT NOT NULL,
                    cluster_index INTEGER NOT NULL,
                    centroid VECTOR({dims}) NOT NULL,
                    member_count BIGINT NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (user_id, cluster_index)
                )",
                t.clusters
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    user_id TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    item_id TEXT NOT NULL,
                    score DOUBLE PRECISION NOT NULL,
                    source TEXT NOT NULL,
                    generated_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (user_id, position)
                )",
                t.precomputed
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    user_id TEXT PRIMARY KEY,
                    last_generated_at TIMESTAMPTZ,
                    last_signal_at TIMESTAMPTZ,
                    needs_regeneration BOOLEAN NOT NULL DEFAULT FALSE
                )",
                t.status
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (needs_regeneration) WHERE needs_regeneration",
                self.schema
                    .index_name("recommendation_status", "pending_idx"),
                t.status
            ),
        ];
        let client = self.shared_client().await;
        for sql in &statements {
            client.batch_execute(sql).await?;
        }
        debug!(schema = self.schema.as_str(), dims, "schema prepared");
        Ok(())
    }

    async fn client_for(&self, user_id: &str) -> MutexGuard<'_, Client> {
        let slot = shard_for(user_id, self.clients.len());
        self.clients[slot].lock().await
    }

    async fn shared_client(&self) -> MutexGuard<'_, Client> {
        let slot = self.next_shared.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        self.clients[slot].lock().await
    }
}

#[async_trait]
impl SimilaritySearch for PgStore {
    async fn search(
        &self,
        exclude: &[String],
        query: &[f32],
        limit: usize,
    ) -> StoreResult<Vec<SimilarItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT item_id, 1 - (embedding <=> $1) AS score \
            FROM {} \
            WHERE embedding IS NOT NULL AND NOT (item_id = ANY($2)) \
            ORDER BY embedding <=> $1 ASC \
            LIMIT $3",
            self.tables.items
        );
        let vector = Vector::from(query.to_vec());
        let exclude = exclude.to_vec();
        let limit = as_i64(limit, "limit")?;
        let client = self.shared_client().await;
        let rows = client.query(&sql, &[&vector, &exclude, &limit]).await?;
        rows.iter()
            .map(|row| -> StoreResult<SimilarItem> {
                let item_id: String = row.try_get("item_id")?;
                Ok(SimilarItem::new(item_id, row.try_get::<_, f64>("score")?))
            })
            .collect()
    }
}

#[async_trait]
impl ItemVectorFetcher for PgStore {
    async fn fetch_item_vector(&self, item_id: &str) -> StoreResult<Option<Vec<f32>>> {
        let sql = format!("SELECT embedding FROM {} WHERE item_id = $1", self.tables.items);
        let client = self.shared_client().await;
        let row = client.query_opt(&sql, &[&item_id]).await?;
        match row {
            Some(row) => {
                let embedding: Option<Vector> = row.try_get("embedding")?;
                Ok(embedding.map(|vector| vector.to_vec()))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ItemRecordFetcher for PgStore {
    async fn fetch_records(&self, ids: &[String]) -> StoreResult<Vec<ItemRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT item_id, title, link, text_start, authors, published \
            FROM {} WHERE item_id = ANY($1)",
            self.tables.items
        );
        let ids = ids.to_vec();
        let client = self.shared_client().await;
        let rows = client.query(&sql, &[&ids]).await?;
        rows.iter().map(item_record_from_row).collect()
    }
}

fn item_record_from_row(row: &Row) -> StoreResult<ItemRecord> {
    Ok(ItemRecord {
        item_id: row.try_get("item_id")?,
        title: row.try_get("title")?,
        link: row.try_get("link")?,
        text_start: row.try_get("text_start")?,
        authors: row.try_get("authors")?,
        published: row.try_get("published")?,
    })
}

#[async_trait]
impl ExclusionStore for PgStore {
    async fn list_excluded(&self, user_id: &str) -> StoreResult<HashSet<String>> {
        let sql = format!("SELECT item_id FROM {} WHERE user_id = $1", self.tables.reads);
        let client = self.client_for(user_id).await;
        let rows = client.query(&sql, &[&user_id]).await?;
        rows.iter()
            .map(|row| row.try_get::<_, String>("item_id").map_err(StoreError::from))
            .collect()
    }

    async fn set_read(&self, user_id: &str, item_id: &str, read: bool) -> StoreResult<()> {
        let sql = if read {
            format!(
                "INSERT INTO {} (user_id, item_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                self.tables.reads
            )
        } else {
            format!(
                "DELETE FROM {} WHERE user_id = $1 AND item_id = $2",
                self.tables.reads
            )
        };
        let client = self.client_for(user_id).await;
        client.execute(&sql, &[&user_id, &item_id]).await?;
        Ok(())
    }
}

#[async_trait]
impl RatingStore for PgStore {
    async fn rated_vectors(
        &self,
        user_id: &str,
        kind: RatingKind,
    ) -> StoreResult<Vec<RatedItemVector>> {
        let flag = match kind {
            RatingKind::Positive => "thumbs_up",
            RatingKind::Negative => "thumbs_down",
        };
        let sql = format!(
            "SELECT item_id, embedding, rated_at FROM {} \
            WHERE user_id = $1 AND {flag} AND embedding IS NOT NULL \
            ORDER BY rated_at ASC, item_id ASC",
            self.tables.ratings
        );
        let client = self.client_for(user_id).await;
        let rows = client.query(&sql, &[&user_id]).await?;
        rows.iter()
            .map(|row| -> StoreResult<RatedItemVector> {
                let vector: Vector = row.try_get("embedding")?;
                Ok(RatedItemVector {
                    item_id: row.try_get("item_id")?,
                    vector: vector.to_vec(),
                    kind,
                    rated_at: row.try_get("rated_at")?,
                })
            })
            .collect()
    }

    async fn set_rating(
        &self,
        user_id: &str,
        item_id: &str,
        state: RatingState,
        vector: Option<&[f32]>,
        rated_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let client = self.client_for(user_id).await;
        if state == RatingState::cleared() {
            let sql = format!(
                "DELETE FROM {} WHERE user_id = $1 AND item_id = $2",
                self.tables.ratings
            );
            client.execute(&sql, &[&user_id, &item_id]).await?;
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {} (user_id, item_id, thumbs_up, thumbs_down, embedding, rated_at) \
            VALUES ($1, $2, $3, $4, $5, $6) \
            ON CONFLICT (user_id, item_id) DO UPDATE SET \
                thumbs_up = EXCLUDED.thumbs_up, \
                thumbs_down = EXCLUDED.thumbs_down, \
                embedding = EXCLUDED.embedding, \
                rated_at = EXCLUDED.rated_at",
            self.tables.ratings
        );
        let embedding = vector.map(|v| Vector::from(v.to_vec()));
        client
            .execute(
                &sql,
                &[
                    &user_id,
                    &item_id,
                    &state.thumbs_up,
                    &state.thumbs_down,
                    &embedding,
                    &rated_at,
                ],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for PgStore {
    async fn clusters(&self, user_id: &str) -> StoreResult<Vec<InterestCluster>> {
        let sql = format!(
            "SELECT cluster_index, centroid, member_count, updated_at FROM {} \
            WHERE user_id = $1 ORDER BY cluster_index ASC",
            self.tables.clusters
        );
        let client = self.client_for(user_id).await;
        let rows = client.query(&sql, &[&user_id]).await?;
        rows.iter()
            .map(|row| -> StoreResult<InterestCluster> {
                let index: i32 = row.try_get("cluster_index")?;
                let centroid: Vector = row.try_get("centroid")?;
                let members: i64 = row.try_get("member_count")?;
                Ok(InterestCluster {
                    cluster_index: as_usize(index, "cluster_index")?,
                    centroid: centroid.to_vec(),
                    member_count: as_usize(members, "member_count")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn replace_clusters(
        &self,
        user_id: &str,
        clusters: &[InterestCluster],
    ) -> StoreResult<()> {
        let delete = format!("DELETE FROM {} WHERE user_id = $1", self.tables.clusters);
        let insert = format!(
            "INSERT INTO {} (user_id, cluster_index, centroid, member_count, updated_at) \
            VALUES ($1, $2, $3, $4, $5)",
            self.tables.clusters
        );
        let mut client = self.client_for(user_id).await;
        let transaction = client.transaction().await?;
        transaction.execute(&delete, &[&user_id]).await?;
        let statement = transaction.prepare(&insert).await?;
        for cluster in clusters {
            let index = as_i32(cluster.cluster_index, "cluster_index")?;
            let members = as_i64(cluster.member_count, "member_count")?;
            let centroid = Vector::from(cluster.centroid.clone());
            transaction
                .execute(
                    &statement,
                    &[&user_id, &index, &centroid, &members, &cluster.updated_at],
                )
                .await?;
        }
        transaction.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl AggregateVectorStore for PgStore {
    async fn add_contribution(
        &self,
        user_id: &str,
        item_id: &str,
        vector: &[f32],
    ) -> StoreResult<bool> {
        let t = &self.tables;
        let mut client = self.client_for(user_id).await;
        let transaction = client.transaction().await?;
        let (sum, count) = lock_aggregate(&transaction, t, user_id).await?;
        let flagged = format!(
            "SELECT 1 FROM {} WHERE user_id = $1 AND item_id = $2",
            t.contributions
        );
        if transaction
            .query_opt(&flagged, &[&user_id, &item_id])
            .await?
            .is_some()
        {
            return Ok(false);
        }
        let mut sum = sum.unwrap_or_else(|| vec![0.0; vector.len()]);
        add_into(&mut sum, vector)?;
        write_aggregate(&transaction, t, user_id, sum, count + 1).await?;
        let flag = format!(
            "INSERT INTO {} (user_id, item_id) VALUES ($1, $2)",
            t.contributions
        );
        transaction.execute(&flag, &[&user_id, &item_id]).await?;
        transaction.commit().await?;
        Ok(true)
    }

    async fn remove_contribution(
        &self,
        user_id: &str,
        item_id: &str,
        vector: Option<&[f32]>,
    ) -> StoreResult<bool> {
        let t = &self.tables;
        let mut client = self.client_for(user_id).await;
        let transaction = client.transaction().await?;
        let (sum, count) = lock_aggregate(&transaction, t, user_id).await?;
        let unflag = format!(
            "DELETE FROM {} WHERE user_id = $1 AND item_id = $2",
            t.contributions
        );
        if transaction.execute(&unflag, &[&user_id, &item_id]).await? == 0 {
            return Ok(false);
        }
        let sum = match (sum, vector) {
            (Some(mut sum), Some(vector)) => {
                subtract_from(&mut sum, vector)?;
                Some(sum)
            }
            (sum, _) => sum,
        };
        let count = (count - 1).max(0);
        match sum {
            Some(sum) => write_aggregate(&transaction, t, user_id, sum, count).await?,
            None => {
                let sql = format!("UPDATE {} SET count = $2 WHERE user_id = $1", t.vectors);
                transaction.execute(&sql, &[&user_id, &count]).await?;
            }
        }
        transaction.commit().await?;
        Ok(true)
    }

    async fn aggregate(&self, user_id: &str) -> StoreResult<Option<AggregateVector>> {
        let sql = format!(
            "SELECT vector_sum, count FROM {} WHERE user_id = $1 AND vector_sum IS NOT NULL",
            self.tables.vectors
        );
        let client = self.client_for(user_id).await;
        let Some(row) = client.query_opt(&sql, &[&user_id]).await? else {
            return Ok(None);
        };
        let sum: Vector = row.try_get("vector_sum")?;
        let count: i64 = row.try_get("count")?;
        Ok(Some(AggregateVector {
            user_id: user_id.to_string(),
            vector_sum: sum.to_vec(),
            count: u64::try_from(count)
                .map_err(|_| StoreError::Corrupt(format!("negative aggregate count {count}")))?,
        }))
    }
}

async fn lock_aggregate(
    transaction: &tokio_postgres::Transaction<'_>,
    t: &Tables,
    user_id: &str,
) -> StoreResult<(Option<Vec<f32>>, i64)> {
    let ensure = format!(
        "INSERT INTO {} (user_id, vector_sum, count) VALUES ($1, NULL, 0) ON CONFLICT DO NOTHING",
        t.vectors
    );
    transaction.execute(&ensure, &[&user_id]).await?;
    let select = format!(
        "SELECT vector_sum, count FROM {} WHERE user_id = $1 FOR UPDATE",
        t.vectors
    );
    let row = transaction.query_one(&select, &[&user_id]).await?;
    let sum: Option<Vector> = row.try_get("vector_sum")?;
    let count: i64 = row.try_get("count")?;
    Ok((sum.map(|vector| vector.to_vec()), count))
}

async fn write_aggregate(
    transaction: &tokio_postgres::Transaction<'_>,
    t: &Tables,
    user_id: &str,
    sum: Vec<f32>,
    count: i64,
) -> StoreResult<()> {
    let sql = format!(
        "UPDATE {} SET vector_sum = $2, count = $3 WHERE user_id = $1",
        t.vectors
    );
    let sum = Vector::from(sum);
    transaction.execute(&sql, &[&user_id, &sum, &count]).await?;
    Ok(())
}

#[async_trait]
impl PrecomputedStore for PgStore {
    async fn generated_at(&self, user_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT MAX(generated_at) AS generated_at FROM {} WHERE user_id = $1",
            self.tables.precomputed
        );
        let client = self.client_for(user_id).await;
        let row = client.query_one(&sql, &[&user_id]).await?;
        Ok(row.try_get("generated_at")?)
    }

    async fn precomputed(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<PrecomputedRecommendation>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT item_id, score, source, position, generated_at FROM {} \
            WHERE user_id = $1 ORDER BY position ASC LIMIT $2",
            self.tables.precomputed
        );
        let limit = as_i64(limit, "limit")?;
        let client = self.client_for(user_id).await;
        let rows = client.query(&sql, &[&user_id, &limit]).await?;
        rows.iter()
            .map(|row| -> StoreResult<PrecomputedRecommendation> {
                let source: String = row.try_get("source")?;
                let position: i32 = row.try_get("position")?;
                Ok(PrecomputedRecommendation {
                    user_id: user_id.to_string(),
                    item_id: row.try_get("item_id")?,
                    score: row.try_get("score")?,
                    source: source
                        .parse::<CandidateSource>()
                        .map_err(|err| StoreError::Corrupt(err.to_string()))?,
                    position: as_usize(position, "position")?,
                    generated_at: row.try_get("generated_at")?,
                })
            })
            .collect()
    }

    async fn replace_precomputed(
        &self,
        user_id: &str,
        rows: &[PrecomputedRecommendation],
    ) -> StoreResult<()> {
        let delete = format!("DELETE FROM {} WHERE user_id = $1", self.tables.precomputed);
        let insert = format!(
            "INSERT INTO {} (user_id, position, item_id, score, source, generated_at) \
            VALUES ($1, $2, $3, $4, $5, $6)",
            self.tables.precomputed
        );
        let mut client = self.client_for(user_id).await;
        let transaction = client.transaction().await?;
        transaction.execute(&delete, &[&user_id]).await?;
        let statement = transaction.prepare(&insert).await?;
        for row in rows {
            let position = as_i32(row.position, "position")?;
            let source = row.source.to_string();
            transaction
                .execute(
                    &statement,
                    &[
                        &user_id,
                        &position,
                        &row.item_id,
                        &row.score,
                        &source,
                        &row.generated_at,
                    ],
                )
                .await?;
        }
        transaction.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl RegenerationStatusStore for PgStore {
    async fn users_needing_regeneration(&self) -> StoreResult<Vec<String>> {
        let sql = format!(
            "SELECT user_id FROM {} WHERE needs_regeneration ORDER BY user_id",
            self.tables.status
        );
        let client = self.shared_client().await;
        let rows = client.query(&sql, &[]).await?;
        rows.iter()
            .map(|row| row.try_get::<_, String>("user_id").map_err(StoreError::from))
            .collect()
    }

    async fn mark_needs_regeneration(&self, user_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO {} AS s (user_id, last_generated_at, last_signal_at, needs_regeneration) \
            VALUES ($1, NULL, $2, TRUE) \
            ON CONFLICT (user_id) DO UPDATE SET \
                last_signal_at = GREATEST(s.last_signal_at, EXCLUDED.last_signal_at), \
                needs_regeneration = TRUE",
            self.tables.status
        );
        let client = self.client_for(user_id).await;
        client.execute(&sql, &[&user_id, &at]).await?;
        Ok(())
    }

    async fn mark_regenerated(
        &self,
        user_id: &str,
        generated_at: DateTime<Utc>,
        signals_through: DateTime<Utc>,
    ) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO {} AS s (user_id, last_generated_at, last_signal_at, needs_regeneration) \
            VALUES ($1, $2, NULL, FALSE) \
            ON CONFLICT (user_id) DO UPDATE SET \
                last_generated_at = EXCLUDED.last_generated_at, \
                needs_regeneration = COALESCE(s.last_signal_at > $3, FALSE)",
            self.tables.status
        );
        let client = self.client_for(user_id).await;
        client
            .execute(&sql, &[&user_id, &generated_at, &signals_through])
            .await?;
        Ok(())
    }

    async fn status(&self, user_id: &str) -> StoreResult<Option<RegenerationStatus>> {
        let sql = format!(
            "SELECT last_generated_at, last_signal_at, needs_regeneration FROM {} \
            WHERE user_id = $1",
            self.tables.status
        );
        let client = self.client_for(user_id).await;
        let Some(row) = client.query_opt(&sql, &[&user_id]).await? else {
            return Ok(None);
        };
        Ok(Some(RegenerationStatus {
            user_id: user_id.to_string(),
            last_generated_at: row.try_get("last_generated_at")?,
            last_signal_at: row.try_get("last_signal_at")?,
            needs_regeneration: row.try_get("needs_regeneration")?,
        }))
    }
}

fn as_i64(value: usize, field: &str) -> StoreResult<i64> {
    i64::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("{field} value {value} exceeds i64 range")))
}

fn as_i32(value: usize, field: &str) -> StoreResult<i32> {
    i32::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("{field} value {value} exceeds i32 range")))
}

fn as_usize<T>(value: T, field: &str) -> StoreResult<usize>
where
    usize: TryFrom<T>,
    T: Copy + std::fmt::Display,
{
    usize::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("{field} value {value} is not a valid index")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_tables_are_quoted() {
        let schema = SchemaName::new("feed\"rec").unwrap();
        assert_eq!(schema.table("items"), "\"feed\"\"rec\".\"items\"");
        assert_eq!(
            schema.index_name("recommendation_status", "pending_idx"),
            "feed_rec_recommendation_status_pending_idx"
        );
    }

    #[test]
    fn blank_schema_is_rejected() {
        assert!(matches!(
            SchemaName::new("  "),
            Err(StoreError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn index_conversions_reject_out_of_range() {
        assert_eq!(as_usize(3_i32, "position").unwrap(), 3);
        assert!(matches!(
            as_usize(-1_i32, "position"),
            Err(StoreError::Corrupt(_))
        ));
        assert!(as_i32(usize::MAX, "position").is_err());
    }
}
