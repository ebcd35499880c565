use anyhow::Result;
use async_trait::async_trait;
use pgvector::Vector;
use sqlx::{FromRow, PgPool};
use tracing::debug;

use super::models::{ChunkRecord, ScoredChunk};
use crate::utils::similarity::maximal_marginal_relevance;

/// Payload filter over the indexed chunk columns. All set fields must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkFilter {
    pub source: Option<String>,
    pub pdf_hash: Option<String>,
    pub content_hash_global: Option<String>,
}

impl ChunkFilter {
    pub fn by_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Default::default()
        }
    }

    pub fn by_pdf_hash(pdf_hash: impl Into<String>) -> Self {
        Self {
            pdf_hash: Some(pdf_hash.into()),
            ..Default::default()
        }
    }

    pub fn by_global_hash(content_hash_global: impl Into<String>) -> Self {
        Self {
            content_hash_global: Some(content_hash_global.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_none() && self.pdf_hash.is_none() && self.content_hash_global.is_none()
    }

    /// Deterministic representation used in retrieval cache keys.
    pub fn cache_key(&self) -> String {
        format!(
            "src={};pdf={};glob={}",
            self.source.as_deref().unwrap_or(""),
            self.pdf_hash.as_deref().unwrap_or(""),
            self.content_hash_global.as_deref().unwrap_or("")
        )
    }

    /// SQL conditions with placeholders starting at `$first_param`, plus the
    /// values to bind in order.
    fn conditions(&self, first_param: usize) -> (Vec<String>, Vec<&str>) {
        let mut conds = Vec::new();
        let mut binds: Vec<&str> = Vec::new();

        for (column, value) in [
            ("source", self.source.as_deref()),
            ("pdf_hash", self.pdf_hash.as_deref()),
            ("content_hash_global", self.content_hash_global.as_deref()),
        ] {
            if let Some(v) = value {
                conds.push(format!("{} = ${}", column, first_param + binds.len()));
                binds.push(v);
            }
        }

        (conds, binds)
    }
}

/// Vector store contract: persistence plus similarity and MMR retrieval.
/// The empty store is a first-class state for every operation.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Idempotent per-chunk upsert. Returns the number of rows written.
    async fn upsert(&self, chunks: Vec<ChunkRecord>) -> Result<usize>;

    /// Top-k by cosine similarity, best first. Scores are similarity
    /// (1 - distance). Stored embeddings ride along in the results.
    async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&ChunkFilter>,
    ) -> Result<Vec<ScoredChunk>>;

    /// Diversity-aware retrieval: fetch `fetch_k` candidates, drop those
    /// scoring below `min_score`, then pick `k` by maximal marginal
    /// relevance using the stored candidate embeddings.
    async fn mmr_search(
        &self,
        query: &[f32],
        k: usize,
        fetch_k: usize,
        lambda: f32,
        min_score: Option<f32>,
        filter: Option<&ChunkFilter>,
    ) -> Result<Vec<ScoredChunk>>;

    /// Delete everything matching the filter. Refuses an empty filter;
    /// use `clear` for that. Returns rows removed.
    async fn delete(&self, filter: &ChunkFilter) -> Result<u64>;

    async fn clear(&self) -> Result<u64>;

    async fn count(&self) -> Result<u64>;

    async fn contains(&self, filter: &ChunkFilter) -> Result<bool>;

    /// All `(id, embedding)` pairs, for centroid recomputation.
    async fn embeddings(&self) -> Result<Vec<(String, Vec<f32>)>>;

    /// Locate the `(pdf_hash, source)` a document-level hash is stored
    /// under, if any.
    async fn find_by_global_hash(
        &self,
        content_hash_global: &str,
    ) -> Result<Option<(String, String)>>;
}

const CHUNK_COLUMNS: &str = "id, source, content, content_hash, pdf_hash, \
     content_hash_global, page_number, chunk_type, word_count, embedding";

pub struct PgVectorStore {
    pool: PgPool,
}

impl PgVectorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorIndex for PgVectorStore {
    async fn upsert(&self, chunks: Vec<ChunkRecord>) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let mut transaction = self.pool.begin().await?;
        let written = chunks.len();

        for chunk in chunks {
            sqlx::query(
                r#"INSERT INTO rag_chunks
                   (id, source, content, content_hash, pdf_hash,
                    content_hash_global, page_number, chunk_type, word_count, embedding)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                   ON CONFLICT (id) DO UPDATE SET
                       content = EXCLUDED.content,
                       pdf_hash = EXCLUDED.pdf_hash,
                       content_hash_global = EXCLUDED.content_hash_global,
                       page_number = EXCLUDED.page_number,
                       chunk_type = EXCLUDED.chunk_type,
                       word_count = EXCLUDED.word_count,
                       embedding = EXCLUDED.embedding"#,
            )
            .bind(&chunk.id)
            .bind(&chunk.source)
            .bind(&chunk.content)
            .bind(&chunk.content_hash)
            .bind(&chunk.pdf_hash)
            .bind(&chunk.content_hash_global)
            .bind(chunk.page_number)
            .bind(&chunk.chunk_type)
            .bind(chunk.word_count)
            .bind(chunk.embedding)
            .execute(&mut *transaction)
            .await?;
        }

        transaction.commit().await?;
        debug!("Upserted {} chunks", written);
        Ok(written)
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&ChunkFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let (conds, binds) = filter
            .map(|f| f.conditions(2))
            .unwrap_or((Vec::new(), Vec::new()));

        let where_clause = if conds.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conds.join(" AND "))
        };

        let limit_param = 2 + binds.len();
        let sql = format!(
            "SELECT {CHUNK_COLUMNS}, (1 - (embedding <=> $1))::float4 AS score \
             FROM rag_chunks {where_clause} \
             ORDER BY embedding <=> $1 LIMIT ${limit_param}"
        );

        let mut query_builder =
            sqlx::query_as::<_, ScoredChunk>(&sql).bind(Vector::from(query.to_vec()));
        for value in binds {
            query_builder = query_builder.bind(value.to_string());
        }

        let chunks = query_builder
            .bind(k as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(chunks)
    }

    async fn mmr_search(
        &self,
        query: &[f32],
        k: usize,
        fetch_k: usize,
        lambda: f32,
        min_score: Option<f32>,
        filter: Option<&ChunkFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        let mut candidates = self
            .similarity_search(query, fetch_k.max(k), filter)
            .await?;

        if let Some(threshold) = min_score {
            candidates.retain(|c| c.score >= threshold);
        }

        if candidates.len() <= k {
            return Ok(candidates);
        }

        let candidate_embeddings: Vec<Vec<f32>> =
            candidates.iter().map(|c| c.embedding.to_vec()).collect();

        let selected = maximal_marginal_relevance(query, &candidate_embeddings, k, lambda)?;

        Ok(selected
            .into_iter()
            .map(|i| candidates[i].clone())
            .collect())
    }

    async fn delete(&self, filter: &ChunkFilter) -> Result<u64> {
        if filter.is_empty() {
            anyhow::bail!("Refusing unfiltered delete; use clear() to wipe the store");
        }

        let (conds, binds) = filter.conditions(1);
        let sql = format!("DELETE FROM rag_chunks WHERE {}", conds.join(" AND "));

        let mut query_builder = sqlx::query(&sql);
        for value in binds {
            query_builder = query_builder.bind(value.to_string());
        }

        let result = query_builder.execute(&self.pool).await?;
        let removed = result.rows_affected();
        debug!("Deleted {} chunks matching {:?}", removed, filter);
        Ok(removed)
    }

    async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rag_chunks")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count(&self) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM rag_chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn contains(&self, filter: &ChunkFilter) -> Result<bool> {
        if filter.is_empty() {
            return Ok(self.count().await? > 0);
        }

        let (conds, binds) = filter.conditions(1);
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM rag_chunks WHERE {})",
            conds.join(" AND ")
        );

        let mut query_builder = sqlx::query_scalar::<_, bool>(&sql);
        for value in binds {
            query_builder = query_builder.bind(value.to_string());
        }

        Ok(query_builder.fetch_one(&self.pool).await?)
    }

    async fn embeddings(&self) -> Result<Vec<(String, Vec<f32>)>> {
        #[derive(FromRow)]
        struct EmbeddingRow {
            id: String,
            embedding: Vector,
        }

        // Keyset pagination keeps memory bounded for large corpora
        const PAGE: i64 = 1024;
        let mut out = Vec::new();
        let mut last_id = String::new();

        loop {
            let rows = sqlx::query_as::<_, EmbeddingRow>(
                "SELECT id, embedding FROM rag_chunks WHERE id > $1 ORDER BY id LIMIT $2",
            )
            .bind(&last_id)
            .bind(PAGE)
            .fetch_all(&self.pool)
            .await?;

            if rows.is_empty() {
                break;
            }

            last_id = rows.last().map(|r| r.id.clone()).unwrap_or_default();
            out.extend(rows.into_iter().map(|r| (r.id, r.embedding.to_vec())));
        }

        Ok(out)
    }

    async fn find_by_global_hash(
        &self,
        content_hash_global: &str,
    ) -> Result<Option<(String, String)>> {
        let row = sqlx::query_as::<_, (String, String)>(
            "SELECT pdf_hash, source FROM rag_chunks WHERE content_hash_global = $1 LIMIT 1",
        )
        .bind(content_hash_global)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_cache_key_is_deterministic() {
        let a = ChunkFilter::by_source("handbook.pdf");
        let b = ChunkFilter::by_source("handbook.pdf");
        assert_eq!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), ChunkFilter::default().cache_key());
    }

    #[test]
    fn test_filter_conditions_numbering() {
        let filter = ChunkFilter {
            source: Some("a.pdf".to_string()),
            pdf_hash: None,
            content_hash_global: Some("deadbeef".to_string()),
        };

        let (conds, binds) = filter.conditions(2);
        assert_eq!(conds, vec!["source = $2", "content_hash_global = $3"]);
        assert_eq!(binds, vec!["a.pdf", "deadbeef"]);
    }

    #[test]
    fn test_empty_filter() {
        assert!(ChunkFilter::default().is_empty());
        assert!(!ChunkFilter::by_pdf_hash("x").is_empty());
    }

    mod contract {
        use crate::database::vector_store::testing::InMemoryIndex;
        use crate::database::vector_store::{ChunkFilter, ChunkRecord, VectorIndex};
        use pgvector::Vector;

        fn chunk(id: &str, source: &str, embedding: Vec<f32>) -> ChunkRecord {
            ChunkRecord {
                id: id.to_string(),
                source: source.to_string(),
                content: format!("content {}", id),
                content_hash: id.to_string(),
                pdf_hash: format!("pdf_{}", source),
                content_hash_global: format!("glob_{}", source),
                page_number: 1,
                chunk_type: "text".to_string(),
                word_count: 2,
                embedding: Vector::from(embedding),
            }
        }

        #[tokio::test]
        async fn test_delete_by_source_touches_nothing_else() {
            let index = InMemoryIndex::new();
            index
                .upsert(vec![
                    chunk("a1", "alpha.pdf", vec![1.0, 0.0]),
                    chunk("a2", "alpha.pdf", vec![0.9, 0.1]),
                    chunk("b1", "beta.pdf", vec![0.0, 1.0]),
                ])
                .await
                .unwrap();

            let removed = index.delete(&ChunkFilter::by_source("alpha.pdf")).await.unwrap();
            assert_eq!(removed, 2);
            assert_eq!(index.count().await.unwrap(), 1);
            assert!(index
                .contains(&ChunkFilter::by_source("beta.pdf"))
                .await
                .unwrap());
            assert!(!index
                .contains(&ChunkFilter::by_source("alpha.pdf"))
                .await
                .unwrap());
        }

        #[tokio::test]
        async fn test_upsert_is_idempotent_on_id() {
            let index = InMemoryIndex::new();
            index
                .upsert(vec![chunk("a1", "alpha.pdf", vec![1.0, 0.0])])
                .await
                .unwrap();
            index
                .upsert(vec![chunk("a1", "alpha.pdf", vec![0.5, 0.5])])
                .await
                .unwrap();

            assert_eq!(index.count().await.unwrap(), 1);
        }

        #[tokio::test]
        async fn test_mmr_search_prefers_diverse_results() {
            let index = InMemoryIndex::new();
            index
                .upsert(vec![
                    chunk("dup1", "alpha.pdf", vec![1.0, 0.0]),
                    chunk("dup2", "alpha.pdf", vec![0.99, 0.01]),
                    chunk("other", "alpha.pdf", vec![0.6, 0.8]),
                ])
                .await
                .unwrap();

            let query = vec![1.0, 0.0];
            let selected = index
                .mmr_search(&query, 2, 3, 0.3, None, None)
                .await
                .unwrap();

            assert_eq!(selected.len(), 2);
            assert_eq!(selected[0].id, "dup1");
            assert_eq!(selected[1].id, "other");
        }
    }
}
