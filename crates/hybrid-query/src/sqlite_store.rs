//! SQLite-backed [`VectorStore`] implementation.
//!
//! Chunks live in `chunks` (text + metadata JSON) and their vectors in
//! `chunk_vectors` as little-endian f32 BLOBs. Search is brute-force over all
//! stored vectors, like the in-memory store.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use hybrid_query_core::embedding::{blob_to_vec, vec_to_blob, Similarity};
use hybrid_query_core::error::{EngineError, Result};
use hybrid_query_core::models::{DocumentChunk, MetadataValue, RetrievalCandidate};
use hybrid_query_core::store::{
    check_batch, check_query_dims, check_top_k, rank_candidates, MetadataFilter, VectorStore,
};

/// SQLite implementation of the [`VectorStore`] trait.
pub struct SqliteVectorStore {
    pool: SqlitePool,
    similarity: Similarity,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool, similarity: Similarity) -> Self {
        Self { pool, similarity }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn unavailable(e: sqlx::Error) -> EngineError {
    EngineError::RetrievalUnavailable(format!("vector store: {}", e))
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, chunks: &[DocumentChunk]) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let stored_dims: Option<i64> = sqlx::query_scalar("SELECT dims FROM chunk_vectors LIMIT 1")
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?;
        check_batch(chunks, stored_dims.map(|d| d as usize))?;

        let now = chrono::Utc::now().timestamp();
        let mut inserted = 0;
        for chunk in chunks {
            let metadata_json = serde_json::to_string(&chunk.metadata)
                .map_err(|e| EngineError::InvalidArgument(format!("chunk metadata: {}", e)))?;
            let result = sqlx::query(
                "INSERT OR IGNORE INTO chunks (id, text, metadata_json, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.text)
            .bind(&metadata_json)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

            if result.rows_affected() == 0 {
                continue;
            }

            sqlx::query("INSERT INTO chunk_vectors (chunk_id, dims, embedding) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(chunk.embedding.len() as i64)
                .bind(vec_to_blob(&chunk.embedding))
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
            inserted += 1;
        }

        tx.commit().await.map_err(unavailable)?;
        Ok(inserted)
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: i64,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievalCandidate>> {
        let limit = check_top_k(top_k)?;
        let stored_dims: Option<i64> = sqlx::query_scalar("SELECT dims FROM chunk_vectors LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        check_query_dims(query_embedding, stored_dims.map(|d| d as usize))?;

        let rows = sqlx::query(
            r#"
            SELECT c.id, c.text, c.metadata_json, cv.embedding
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let mut chunks = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.get("id");
            let blob: Vec<u8> = row.get("embedding");
            let metadata_json: String = row.get("metadata_json");
            let metadata: BTreeMap<String, MetadataValue> = serde_json::from_str(&metadata_json)
                .map_err(|e| {
                    EngineError::RetrievalUnavailable(format!("chunk {} metadata: {}", id, e))
                })?;
            let chunk = DocumentChunk {
                id,
                text: row.get("text"),
                embedding: blob_to_vec(&blob),
                metadata,
            };
            if filter.map_or(true, |f| f.matches(&chunk)) {
                chunks.push(chunk);
            }
        }

        let scored: Vec<(f32, &DocumentChunk)> = chunks
            .iter()
            .map(|c| (self.similarity.score(query_embedding, &c.embedding), c))
            .collect();
        Ok(rank_candidates(scored, limit))
    }

    async fn purge(&self, ids: &[String]) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let mut removed = 0;
        for id in ids {
            sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
            let result = sqlx::query("DELETE FROM chunks WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await.map_err(unavailable)?;
        Ok(removed)
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(n as usize)
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        let found: Option<String> = sqlx::query_scalar("SELECT id FROM chunks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(found.is_some())
    }
}
