//! In-memory [`VectorStore`] implementation for testing and offline runs.
//!
//! Uses a `HashMap` behind `std::sync::RwLock` for thread safety.
//! Search is brute-force similarity over all stored vectors.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::Similarity;
use crate::error::{EngineError, Result};
use crate::models::{DocumentChunk, RetrievalCandidate};

use super::{check_batch, check_query_dims, check_top_k, rank_candidates, MetadataFilter, VectorStore};

/// In-memory vector store.
pub struct InMemoryVectorStore {
    similarity: Similarity,
    chunks: RwLock<HashMap<String, DocumentChunk>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::with_similarity(Similarity::Cosine)
    }

    pub fn with_similarity(similarity: Similarity) -> Self {
        Self {
            similarity,
            chunks: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> EngineError {
    EngineError::RetrievalUnavailable("in-memory store lock poisoned".to_string())
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, chunks: &[DocumentChunk]) -> Result<usize> {
        let mut stored = self.chunks.write().map_err(poisoned)?;
        let stored_dims = stored.values().next().map(|c| c.embedding.len());
        check_batch(chunks, stored_dims)?;

        let mut inserted = 0;
        for chunk in chunks {
            if !stored.contains_key(&chunk.id) {
                stored.insert(chunk.id.clone(), chunk.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: i64,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievalCandidate>> {
        let limit = check_top_k(top_k)?;
        let stored = self.chunks.read().map_err(poisoned)?;
        check_query_dims(query_embedding, stored.values().next().map(|c| c.embedding.len()))?;
        let scored: Vec<(f32, &DocumentChunk)> = stored
            .values()
            .filter(|c| filter.map_or(true, |f| f.matches(c)))
            .map(|c| (self.similarity.score(query_embedding, &c.embedding), c))
            .collect();
        Ok(rank_candidates(scored, limit))
    }

    async fn purge(&self, ids: &[String]) -> Result<usize> {
        let mut stored = self.chunks.write().map_err(poisoned)?;
        Ok(ids.iter().filter(|id| stored.remove(*id).is_some()).count())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.chunks.read().map_err(poisoned)?.len())
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.chunks.read().map_err(poisoned)?.contains_key(id))
    }
}
