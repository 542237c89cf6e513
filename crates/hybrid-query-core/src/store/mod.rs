//! Vector store abstraction.
//!
//! The [`VectorStore`] trait defines the operations the engine needs from a
//! similarity index, enabling pluggable backends (SQLite in the app crate,
//! in-memory here).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! Backend failures are reported as [`EngineError::RetrievalUnavailable`];
//! stores never retry internally.

pub mod memory;

use async_trait::async_trait;

use crate::error::{EngineError, Result};
use crate::models::{DocumentChunk, MetadataValue, RetrievalCandidate};

/// Conjunction of metadata equality constraints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    pub equals: Vec<(String, MetadataValue)>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.equals.push((key.into(), value.into()));
        self
    }

    /// Whether a chunk satisfies every constraint.
    pub fn matches(&self, chunk: &DocumentChunk) -> bool {
        self.equals
            .iter()
            .all(|(k, v)| chunk.metadata.get(k) == Some(v))
    }
}

/// Abstract similarity index over [`DocumentChunk`]s.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorStore::upsert) | Insert chunks whose id is new |
/// | [`search`](VectorStore::search) | Top-k nearest chunks as candidates |
/// | [`purge`](VectorStore::purge) | Explicit deletion |
/// | [`count`](VectorStore::count) | Number of stored chunks |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert chunks whose id is not yet stored; returns the number inserted.
    ///
    /// Chunks with an empty embedding, or whose dimensionality differs from
    /// the stored chunks, are rejected with `InvalidArgument` before anything
    /// is written.
    async fn upsert(&self, chunks: &[DocumentChunk]) -> Result<usize>;

    /// Nearest chunks by similarity, best first, ranks starting at 1.
    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: i64,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievalCandidate>>;

    /// Delete chunks by id; returns the number removed.
    async fn purge(&self, ids: &[String]) -> Result<usize>;

    async fn count(&self) -> Result<usize>;

    /// Whether a chunk id is already stored.
    async fn contains(&self, id: &str) -> Result<bool>;
}

/// Validate a batch against the store's dimensionality (`None` when empty).
///
/// Returns the batch dimensionality.
pub fn check_batch(chunks: &[DocumentChunk], stored_dims: Option<usize>) -> Result<Option<usize>> {
    let mut dims = stored_dims;
    for chunk in chunks {
        if chunk.embedding.is_empty() {
            return Err(EngineError::InvalidArgument(format!(
                "chunk {} has an empty embedding",
                chunk.id
            )));
        }
        match dims {
            Some(d) if d != chunk.embedding.len() => {
                return Err(EngineError::InvalidArgument(format!(
                    "chunk {} has dimensionality {}, expected {}",
                    chunk.id,
                    chunk.embedding.len(),
                    d
                )));
            }
            Some(_) => {}
            None => dims = Some(chunk.embedding.len()),
        }
    }
    Ok(dims)
}

/// Reject a query vector whose length differs from the stored vectors.
///
/// An empty store (`stored_dims == None`) accepts any query.
pub fn check_query_dims(query_embedding: &[f32], stored_dims: Option<usize>) -> Result<()> {
    if query_embedding.is_empty() {
        return Err(EngineError::InvalidArgument(
            "query embedding must not be empty".to_string(),
        ));
    }
    match stored_dims {
        Some(d) if d != query_embedding.len() => Err(EngineError::InvalidArgument(format!(
            "query embedding has dimensionality {}, store holds {}",
            query_embedding.len(),
            d
        ))),
        _ => Ok(()),
    }
}

/// Validate `top_k` and convert it to a result limit.
pub fn check_top_k(top_k: i64) -> Result<usize> {
    if top_k <= 0 {
        return Err(EngineError::InvalidArgument(format!(
            "top_k must be positive, got {}",
            top_k
        )));
    }
    Ok(top_k as usize)
}

/// Sort scored chunks best first (ties by id) and keep the top `limit` as candidates.
pub fn rank_candidates(mut scored: Vec<(f32, &DocumentChunk)>, limit: usize) -> Vec<RetrievalCandidate> {
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.id.cmp(&b.1.id))
    });
    scored
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(i, (score, chunk))| RetrievalCandidate::from_chunk(chunk, score as f64, i + 1))
        .collect()
}
