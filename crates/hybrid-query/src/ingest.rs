//! Vector store population from the target database.
//!
//! Every row of every selected table becomes one chunk:
//!
//! ```text
//! Table: customers
//! id: 1
//! name: Ada
//! ```
//!
//! Chunk ids are derived from the table name and the row's key, so repeated
//! runs skip rows that are already stored and only embed new ones. The key is
//! the primary key value when the table has a single-column primary key, and
//! a digest of the rendered row otherwise.

use serde::Serialize;
use sqlx::SqlitePool;

use hybrid_query_core::embedding::EmbeddingProvider;
use hybrid_query_core::error::{EngineError, Result};
use hybrid_query_core::executor::row_digest;
use hybrid_query_core::models::{render_value, DocumentChunk, MetadataValue, SqlRow};
use hybrid_query_core::schema::{SchemaSnapshot, TableSchema};
use hybrid_query_core::store::VectorStore;

use crate::config::Config;
use crate::executor::decode_row;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PopulateStats {
    pub tables: usize,
    pub rows_seen: usize,
    pub skipped: usize,
    pub inserted: usize,
}

/// Stable key of a row within its table.
pub fn row_identity(table: &TableSchema, row: &SqlRow) -> String {
    table
        .single_primary_key()
        .and_then(|i| row.values.get(i))
        .filter(|v| !v.is_null())
        .map(render_value)
        .unwrap_or_else(|| row_digest(&table.name, row))
}

/// Deterministic chunk id for a row: `row:<table>:<key>`.
pub fn row_chunk_id(table: &TableSchema, row: &SqlRow) -> String {
    format!("row:{}:{}", table.name, row_identity(table, row))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Embed and store every row not yet present in the vector store.
///
/// `tables` restricts the tables read (case-insensitive); empty means every
/// table in `schema`. Returns counters; `inserted` is the number of new chunks.
pub async fn populate_vector_store(
    target: &SqlitePool,
    schema: &SchemaSnapshot,
    tables: &[String],
    store: &dyn VectorStore,
    embedder: &dyn EmbeddingProvider,
    batch_size: usize,
) -> Result<PopulateStats> {
    if embedder.dims() == 0 {
        return Err(EngineError::EmbeddingUnavailable(
            "populating the vector store requires an embedding provider".to_string(),
        ));
    }
    let batch_size = batch_size.max(1);
    let mut stats = PopulateStats::default();

    for table in &schema.tables {
        if !tables.is_empty() && !tables.iter().any(|t| t.eq_ignore_ascii_case(&table.name)) {
            continue;
        }
        stats.tables += 1;

        let rows = sqlx::query(&format!("SELECT * FROM {}", quote_ident(&table.name)))
            .fetch_all(target)
            .await
            .map_err(|e| EngineError::RetrievalUnavailable(format!("reading {}: {}", table.name, e)))?;

        let mut pending = Vec::new();
        for row in rows.iter().map(decode_row) {
            stats.rows_seen += 1;
            let id = row_chunk_id(table, &row);
            if store.contains(&id).await? || pending.iter().any(|(p, _): &(String, SqlRow)| p == &id) {
                stats.skipped += 1;
                continue;
            }
            pending.push((id, row));
        }

        for batch in pending.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|(_, row)| row.render(&table.name)).collect();
            let vectors = embedder.embed(&texts).await?;
            let chunks: Vec<DocumentChunk> = batch
                .iter()
                .zip(texts)
                .zip(vectors)
                .map(|(((id, row), text), vector)| {
                    let key = row_identity(table, row);
                    DocumentChunk::new(id.clone(), text, vector)
                        .with_metadata("table", table.name.as_str())
                        .with_metadata("id", MetadataValue::from(key))
                })
                .collect();
            stats.inserted += store.upsert(&chunks).await?;
        }

        tracing::info!(table = %table.name, rows = rows.len(), "table populated");
    }

    Ok(stats)
}

/// `hq populate`: fill the vector store from the configured database.
pub async fn run_populate(config: &Config) -> anyhow::Result<()> {
    use anyhow::Context;
    use std::sync::Arc;

    if !config.embedding.is_enabled() {
        anyhow::bail!("populate requires an embedding provider; set [embedding] provider");
    }

    let store_pool = crate::db::connect(config).await?;
    crate::migrate::apply(&store_pool).await?;
    let store = crate::sqlite_store::SqliteVectorStore::new(store_pool.clone(), config.store.similarity);

    let target = crate::db::connect_target(&config.database.path)
        .await
        .with_context(|| format!("Failed to open database: {}", config.database.path.display()))?;
    let schema = crate::schema_cache::introspect(&target, &config.database.tables).await?;
    let embedder: Arc<dyn EmbeddingProvider> = crate::embedding::create_provider(&config.embedding)?;

    let stats = populate_vector_store(
        &target,
        &schema,
        &config.database.tables,
        &store,
        embedder.as_ref(),
        config.embedding.batch_size,
    )
    .await?;

    println!("populate");
    println!("  tables: {}", stats.tables);
    println!("  rows seen: {}", stats.rows_seen);
    println!("  already stored: {}", stats.skipped);
    println!("  chunks inserted: {}", stats.inserted);
    println!("ok");

    target.close().await;
    store_pool.close().await;
    Ok(())
}
