//! Vector store schema.
//!
//! ```text
//! chunks         id (PK), text, metadata_json, created_at
//! chunk_vectors  chunk_id (PK, FK chunks.id), dims, embedding (LE f32 BLOB)
//! ```
//!
//! Every statement is `IF NOT EXISTS`, so [`apply`] runs on each startup and
//! `hq init` may be repeated. The target database is never migrated.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// `hq init`: create the vector store file and its tables.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or a statement fails.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the vector store tables (idempotent).
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_created_at ON chunks(created_at)")
        .execute(pool)
        .await?;

    Ok(())
}
