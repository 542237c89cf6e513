//! SQLite connection pools.
//!
//! Two databases are involved in every turn, opened with different modes:
//!
//! | Pool | Opened by | Mode | Holds |
//! |------|-----------|------|-------|
//! | vector store | [`connect`] / [`connect_store`] | read-write, created if missing, WAL | `chunks`, `chunk_vectors` |
//! | target | [`connect_target`] | read-only, must exist | the data questions are asked about |
//!
//! The vector store runs in WAL mode so `hq populate` can write while a
//! server is searching. The target pool is opened with SQLite's read-only
//! flag, so a statement that slips past validation still cannot write.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

use crate::config::Config;

const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

async fn pool(options: SqliteConnectOptions) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options.busy_timeout(BUSY_TIMEOUT))
        .await?;
    Ok(pool)
}

/// Open the vector store named by `[store] path`.
///
/// # Errors
///
/// See [`connect_store`].
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    connect_store(&config.store.path).await
}

/// Open (and create if needed) a vector store database at `db_path`.
///
/// Parent directories are created first.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the file cannot
/// be opened as SQLite.
pub async fn connect_store(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);
    pool(options).await
}

/// Open the target database read-only.
///
/// # Errors
///
/// Returns an error if the file does not exist or is not a SQLite database.
/// The file is never created.
pub async fn connect_target(db_path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .read_only(true)
        .create_if_missing(false);
    pool(options).await
}
