//! Live schema introspection with swap-on-refresh caching.
//!
//! The cache holds an `Arc<SchemaSnapshot>` behind a lock that is only taken
//! to clone or replace the `Arc`. A refresh builds a complete snapshot first
//! and then swaps it in, so readers always see either the old or the new
//! schema in full.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use sqlx::{Row, SqlitePool};
use tokio::task::JoinHandle;

use hybrid_query_core::error::{EngineError, Result};
use hybrid_query_core::schema::{ColumnSchema, SchemaSnapshot, TableSchema};

fn unavailable(e: sqlx::Error) -> EngineError {
    EngineError::RetrievalUnavailable(format!("schema introspection: {}", e))
}

/// Read table and column declarations from a SQLite database.
///
/// Tables are returned in creation order; `only` restricts the result to the
/// named tables (case-insensitive) when non-empty.
pub async fn introspect(pool: &SqlitePool, only: &[String]) -> Result<SchemaSnapshot> {
    let names: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY rowid",
    )
    .fetch_all(pool)
    .await
    .map_err(unavailable)?;

    let mut tables = Vec::new();
    for name in names {
        if !only.is_empty() && !only.iter().any(|t| t.eq_ignore_ascii_case(&name)) {
            continue;
        }
        let rows = sqlx::query(
            r#"SELECT name, type, "notnull" AS not_null, pk FROM pragma_table_info(?) ORDER BY cid"#,
        )
        .bind(&name)
        .fetch_all(pool)
        .await
        .map_err(unavailable)?;

        let columns = rows
            .iter()
            .map(|row| {
                let not_null: i64 = row.get("not_null");
                let pk: i64 = row.get("pk");
                ColumnSchema::new(
                    row.get::<String, _>("name"),
                    row.get::<String, _>("type"),
                    not_null == 0,
                )
                .with_primary_key(pk > 0)
            })
            .collect();
        tables.push(TableSchema::new(name, columns));
    }
    Ok(SchemaSnapshot::new(tables))
}

pub struct SchemaCache {
    pool: SqlitePool,
    tables: Vec<String>,
    refresh_interval: Duration,
    current: RwLock<Arc<SchemaSnapshot>>,
}

impl SchemaCache {
    /// Introspect once and build the cache.
    pub async fn load(pool: SqlitePool, tables: Vec<String>, refresh_interval: Duration) -> Result<Self> {
        let snapshot = introspect(&pool, &tables).await?;
        tracing::info!(tables = snapshot.tables.len(), "schema loaded");
        Ok(Self {
            pool,
            tables,
            refresh_interval,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<SchemaSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Introspect and swap in a complete new snapshot.
    pub async fn refresh(&self) -> Result<Arc<SchemaSnapshot>> {
        let fresh = Arc::new(introspect(&self.pool, &self.tables).await?);
        match self.current.write() {
            Ok(mut guard) => *guard = Arc::clone(&fresh),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&fresh),
        }
        tracing::debug!(tables = fresh.tables.len(), "schema refreshed");
        Ok(fresh)
    }

    /// Refresh when the current snapshot is older than the refresh interval.
    ///
    /// A failed refresh keeps serving the previous snapshot.
    pub async fn refresh_if_stale(&self) -> Arc<SchemaSnapshot> {
        let current = self.snapshot();
        let age = chrono::Utc::now() - current.fetched_at;
        let stale = age
            .to_std()
            .map(|a| a >= self.refresh_interval)
            .unwrap_or(false);
        if !stale {
            return current;
        }
        match self.refresh().await {
            Ok(fresh) => fresh,
            Err(e) => {
                tracing::warn!(error = %e, "schema refresh failed, keeping previous snapshot");
                current
            }
        }
    }

    /// Refresh on a fixed interval until the task is aborted.
    pub fn spawn_refresher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.refresh_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh().await {
                    tracing::warn!(error = %e, "background schema refresh failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqlitePool, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("shop.sqlite");
        let writer = db::connect_store(&path).await.unwrap();
        sqlx::query("CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .execute(&writer)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER, item TEXT)")
            .execute(&writer)
            .await
            .unwrap();
        let reader = db::connect_target(&path).await.unwrap();
        (tmp, writer, reader)
    }

    #[tokio::test]
    async fn test_introspect_declaration_order() {
        let (_tmp, _writer, reader) = setup().await;
        let snapshot = introspect(&reader, &[]).await.unwrap();
        assert_eq!(snapshot.table_names(), vec!["customers", "orders"]);
        let customers = snapshot.table("customers").unwrap();
        assert_eq!(customers.columns[1].name, "name");
        assert!(!customers.columns[1].nullable);
        assert_eq!(
            snapshot.table("orders").unwrap().describe(),
            "orders(id INTEGER, customer_id INTEGER, item TEXT)"
        );
    }

    #[tokio::test]
    async fn test_table_allow_list() {
        let (_tmp, _writer, reader) = setup().await;
        let snapshot = introspect(&reader, &["ORDERS".to_string()]).await.unwrap();
        assert_eq!(snapshot.table_names(), vec!["orders"]);
    }

    #[tokio::test]
    async fn test_refresh_swaps_whole_snapshot() {
        let (_tmp, writer, reader) = setup().await;
        let cache = SchemaCache::load(reader, Vec::new(), Duration::from_secs(3600))
            .await
            .unwrap();
        let before = cache.snapshot();

        sqlx::query("CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT)")
            .execute(&writer)
            .await
            .unwrap();

        // not stale yet
        assert_eq!(cache.refresh_if_stale().await.tables.len(), 2);

        let after = cache.refresh().await.unwrap();
        assert_eq!(before.tables.len(), 2);
        assert_eq!(after.tables.len(), 3);
        assert_eq!(cache.snapshot().tables.len(), 3);
    }
}
