//! Read-only execution of validated queries against the target database.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, SqlitePool, ValueRef};

use hybrid_query_core::error::{EngineError, Result};
use hybrid_query_core::executor::SqlExecutor;
use hybrid_query_core::models::{GeneratedQuery, SqlRow};

/// Executes `valid` queries on a read-only pool, capped at `max_rows`.
pub struct SqliteExecutor {
    pool: SqlitePool,
    max_rows: i64,
}

impl SqliteExecutor {
    pub fn new(pool: SqlitePool, max_rows: i64) -> Self {
        Self { pool, max_rows }
    }
}

#[async_trait]
impl SqlExecutor for SqliteExecutor {
    async fn execute(&self, query: &GeneratedQuery) -> Result<Vec<SqlRow>> {
        if let Some(err) = query.validation_error() {
            return Err(err);
        }

        let wrapped = format!("SELECT * FROM ({}) LIMIT ?", query.sql);
        let rows = sqlx::query(&wrapped)
            .bind(self.max_rows)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::RetrievalUnavailable(format!("query execution: {}", e)))?;

        tracing::debug!(rows = rows.len(), sql = %query.sql, "query executed");
        Ok(rows.iter().map(decode_row).collect())
    }
}

pub(crate) fn decode_row(row: &SqliteRow) -> SqlRow {
    let columns: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let values = (0..columns.len()).map(|i| decode_cell(row, i)).collect();
    SqlRow::new(columns, values)
}

/// Decode by runtime storage class; SQLite columns are dynamically typed.
fn decode_cell(row: &SqliteRow, i: usize) -> serde_json::Value {
    match row.try_get_raw(i) {
        Ok(raw) if raw.is_null() => return serde_json::Value::Null,
        Ok(_) => {}
        Err(_) => return serde_json::Value::Null,
    }
    if let Ok(v) = row.try_get::<i64, _>(i) {
        return serde_json::Value::from(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(i) {
        return serde_json::Value::from(v);
    }
    if let Ok(v) = row.try_get::<String, _>(i) {
        return serde_json::Value::String(v);
    }
    if let Ok(v) = row.try_get::<Vec<u8>, _>(i) {
        return serde_json::Value::String(format!("<blob {} bytes>", v.len()));
    }
    serde_json::Value::Null
}
