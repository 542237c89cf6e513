//! SQL execution seam and row-to-candidate conversion.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::models::{
    render_value, CandidateContent, CandidateSource, GeneratedQuery, RetrievalCandidate, SourceRef,
    SqlRow,
};

/// Executes validated, read-only queries against the target database.
///
/// Implementations must refuse queries whose status is not `valid` and
/// report connection failures as `RetrievalUnavailable`.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, query: &GeneratedQuery) -> Result<Vec<SqlRow>>;
}

/// Stable identity of a result row.
///
/// Single-table results with an `id` column use that value; anything else
/// uses a digest of the rendered row.
pub fn row_key(tables: &[String], row: &SqlRow) -> String {
    if tables.len() == 1 {
        if let Some(id) = row.get("id").filter(|v| !v.is_null()) {
            return render_value(id);
        }
    }
    row_digest(&tables.join(", "), row)
}

/// First 16 hex digits of the SHA-256 of the rendered row.
pub fn row_digest(label: &str, row: &SqlRow) -> String {
    let digest = Sha256::digest(row.render(label).as_bytes());
    format!("{:x}", digest)[..16].to_string()
}

/// Turn query results into SQL candidates, ranked in result order.
pub fn rows_to_candidates(query: &GeneratedQuery, rows: Vec<SqlRow>) -> Vec<RetrievalCandidate> {
    let label = query.target_tables.join(", ");
    let prefix = query.target_tables.join("+");
    rows.into_iter()
        .enumerate()
        .map(|(i, row)| {
            let key = row_key(&query.target_tables, &row);
            RetrievalCandidate {
                id: format!("sql:{}:{}", prefix, key),
                source: CandidateSource::Sql,
                content: CandidateContent::Row {
                    label: label.clone(),
                    row,
                },
                provenance: SourceRef::Row {
                    tables: query.target_tables.clone(),
                    key,
                },
                score: 1.0,
                rank: i + 1,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_table_rows_use_id() {
        let q = GeneratedQuery::valid("SELECT * FROM customers", vec!["customers".into()]);
        let rows = vec![
            SqlRow::new(vec!["id".into(), "name".into()], vec![json!(1), json!("Ada")]),
            SqlRow::new(vec!["id".into(), "name".into()], vec![json!(2), json!("Bob")]),
        ];
        let cands = rows_to_candidates(&q, rows);
        assert_eq!(cands[0].id, "sql:customers:1");
        assert_eq!(cands[1].rank, 2);
        assert_eq!(cands[0].text(), "Table: customers\nid: 1\nname: Ada");
        assert_eq!(
            cands[1].provenance,
            SourceRef::Row {
                tables: vec!["customers".into()],
                key: "2".into()
            }
        );
    }

    #[test]
    fn test_join_rows_use_digest() {
        let q = GeneratedQuery::valid(
            "SELECT c.name, o.item FROM customers c JOIN orders o ON o.customer_id = c.id",
            vec!["customers".into(), "orders".into()],
        );
        let row = SqlRow::new(vec!["name".into(), "item".into()], vec![json!("Ada"), json!("lamp")]);
        let cands = rows_to_candidates(&q, vec![row.clone()]);
        let key = row_key(&q.target_tables, &row);
        assert_eq!(key.len(), 16);
        assert_eq!(cands[0].id, format!("sql:customers+orders:{}", key));
        assert!(cands[0].text().starts_with("Table: customers, orders\n"));
    }
}
