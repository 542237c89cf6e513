//! Core data models used throughout Hybrid Query.
//!
//! These types represent the stored chunks, conversation turns, retrieval
//! candidates, and generated queries that flow through a single turn of the
//! engine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Approximate characters-per-token ratio used for every budget calculation.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token size of a text (`ceil(chars / 4)`).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Scalar metadata value attached to a [`DocumentChunk`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(b) => write!(f, "{}", b),
            MetadataValue::Int(i) => write!(f, "{}", i),
            MetadataValue::Float(x) => write!(f, "{}", x),
            MetadataValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Text(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Text(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        MetadataValue::Int(i)
    }
}

impl From<f64> for MetadataValue {
    fn from(x: f64) -> Self {
        MetadataValue::Float(x)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

/// A text chunk with its embedding, as stored in a vector store.
///
/// Chunks are immutable once stored: stores ignore upserts for ids they
/// already hold, and only an explicit purge removes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, MetadataValue>,
}

impl DocumentChunk {
    pub fn new(id: impl Into<String>, text: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            embedding,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Speaker of a [`QueryTurn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One message of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl QueryTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.text)
    }
}

/// Which retrieval branch produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateSource {
    Vector,
    Sql,
}

impl fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateSource::Vector => write!(f, "vector"),
            CandidateSource::Sql => write!(f, "sql"),
        }
    }
}

/// A single result row of an executed query.
///
/// Cell values are JSON scalars so rows serialize directly into HTTP
/// responses and render deterministically into prompt text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlRow {
    pub columns: Vec<String>,
    pub values: Vec<serde_json::Value>,
}

impl SqlRow {
    pub fn new(columns: Vec<String>, values: Vec<serde_json::Value>) -> Self {
        Self { columns, values }
    }

    /// Look up a cell by column name (case-insensitive).
    pub fn get(&self, column: &str) -> Option<&serde_json::Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|i| self.values.get(i))
    }

    /// Render the row as `Table: <label>` followed by one `column: value` line per cell.
    pub fn render(&self, table_label: &str) -> String {
        render_row(table_label, &self.columns, &self.values)
    }
}

/// Render a row in the `Table: t\ncol: val` layout shared by ingestion and SQL candidates.
///
/// Ingested row chunks and live SQL rows of a single table render to the same
/// text, so fusion deduplicates them as one fact.
pub fn render_row(table_label: &str, columns: &[String], values: &[serde_json::Value]) -> String {
    let mut out = format!("Table: {}", table_label);
    for (col, val) in columns.iter().zip(values.iter()) {
        out.push('\n');
        out.push_str(col);
        out.push_str(": ");
        out.push_str(&render_value(val));
    }
    out
}

/// Render a JSON scalar without quotes around strings.
pub fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Payload of a retrieval candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CandidateContent {
    Text { text: String },
    Row { label: String, row: SqlRow },
}

impl CandidateContent {
    /// Text form used for prompts, token estimation, and deduplication.
    pub fn as_text(&self) -> String {
        match self {
            CandidateContent::Text { text } => text.clone(),
            CandidateContent::Row { label, row } => row.render(label),
        }
    }
}

/// Traceable origin of a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceRef {
    /// A stored vector chunk.
    Chunk { chunk_id: String },
    /// A result row of the generated query.
    Row { tables: Vec<String>, key: String },
}

/// A scored piece of context from either retrieval branch.
///
/// `rank` is the 1-based position within the producing branch until fusion
/// reassigns it to the position within the fused sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    pub id: String,
    pub source: CandidateSource,
    pub content: CandidateContent,
    pub provenance: SourceRef,
    pub score: f64,
    pub rank: usize,
}

impl RetrievalCandidate {
    /// Build a vector candidate from a stored chunk; the chunk id doubles as candidate id.
    pub fn from_chunk(chunk: &DocumentChunk, score: f64, rank: usize) -> Self {
        Self {
            id: chunk.id.clone(),
            source: CandidateSource::Vector,
            content: CandidateContent::Text {
                text: chunk.text.clone(),
            },
            provenance: SourceRef::Chunk {
                chunk_id: chunk.id.clone(),
            },
            score: score.clamp(0.0, 1.0),
            rank,
        }
    }

    pub fn text(&self) -> String {
        self.content.as_text()
    }

    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.text())
    }
}

/// Outcome of validating a generated statement against the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Valid,
    Rejected,
    Unparseable,
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationStatus::Valid => write!(f, "valid"),
            ValidationStatus::Rejected => write!(f, "rejected"),
            ValidationStatus::Unparseable => write!(f, "unparseable"),
        }
    }
}

/// A candidate SQL statement produced by the query builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedQuery {
    pub sql: String,
    pub target_tables: Vec<String>,
    pub status: ValidationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl GeneratedQuery {
    pub fn valid(sql: impl Into<String>, target_tables: Vec<String>) -> Self {
        Self {
            sql: sql.into(),
            target_tables,
            status: ValidationStatus::Valid,
            reason: None,
        }
    }

    pub fn rejected(sql: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            target_tables: Vec::new(),
            status: ValidationStatus::Rejected,
            reason: Some(reason.into()),
        }
    }

    pub fn unparseable(sql: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            target_tables: Vec::new(),
            status: ValidationStatus::Unparseable,
            reason: Some(reason.into()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == ValidationStatus::Valid
    }

    /// The error kind matching a failed validation, or `None` when valid.
    pub fn validation_error(&self) -> Option<EngineError> {
        let reason = self.reason.clone().unwrap_or_default();
        match self.status {
            ValidationStatus::Valid => None,
            ValidationStatus::Rejected => Some(EngineError::QueryRejected(reason)),
            ValidationStatus::Unparseable => Some(EngineError::QueryUnparseable(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_render_row_layout() {
        let row = SqlRow::new(
            vec!["id".into(), "name".into(), "email".into()],
            vec![json!(7), json!("Ada"), serde_json::Value::Null],
        );
        assert_eq!(
            row.render("customers"),
            "Table: customers\nid: 7\nname: Ada\nemail: NULL"
        );
    }

    #[test]
    fn test_row_lookup_is_case_insensitive() {
        let row = SqlRow::new(vec!["ID".into()], vec![json!(3)]);
        assert_eq!(row.get("id"), Some(&json!(3)));
        assert!(row.get("name").is_none());
    }

    #[test]
    fn test_chunk_candidate_clamps_score() {
        let chunk = DocumentChunk::new("c1", "hello", vec![1.0]);
        let cand = RetrievalCandidate::from_chunk(&chunk, -0.4, 1);
        assert_eq!(cand.score, 0.0);
        assert_eq!(
            cand.provenance,
            SourceRef::Chunk {
                chunk_id: "c1".into()
            }
        );
    }

    #[test]
    fn test_validation_error_mapping() {
        let q = GeneratedQuery::rejected("DROP TABLE x", "DROP is not permitted");
        assert!(matches!(
            q.validation_error(),
            Some(EngineError::QueryRejected(_))
        ));
        assert!(GeneratedQuery::valid("SELECT 1", vec![])
            .validation_error()
            .is_none());
    }

    #[test]
    fn test_metadata_serializes_as_scalars() {
        let chunk = DocumentChunk::new("c1", "t", vec![0.5])
            .with_metadata("table", "orders")
            .with_metadata("id", 4i64);
        let v = serde_json::to_value(&chunk).unwrap();
        assert_eq!(v["metadata"]["table"], json!("orders"));
        assert_eq!(v["metadata"]["id"], json!(4));
    }
}
