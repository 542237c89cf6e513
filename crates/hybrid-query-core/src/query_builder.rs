//! Natural-language to SQL query builder.
//!
//! [`QueryBuilder::build`] resolves column hints from the question, asks the
//! [`Generator`] for a statement, extracts it from the reply, and validates it
//! against the schema snapshot. The result is always a [`GeneratedQuery`];
//! only an empty question or a generation failure is an error.

use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::generation::Generator;
use crate::models::{GeneratedQuery, QueryTurn};
use crate::prompt::sql_request;
use crate::schema::SchemaSnapshot;
use crate::sql::{extract_sql, validate};

#[derive(Clone)]
pub struct QueryBuilder {
    generator: Arc<dyn Generator>,
}

impl QueryBuilder {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }

    pub async fn build(
        &self,
        question: &str,
        history: &[QueryTurn],
        schema: &SchemaSnapshot,
    ) -> Result<GeneratedQuery> {
        if question.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "question must not be empty".to_string(),
            ));
        }
        if schema.is_empty() {
            return Ok(GeneratedQuery::unparseable("", "schema has no tables"));
        }

        let hints = schema.column_hints(question);
        let request = sql_request(question, history, schema, &hints);
        let reply = self.generator.generate(&request).await?;
        let sql = extract_sql(&reply);
        let query = validate(&sql, schema);

        tracing::debug!(
            model = self.generator.model_name(),
            hints = hints.len(),
            status = %query.status,
            tables = ?query.target_tables,
            "query built"
        );
        Ok(query)
    }
}
