//! Generation backend abstraction.
//!
//! The [`Generator`] trait is the single seam between the engine and a
//! language model. Live HTTP backends live in the application crate;
//! [`ScriptedGenerator`] is a deterministic implementation for tests and
//! offline use.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::{EngineError, Result};
use crate::prompt::{GenerationPurpose, GenerationRequest, NO_CONTEXT_DISCLAIMER};

/// A text generation backend.
///
/// Failures are reported as [`EngineError::GenerationUnavailable`]; the
/// caller decides whether to retry.
#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

/// Deterministic generator driven by keyword rules.
///
/// - SQL requests return the SQL of the first rule whose keyword occurs in
///   the question (case-insensitive), otherwise a prose refusal.
/// - Answer requests cite every supplied context key, or open with
///   [`NO_CONTEXT_DISCLAIMER`] when there is none.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    sql_rules: Vec<(String, String)>,
    fail_sql: bool,
    answer_failures: AtomicUsize,
    sql_calls: AtomicUsize,
    answer_calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `sql` to SQL requests whose question contains `keyword`.
    pub fn with_sql(mut self, keyword: impl Into<String>, sql: impl Into<String>) -> Self {
        self.sql_rules.push((keyword.into().to_lowercase(), sql.into()));
        self
    }

    /// Fail every SQL request.
    pub fn failing_sql(mut self) -> Self {
        self.fail_sql = true;
        self
    }

    /// Fail the next `n` answer requests.
    pub fn failing_answers(self, n: usize) -> Self {
        self.answer_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn sql_calls(&self) -> usize {
        self.sql_calls.load(Ordering::SeqCst)
    }

    pub fn answer_calls(&self) -> usize {
        self.answer_calls.load(Ordering::SeqCst)
    }

    fn reply_sql(&self, request: &GenerationRequest) -> Result<String> {
        if self.fail_sql {
            return Err(EngineError::GenerationUnavailable(
                "scripted SQL failure".to_string(),
            ));
        }
        let question = request.question.to_lowercase();
        let reply = self
            .sql_rules
            .iter()
            .find(|(keyword, _)| question.contains(keyword.as_str()))
            .map(|(_, sql)| format!("```sql\n{}\n```", sql))
            .unwrap_or_else(|| "I cannot write a query for that question.".to_string());
        Ok(reply)
    }

    fn reply_answer(&self, request: &GenerationRequest) -> Result<String> {
        let failing = self
            .answer_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EngineError::GenerationUnavailable(
                "scripted answer failure".to_string(),
            ));
        }
        if request.citations.is_empty() {
            return Ok(format!(
                "{} I cannot answer \"{}\" from the available data.",
                NO_CONTEXT_DISCLAIMER, request.question
            ));
        }
        let cites: Vec<String> = request.citations.iter().map(|c| format!("[{}]", c)).collect();
        Ok(format!(
            "Answer to \"{}\" based on {}.",
            request.question,
            cites.join(", ")
        ))
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        match request.purpose {
            GenerationPurpose::Sql => {
                self.sql_calls.fetch_add(1, Ordering::SeqCst);
                self.reply_sql(request)
            }
            GenerationPurpose::Answer => {
                self.answer_calls.fetch_add(1, Ordering::SeqCst);
                self.reply_answer(request)
            }
        }
    }
}
