//! Prompt construction for SQL generation and answer synthesis.
//!
//! Both builders are pure functions of their inputs so the exact text sent to
//! a generation backend can be asserted in tests.

use serde::Serialize;

use crate::models::{QueryTurn, RetrievalCandidate, Role};
use crate::schema::{ColumnHint, SchemaSnapshot};

/// First sentence of every answer produced without retrieved context.
pub const NO_CONTEXT_DISCLAIMER: &str =
    "No grounding context was found in the knowledge base or the database for this question.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationPurpose {
    Sql,
    Answer,
}

/// A conversation message forwarded to the generation backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationConstraints {
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop: Vec<String>,
}

impl GenerationConstraints {
    pub fn for_sql() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.0,
            stop: Vec::new(),
        }
    }

    pub fn for_answer() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.2,
            stop: Vec::new(),
        }
    }
}

/// Everything a [`Generator`](crate::generation::Generator) needs for one call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub purpose: GenerationPurpose,
    pub system: String,
    /// Prior turns followed by the final user message.
    pub messages: Vec<PromptMessage>,
    /// The bare question, without history or context.
    pub question: String,
    /// Citation keys the answer may reference, in context order.
    pub citations: Vec<String>,
    pub constraints: GenerationConstraints,
}

fn history_messages(history: &[QueryTurn]) -> Vec<PromptMessage> {
    history
        .iter()
        .map(|t| PromptMessage {
            role: t.role,
            content: t.text.clone(),
        })
        .collect()
}

/// Build the request asking for a single read-only SQL statement.
pub fn sql_request(
    question: &str,
    history: &[QueryTurn],
    schema: &SchemaSnapshot,
    hints: &[ColumnHint],
) -> GenerationRequest {
    let mut system = String::from(
        "You translate questions into SQL for a SQLite database.\n\
         Write exactly one read-only SELECT statement that answers the latest question.\n\
         Use only the tables and columns listed below. Never modify data.\n\
         Reply with the SQL statement only, without explanation.\n\nSchema:\n",
    );
    system.push_str(&schema.describe());

    if !hints.is_empty() {
        system.push_str("\n\nColumn hints:\n");
        for hint in hints {
            system.push_str(&format!("- \"{}\" refers to {}\n", hint.term, hint.column.qualified()));
        }
        system.truncate(system.trim_end().len());
    }

    let mut messages = history_messages(history);
    messages.push(PromptMessage {
        role: Role::User,
        content: question.to_string(),
    });

    GenerationRequest {
        purpose: GenerationPurpose::Sql,
        system,
        messages,
        question: question.to_string(),
        citations: Vec::new(),
        constraints: GenerationConstraints::for_sql(),
    }
}

/// Build the grounded-answer request over the fused context.
pub fn answer_request(
    question: &str,
    context: &[RetrievalCandidate],
    history: &[QueryTurn],
) -> GenerationRequest {
    let system = if context.is_empty() {
        format!(
            "You answer questions about a business database.\n\
             No context was retrieved for this question. Begin your answer with: \"{}\" \
             Do not invent facts.",
            NO_CONTEXT_DISCLAIMER
        )
    } else {
        let mut s = String::from(
            "You answer questions about a business database.\n\
             Use only the context below. Cite every context item you rely on by its key \
             in square brackets, for example [key]. If the context does not contain the \
             answer, say so.\n\nContext:\n",
        );
        for cand in context {
            s.push_str(&format!("[{}] ({}) {}\n", cand.id, cand.source, cand.text()));
        }
        s.truncate(s.trim_end().len());
        s
    };

    let mut messages = history_messages(history);
    messages.push(PromptMessage {
        role: Role::User,
        content: question.to_string(),
    });

    GenerationRequest {
        purpose: GenerationPurpose::Answer,
        system,
        messages,
        question: question.to_string(),
        citations: context.iter().map(|c| c.id.clone()).collect(),
        constraints: GenerationConstraints::for_answer(),
    }
}

/// Citation keys referenced as `[key]` in an answer, in `keys` order.
pub fn extract_citations(answer: &str, keys: &[String]) -> Vec<String> {
    keys.iter()
        .filter(|k| answer.contains(&format!("[{}]", k)))
        .cloned()
        .collect()
}
