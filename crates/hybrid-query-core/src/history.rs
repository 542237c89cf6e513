//! Per-session conversation state.
//!
//! A [`Conversation`] holds the turns of one session and keeps them within
//! the configured bounds. State machine:
//!
//! ```text
//! Active --(append overflows max_turns / max_tokens)--> Truncating --> Active
//! ```
//!
//! Truncation drops the oldest turns first and never drops the turn that was
//! just appended. Each overflowing append produces exactly one
//! [`TruncationEvent`]. Under [`HistoryPolicy::Summarize`] the dropped turns
//! are folded into a bounded extractive summary that precedes the recency
//! window in every later context.

use serde::{Deserialize, Serialize};

use crate::models::{QueryTurn, Role};

/// What happens to turns that no longer fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryPolicy {
    #[default]
    Drop,
    Summarize,
}

/// Bounds applied to every conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Maximum turns retained (user and assistant messages count separately).
    pub max_turns: usize,
    /// Maximum estimated tokens across retained turns.
    pub max_tokens: usize,
    /// Turns injected into the contextualized query.
    pub window_turns: usize,
    pub policy: HistoryPolicy,
    /// Upper bound on the summary length under [`HistoryPolicy::Summarize`].
    pub summary_max_chars: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_turns: 20,
            max_tokens: 2000,
            window_turns: 6,
            policy: HistoryPolicy::Drop,
            summary_max_chars: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    Active,
    Truncating,
}

/// Emitted once per append that overflowed the bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct TruncationEvent {
    /// Dropped turns, oldest first.
    pub dropped: Vec<QueryTurn>,
    pub summarized: bool,
}

/// Serializable snapshot of a conversation.
#[derive(Debug, Clone, Serialize)]
pub struct Transcript {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub turns: Vec<QueryTurn>,
    pub truncations: usize,
}

/// Maximum characters taken from a single turn when summarizing.
const SUMMARY_LINE_CHARS: usize = 160;

#[derive(Debug, Clone)]
pub struct Conversation {
    session_id: String,
    config: HistoryConfig,
    turns: Vec<QueryTurn>,
    summary: Vec<String>,
    state: ConversationState,
    truncations: usize,
}

impl Conversation {
    pub fn new(session_id: impl Into<String>, config: HistoryConfig) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            turns: Vec::new(),
            summary: Vec::new(),
            state: ConversationState::Active,
            truncations: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn turns(&self) -> &[QueryTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Number of appends that triggered truncation so far.
    pub fn truncations(&self) -> usize {
        self.truncations
    }

    pub fn summary(&self) -> Option<String> {
        if self.summary.is_empty() {
            None
        } else {
            Some(self.summary.join("\n"))
        }
    }

    /// The `n` most recent turns, oldest first.
    pub fn recent(&self, n: usize) -> &[QueryTurn] {
        let start = self.turns.len().saturating_sub(n);
        &self.turns[start..]
    }

    /// Append a turn, truncating the oldest turns if the bounds are exceeded.
    pub fn append(&mut self, turn: QueryTurn) -> Option<TruncationEvent> {
        self.turns.push(turn);
        if !self.overflows() {
            return None;
        }

        self.state = ConversationState::Truncating;
        let mut dropped = Vec::new();
        while self.turns.len() > 1 && self.overflows() {
            dropped.push(self.turns.remove(0));
        }

        let summarized = self.config.policy == HistoryPolicy::Summarize && !dropped.is_empty();
        if summarized {
            self.fold_into_summary(&dropped);
        }
        self.truncations += 1;
        self.state = ConversationState::Active;

        tracing::debug!(
            session = %self.session_id,
            dropped = dropped.len(),
            retained = self.turns.len(),
            summarized,
            "conversation truncated"
        );

        Some(TruncationEvent {
            dropped,
            summarized,
        })
    }

    /// Concatenate the recency window with the new question.
    ///
    /// With no prior turns (and no summary) the question is returned unchanged.
    pub fn context_for(&self, question: &str) -> String {
        let window = self.recent(self.config.window_turns);
        let summary = self.summary();
        if window.is_empty() && summary.is_none() {
            return question.to_string();
        }

        let mut out = String::new();
        if let Some(summary) = summary {
            out.push_str("Earlier conversation (summary):\n");
            out.push_str(&summary);
            out.push_str("\n\n");
        }
        if !window.is_empty() {
            out.push_str("Conversation so far:\n");
            for turn in window {
                out.push_str(speaker(turn.role));
                out.push_str(": ");
                out.push_str(turn.text.trim());
                out.push('\n');
            }
            out.push('\n');
        }
        out.push_str("Question: ");
        out.push_str(question);
        out
    }

    pub fn export(&self) -> Transcript {
        Transcript {
            session_id: self.session_id.clone(),
            summary: self.summary(),
            turns: self.turns.clone(),
            truncations: self.truncations,
        }
    }

    fn overflows(&self) -> bool {
        let tokens: usize = self.turns.iter().map(QueryTurn::estimated_tokens).sum();
        self.turns.len() > self.config.max_turns || tokens > self.config.max_tokens
    }

    fn fold_into_summary(&mut self, dropped: &[QueryTurn]) {
        for turn in dropped {
            let first_line = turn.text.trim().lines().next().unwrap_or_default();
            let mut line: String = first_line.chars().take(SUMMARY_LINE_CHARS).collect();
            if first_line.chars().count() > SUMMARY_LINE_CHARS || turn.text.trim().lines().nth(1).is_some() {
                line.push_str("...");
            }
            self.summary.push(format!("{}: {}", speaker(turn.role), line));
        }
        // keep the most recent lines within the bound
        while self.summary.len() > 1 && self.summary_chars() > self.config.summary_max_chars {
            self.summary.remove(0);
        }
    }

    fn summary_chars(&self) -> usize {
        let lines: usize = self.summary.iter().map(|l| l.chars().count()).sum();
        lines + self.summary.len().saturating_sub(1)
    }
}

fn speaker(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
    }
}
