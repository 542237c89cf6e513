//! Schema descriptors and natural-language column resolution.
//!
//! A [`SchemaSnapshot`] is an immutable, ordered description of the live
//! database. Declaration order is significant: it is the final tie-breaker
//! when a natural-language term plausibly names several columns.
//!
//! # Resolution Order
//!
//! [`SchemaSnapshot::resolve_column`] tries, in order:
//!
//! 1. exact name match,
//! 2. case-insensitive match,
//! 3. best lexical similarity (normalized Levenshtein over lower-cased
//!    names with `_`, `-` and spaces removed, at least
//!    [`MIN_LEXICAL_SIMILARITY`]).
//!
//! Within each step the first column in declaration order (tables in
//! snapshot order, then columns in table order) wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum normalized similarity for a lexical column match.
pub const MIN_LEXICAL_SIMILARITY: f64 = 0.6;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "did", "do", "does", "for", "from", "has", "have", "how", "in",
    "is", "last", "list", "many", "me", "much", "of", "on", "or", "show", "the", "this", "to",
    "top", "was", "were", "what", "when", "where", "which", "who", "with",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    /// Part of the table's declared primary key.
    #[serde(default)]
    pub primary_key: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
            primary_key: false,
        }
    }

    pub fn with_primary_key(mut self, primary_key: bool) -> Self {
        self.primary_key = primary_key;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Position of the primary key column, when the key is a single column.
    pub fn single_primary_key(&self) -> Option<usize> {
        let mut keys = self.columns.iter().enumerate().filter(|(_, c)| c.primary_key);
        match (keys.next(), keys.next()) {
            (Some((i, _)), None) => Some(i),
            _ => None,
        }
    }

    /// Find a declared column by name (case-insensitive, as SQL identifiers are).
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// `name(col TYPE, col TYPE NOT NULL, …)`
    pub fn describe(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut s = c.name.clone();
                if !c.data_type.is_empty() {
                    s.push(' ');
                    s.push_str(&c.data_type);
                }
                if !c.nullable {
                    s.push_str(" NOT NULL");
                }
                s
            })
            .collect();
        format!("{}({})", self.name, cols.join(", "))
    }
}

/// How a column reference was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    CaseInsensitive,
    Lexical,
}

/// A resolved column reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
    pub matched_by: MatchKind,
    pub similarity: f64,
}

impl ColumnRef {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.table, self.column)
    }
}

/// A question term resolved to a column, used as a prompt hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnHint {
    pub term: String,
    pub column: ColumnRef,
}

/// Immutable snapshot of the live schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableSchema>,
    pub fetched_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self {
            tables,
            fetched_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Find a table by name (case-insensitive).
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// One line per table, in declaration order.
    pub fn describe(&self) -> String {
        self.tables
            .iter()
            .map(|t| t.describe())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Resolve a natural-language column reference.
    ///
    /// `scope` restricts the search to the named tables; `None` searches
    /// the whole snapshot. Returns `None` when nothing is plausible.
    pub fn resolve_column(&self, reference: &str, scope: Option<&[&str]>) -> Option<ColumnRef> {
        let reference = reference.trim();
        if reference.is_empty() {
            return None;
        }

        let declared: Vec<(&TableSchema, &ColumnSchema)> = self
            .tables
            .iter()
            .filter(|t| match scope {
                Some(names) => names.iter().any(|n| n.eq_ignore_ascii_case(&t.name)),
                None => true,
            })
            .flat_map(|t| t.columns.iter().map(move |c| (t, c)))
            .collect();

        let make = |t: &TableSchema, c: &ColumnSchema, kind: MatchKind, sim: f64| ColumnRef {
            table: t.name.clone(),
            column: c.name.clone(),
            matched_by: kind,
            similarity: sim,
        };

        if let Some((t, c)) = declared.iter().find(|(_, c)| c.name == reference) {
            return Some(make(t, c, MatchKind::Exact, 1.0));
        }

        if let Some((t, c)) = declared
            .iter()
            .find(|(_, c)| c.name.eq_ignore_ascii_case(reference))
        {
            return Some(make(t, c, MatchKind::CaseInsensitive, 1.0));
        }

        let mut best: Option<(&TableSchema, &ColumnSchema, f64)> = None;
        for (t, c) in &declared {
            let sim = lexical_similarity(reference, &c.name);
            if sim < MIN_LEXICAL_SIMILARITY {
                continue;
            }
            // Strictly greater keeps the earliest declaration on ties.
            if best.map_or(true, |(_, _, b)| sim > b) {
                best = Some((t, c, sim));
            }
        }
        best.map(|(t, c, sim)| make(t, c, MatchKind::Lexical, sim))
    }

    /// Resolve the terms of a question to columns.
    ///
    /// Single words and adjacent word pairs (joined with `_`) are tried;
    /// stopwords and one- or two-letter words are skipped. Each column is
    /// reported once, for the first term that resolved to it.
    pub fn column_hints(&self, question: &str) -> Vec<ColumnHint> {
        let words: Vec<String> = question
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect();

        let mut terms: Vec<String> = Vec::new();
        for (i, w) in words.iter().enumerate() {
            if let Some(next) = words.get(i + 1) {
                if !is_stopword(w) && !is_stopword(next) {
                    terms.push(format!("{}_{}", w, next));
                }
            }
            if w.chars().count() >= 3 && !is_stopword(w) {
                terms.push(w.clone());
            }
        }

        let mut hints: Vec<ColumnHint> = Vec::new();
        for term in terms {
            if let Some(col) = self.resolve_column(&term, None) {
                let seen = hints
                    .iter()
                    .any(|h| h.column.table == col.table && h.column.column == col.column);
                if !seen {
                    hints.push(ColumnHint { term, column: col });
                }
            }
        }
        hints
    }
}

fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word)
}

fn fold_identifier(s: &str) -> Vec<char> {
    s.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Normalized similarity in `[0, 1]`: `1 - levenshtein / max_len` over folded names.
pub fn lexical_similarity(a: &str, b: &str) -> f64 {
    let a = fold_identifier(a);
    let b = fold_identifier(b);
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 0.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / max_len as f64
}

/// Edit distance between two character sequences.
pub fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}
