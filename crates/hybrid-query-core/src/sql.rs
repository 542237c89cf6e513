//! Read-only SQL validation and schema binding.
//!
//! Generated statements are never trusted. [`validate`] tokenizes the
//! statement (string literals and comments are opaque) and classifies it:
//!
//! - **rejected**: a data-modifying, schema-modifying or administrative
//!   keyword appears anywhere outside a literal, or more than one statement
//!   is present. Rejected statements must never be executed.
//! - **unparseable**: the statement is not a `SELECT`/`WITH` query, is
//!   lexically malformed, or references a table or column that the
//!   [`SchemaSnapshot`] does not declare.
//! - **valid**: everything else; `target_tables` lists the referenced
//!   tables in first-reference order using their declared names.
//!
//! Unqualified identifiers are only bound when every table in scope is a
//! declared table; CTEs and derived tables have unknown column sets, so
//! their presence disables that check.

use std::collections::{HashMap, HashSet};

use crate::models::GeneratedQuery;
use crate::schema::SchemaSnapshot;

/// Keywords that make a statement write to, or administer, the database.
const FORBIDDEN: &[&str] = &[
    "ALTER", "ANALYZE", "ATTACH", "BEGIN", "CALL", "COMMIT", "COPY", "CREATE", "DELETE",
    "DETACH", "DROP", "EXEC", "EXECUTE", "GRANT", "INSERT", "INTO", "LOCK", "MERGE", "PRAGMA",
    "REINDEX", "RELEASE", "RENAME", "REPLACE", "REVOKE", "ROLLBACK", "SAVEPOINT", "TRUNCATE",
    "UPDATE", "UPSERT", "VACUUM",
];

/// Words that are never column references when unqualified.
const KEYWORDS: &[&str] = &[
    "ALL", "AND", "ANY", "AS", "ASC", "AVG", "BETWEEN", "BIGINT", "BLOB", "BOOLEAN", "BY",
    "CASE", "CAST", "CHAR", "COLLATE", "COUNT", "CROSS", "CURRENT", "CURRENT_DATE",
    "CURRENT_TIME", "CURRENT_TIMESTAMP", "DATE", "DATETIME", "DAY", "DECIMAL", "DESC",
    "DISTINCT", "DOUBLE", "ELSE", "END", "ESCAPE", "EXCEPT", "EXISTS", "EXTRACT", "FALSE",
    "FILTER", "FIRST", "FLOAT", "FOLLOWING", "FROM", "FULL", "GLOB", "GROUP", "GROUPS",
    "HAVING", "HOUR", "ILIKE", "IN", "INNER", "INT", "INTEGER", "INTERSECT", "INTERVAL", "IS",
    "ISNULL", "JOIN", "LAST", "LEFT", "LIKE", "LIMIT", "MATCH", "MAX", "MIN", "MINUTE",
    "MONTH", "NATURAL", "NOCASE", "NOT", "NOTNULL", "NULL", "NULLS", "NUMERIC", "OFFSET", "ON",
    "OR", "ORDER", "OTHERS", "OUTER", "OVER", "PARTITION", "PRECEDING", "RANGE", "REAL",
    "RECURSIVE", "REGEXP", "RIGHT", "ROW", "ROWS", "SECOND", "SELECT", "SOME", "SUM", "TEXT",
    "THEN", "TIES", "TIME", "TIMESTAMP", "TRUE", "UNBOUNDED", "UNION", "USING", "VALUES",
    "VARCHAR", "WEEK", "WHEN", "WHERE", "WINDOW", "WITH", "YEAR",
];

/// Keywords that end a `FROM`/`JOIN` item and therefore cannot be aliases.
const CLAUSE_KEYWORDS: &[&str] = &[
    "CROSS", "EXCEPT", "FULL", "GROUP", "HAVING", "INNER", "INTERSECT", "JOIN", "LEFT",
    "LIMIT", "NATURAL", "ON", "ORDER", "OUTER", "RIGHT", "UNION", "USING", "WHERE", "WINDOW",
];

/// Functions whose argument list uses `FROM` as a separator.
const FROM_ARGUMENT_FUNCTIONS: &[&str] = &["EXTRACT", "SUBSTRING", "TRIM", "OVERLAY", "POSITION"];

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Bare word: keyword or identifier.
    Word(String),
    /// `` `ident` `` or `[ident]`.
    Quoted(String),
    /// `"ident"`; SQLite reads it as a string literal when no column matches.
    DoubleQuoted(String),
    Str,
    Number,
    Param,
    Symbol(char),
}

impl Token {
    fn ident(&self) -> Option<&str> {
        match self {
            Token::Word(w) | Token::Quoted(w) | Token::DoubleQuoted(w) => Some(w),
            _ => None,
        }
    }

    fn is_word(&self, kw: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(kw))
    }

    fn is_symbol(&self, c: char) -> bool {
        matches!(self, Token::Symbol(s) if *s == c)
    }
}

fn is_keyword(word: &str) -> bool {
    let upper = word.to_ascii_uppercase();
    KEYWORDS.contains(&upper.as_str()) || FORBIDDEN.contains(&upper.as_str())
}

fn is_clause_keyword(word: &str) -> bool {
    let upper = word.to_ascii_uppercase();
    CLAUSE_KEYWORDS.contains(&upper.as_str())
}

fn tokenize(sql: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            loop {
                if i + 1 >= chars.len() {
                    return Err("unterminated block comment".to_string());
                }
                if chars[i] == '*' && chars[i + 1] == '/' {
                    i += 2;
                    break;
                }
                i += 1;
            }
        } else if c == '\'' {
            i = skip_quoted(&chars, i, '\'').ok_or("unterminated string literal")?;
            tokens.push(Token::Str);
        } else if c == '"' || c == '`' || c == '[' {
            let close = if c == '[' { ']' } else { c };
            let end = skip_quoted(&chars, i, close).ok_or("unterminated quoted identifier")?;
            let inner: String = chars[i + 1..end - 1].iter().collect();
            let inner = inner.replace(&format!("{close}{close}"), &close.to_string());
            tokens.push(if c == '"' {
                Token::DoubleQuoted(inner)
            } else {
                Token::Quoted(inner)
            });
            i = end;
        } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Number);
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
        } else if matches!(c, '?' | ':' | '@' | '$')
            && chars
                .get(i + 1)
                .is_some_and(|n| n.is_alphanumeric() || *n == '_')
        {
            i += 1;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Param);
        } else if c == '?' {
            i += 1;
            tokens.push(Token::Param);
        } else {
            i += 1;
            tokens.push(Token::Symbol(c));
        }
    }
    Ok(tokens)
}

/// Returns the index just past the closing quote; doubled quotes are escapes.
fn skip_quoted(chars: &[char], start: usize, close: char) -> Option<usize> {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == close {
            if close != ']' && chars.get(i + 1) == Some(&close) {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

/// Pull the SQL statement out of a free-form generation reply.
///
/// Handles Markdown code fences, a leading `SQL:`/`SQLQuery:` label, and
/// trailing semicolons.
pub fn extract_sql(reply: &str) -> String {
    let mut text = reply.trim();

    if let Some(open) = text.find("```") {
        let after = &text[open + 3..];
        let body_start = after.find('\n').map(|n| n + 1).unwrap_or(0);
        let lang = after[..body_start].trim();
        let body = if lang.is_empty() || lang.chars().all(|c| c.is_ascii_alphabetic()) {
            &after[body_start..]
        } else {
            after
        };
        text = match body.find("```") {
            Some(close) => &body[..close],
            None => body,
        };
        text = text.trim();
    }

    for label in ["SQLQuery:", "SQL:"] {
        if text
            .get(..label.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(label))
        {
            text = text[label.len()..].trim_start();
        }
    }

    text.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace()).to_string()
}

/// Validate a generated statement against the schema.
pub fn validate(sql: &str, schema: &SchemaSnapshot) -> GeneratedQuery {
    let sql = sql.trim();
    let tokens = match tokenize(sql) {
        Ok(t) => t,
        Err(e) => return GeneratedQuery::unparseable(sql, e),
    };

    // Everything after the first `;` must be empty.
    let statement_end = tokens
        .iter()
        .position(|t| t.is_symbol(';'))
        .unwrap_or(tokens.len());
    if tokens[statement_end..].iter().any(|t| !t.is_symbol(';')) {
        return GeneratedQuery::rejected(sql, "multiple statements are not permitted");
    }
    let tokens = &tokens[..statement_end];

    if tokens.is_empty() {
        return GeneratedQuery::unparseable(sql, "empty statement");
    }

    for (i, tok) in tokens.iter().enumerate() {
        if let Token::Word(w) = tok {
            let upper = w.to_ascii_uppercase();
            let after_dot = i > 0 && tokens[i - 1].is_symbol('.');
            let is_call = tokens.get(i + 1).is_some_and(|t| t.is_symbol('('));
            if FORBIDDEN.contains(&upper.as_str()) && !after_dot && !is_call {
                return GeneratedQuery::rejected(sql, format!("{} is not permitted", upper));
            }
        }
    }

    let mut depth: i64 = 0;
    for tok in tokens {
        if tok.is_symbol('(') {
            depth += 1;
        } else if tok.is_symbol(')') {
            depth -= 1;
            if depth < 0 {
                return GeneratedQuery::unparseable(sql, "unbalanced parentheses");
            }
        }
    }
    if depth != 0 {
        return GeneratedQuery::unparseable(sql, "unbalanced parentheses");
    }

    let lead = tokens.iter().find(|t| !t.is_symbol('('));
    match lead {
        Some(t) if t.is_word("SELECT") || t.is_word("WITH") => {}
        Some(Token::Word(w)) => {
            return GeneratedQuery::unparseable(
                sql,
                format!("expected a SELECT statement, found `{}`", w),
            )
        }
        _ => return GeneratedQuery::unparseable(sql, "expected a SELECT statement"),
    }

    match Binder::new(tokens, schema).bind() {
        Ok(tables) => GeneratedQuery::valid(sql, tables),
        Err(reason) => GeneratedQuery::unparseable(sql, reason),
    }
}

/// Index of the `)` matching the `(` at `open`. Parentheses are balanced
/// before binding starts.
fn matching_close(tokens: &[Token], open: usize) -> usize {
    let mut depth = 0usize;
    for (i, t) in tokens.iter().enumerate().skip(open) {
        if t.is_symbol('(') {
            depth += 1;
        } else if t.is_symbol(')') {
            depth -= 1;
            if depth == 0 {
                return i;
            }
        }
    }
    tokens.len().saturating_sub(1)
}

/// Index of the `(` matching the `)` at `close`.
fn matching_open(tokens: &[Token], close: usize) -> Option<usize> {
    let mut depth = 0usize;
    for i in (0..=close).rev() {
        if tokens[i].is_symbol(')') {
            depth += 1;
        } else if tokens[i].is_symbol('(') {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

/// What an alias or table name in scope refers to.
#[derive(Debug, Clone)]
enum Relation {
    /// A declared table (declared name).
    Table(String),
    /// A CTE, subquery or table-valued function with unknown columns.
    Derived,
}

struct Binder<'a> {
    tokens: &'a [Token],
    schema: &'a SchemaSnapshot,
    /// Lower-cased alias or table name → relation.
    relations: HashMap<String, Relation>,
    ctes: HashSet<String>,
    column_aliases: HashSet<String>,
    /// Token positions consumed by `FROM`/`JOIN` items.
    consumed: HashSet<usize>,
    tables: Vec<String>,
    has_derived: bool,
}

impl<'a> Binder<'a> {
    fn new(tokens: &'a [Token], schema: &'a SchemaSnapshot) -> Self {
        Self {
            tokens,
            schema,
            relations: HashMap::new(),
            ctes: HashSet::new(),
            column_aliases: HashSet::new(),
            consumed: HashSet::new(),
            tables: Vec::new(),
            has_derived: false,
        }
    }

    fn bind(mut self) -> Result<Vec<String>, String> {
        self.collect_ctes();
        self.collect_relations()?;
        self.collect_column_aliases();
        self.check_qualified()?;
        if !self.has_derived {
            self.check_unqualified()?;
        }
        Ok(self.tables)
    }

    fn tok(&self, i: usize) -> Option<&Token> {
        self.tokens.get(i)
    }

    /// `name AS (` and `name (cols) AS (`.
    fn collect_ctes(&mut self) {
        let tokens = self.tokens;
        for i in 1..tokens.len() {
            if !(tokens[i].is_word("AS") && tokens.get(i + 1).is_some_and(|t| t.is_symbol('('))) {
                continue;
            }
            let mut name_idx = i - 1;
            if tokens[name_idx].is_symbol(')') {
                // column list: name (a, b) AS (
                let Some(open) = matching_open(tokens, name_idx) else {
                    continue;
                };
                let Some(prev) = open.checked_sub(1) else {
                    continue;
                };
                name_idx = prev;
            }
            let name = match &tokens[name_idx] {
                Token::Quoted(q) | Token::DoubleQuoted(q) => q,
                Token::Word(w) if !is_keyword(w) => w,
                _ => continue,
            };
            self.ctes.insert(name.to_lowercase());
        }
        if !self.ctes.is_empty() {
            self.has_derived = true;
        }
    }

    fn collect_relations(&mut self) -> Result<(), String> {
        let tokens = self.tokens;
        let mut paren_words: Vec<Option<String>> = Vec::new();
        for (i, tok) in tokens.iter().enumerate() {
            if tok.is_symbol('(') {
                let prev = i.checked_sub(1).and_then(|p| match &tokens[p] {
                    Token::Word(w) => Some(w.to_ascii_uppercase()),
                    _ => None,
                });
                paren_words.push(prev);
                continue;
            }
            if tok.is_symbol(')') {
                paren_words.pop();
                continue;
            }
            if tok.is_word("FROM") {
                let in_argument_list = paren_words
                    .last()
                    .and_then(|w| w.as_deref())
                    .is_some_and(|w| FROM_ARGUMENT_FUNCTIONS.contains(&w));
                let distinct_from = i >= 2
                    && tokens[i - 1].is_word("DISTINCT")
                    && (tokens[i - 2].is_word("IS") || tokens[i - 2].is_word("NOT"));
                if in_argument_list || distinct_from {
                    continue;
                }
                self.parse_items(i + 1, true)?;
            } else if tok.is_word("JOIN") {
                self.parse_items(i + 1, false)?;
            }
        }
        Ok(())
    }

    /// Parse the item list following `FROM` (comma-separated) or `JOIN` (single item).
    fn parse_items(&mut self, mut i: usize, allow_list: bool) -> Result<(), String> {
        let tokens = self.tokens;
        loop {
            let relation = match tokens.get(i) {
                Some(t) if t.is_symbol('(') => {
                    i = matching_close(tokens, i) + 1;
                    self.has_derived = true;
                    Relation::Derived
                }
                Some(t) if t.ident().is_some() => {
                    let mut name = t.ident().unwrap_or_default().to_string();
                    self.consumed.insert(i);
                    i += 1;
                    // schema-qualified: main.customers
                    if tokens.get(i).is_some_and(|t| t.is_symbol('.')) {
                        if let Some(part) = tokens.get(i + 1).and_then(|t| t.ident()) {
                            name = part.to_string();
                            self.consumed.insert(i);
                            self.consumed.insert(i + 1);
                            i += 2;
                        }
                    }
                    if tokens.get(i).is_some_and(|t| t.is_symbol('(')) {
                        // table-valued function
                        i = matching_close(tokens, i) + 1;
                        self.has_derived = true;
                        Relation::Derived
                    } else if self.ctes.contains(&name.to_lowercase()) {
                        self.relations.insert(name.to_lowercase(), Relation::Derived);
                        Relation::Derived
                    } else {
                        let table = self
                            .schema
                            .table(&name)
                            .ok_or_else(|| format!("unknown table `{}`", name))?;
                        let declared = table.name.clone();
                        if !self.tables.contains(&declared) {
                            self.tables.push(declared.clone());
                        }
                        self.relations
                            .insert(name.to_lowercase(), Relation::Table(declared.clone()));
                        Relation::Table(declared)
                    }
                }
                _ => return Ok(()),
            };

            if tokens.get(i).is_some_and(|t| t.is_word("AS")) {
                i += 1;
            }
            if let Some(alias) = tokens.get(i).and_then(|t| t.ident()) {
                let is_alias = match &tokens[i] {
                    Token::Quoted(_) | Token::DoubleQuoted(_) => true,
                    _ => !is_keyword(alias) && !is_clause_keyword(alias),
                };
                if is_alias {
                    self.relations.insert(alias.to_lowercase(), relation);
                    self.consumed.insert(i);
                    i += 1;
                }
            }

            if allow_list && tokens.get(i).is_some_and(|t| t.is_symbol(',')) {
                i += 1;
                continue;
            }
            return Ok(());
        }
    }

    /// `expr AS alias` and implicit `expr alias` in select lists.
    fn collect_column_aliases(&mut self) {
        let tokens = self.tokens;
        for (i, tok) in tokens.iter().enumerate() {
            let Some(name) = tok.ident() else {
                continue;
            };
            if self.consumed.contains(&i) {
                continue;
            }
            let prev = i.checked_sub(1).map(|p| &tokens[p]);
            let next = tokens.get(i + 1);
            let explicit = prev.is_some_and(|p| p.is_word("AS"));
            let implicit = matches!(tok, Token::Word(_))
                && !is_keyword(name)
                && !prev.is_some_and(|p| p.is_symbol('.'))
                && prev.is_some_and(|p| match p {
                    Token::Symbol(')')
                    | Token::Str
                    | Token::Number
                    | Token::Quoted(_)
                    | Token::DoubleQuoted(_) => true,
                    Token::Word(w) => !is_keyword(w),
                    _ => false,
                })
                && next.map_or(true, |n| n.is_symbol(',') || n.is_word("FROM"));
            if explicit || implicit {
                self.column_aliases.insert(name.to_lowercase());
            }
        }
    }

    fn check_qualified(&self) -> Result<(), String> {
        for i in 0..self.tokens.len() {
            if self.consumed.contains(&i) || !self.tok(i + 1).is_some_and(|t| t.is_symbol('.')) {
                continue;
            }
            let Some(qualifier) = self.tokens[i].ident() else {
                continue;
            };
            if i > 0 && self.tokens[i - 1].is_symbol('.') {
                continue;
            }
            let column = match self.tok(i + 2) {
                Some(Token::Symbol('*')) => None,
                Some(t) => match t.ident() {
                    Some(c) => Some(c),
                    None => continue,
                },
                None => continue,
            };
            let relation = self
                .relations
                .get(&qualifier.to_lowercase())
                .ok_or_else(|| format!("unknown table or alias `{}`", qualifier))?;
            if let (Relation::Table(table), Some(column)) = (relation, column) {
                let declared = self
                    .schema
                    .table(table)
                    .ok_or_else(|| format!("unknown table `{}`", table))?;
                if declared.column(column).is_none() {
                    return Err(format!("unknown column `{}.{}`", qualifier, column));
                }
            }
        }
        Ok(())
    }

    fn check_unqualified(&self) -> Result<(), String> {
        let in_scope: Vec<&str> = self.tables.iter().map(String::as_str).collect();
        for i in 0..self.tokens.len() {
            let Some(name) = self.tokens[i].ident() else {
                continue;
            };
            if self.consumed.contains(&i) {
                continue;
            }
            if i > 0 && self.tokens[i - 1].is_symbol('.') {
                continue;
            }
            let next = self.tok(i + 1);
            if next.is_some_and(|t| t.is_symbol('.') || t.is_symbol('(')) {
                continue;
            }
            let lower = name.to_lowercase();
            if matches!(self.tokens[i], Token::Word(_)) && is_keyword(name) {
                continue;
            }
            if self.column_aliases.contains(&lower) || self.relations.contains_key(&lower) {
                continue;
            }
            let declared = in_scope.iter().any(|t| {
                self.schema
                    .table(t)
                    .is_some_and(|table| table.column(name).is_some())
            });
            if !declared && !matches!(self.tokens[i], Token::DoubleQuoted(_)) {
                return Err(format!("unknown column `{}`", name));
            }
        }
        Ok(())
    }
}
