//! Fusion of vector and SQL candidates into one ranked context set.
//!
//! # Algorithm
//!
//! 1. Score: vector candidates keep their similarity, SQL rows receive
//!    `sql_row_score`. Each score is multiplied by
//!    `w_source / max(w_sql, w_vector)`, which keeps scores in `[0, 1]` and
//!    leaves them untouched under equal weighting.
//! 2. Deduplicate by normalized content (lower-cased, whitespace collapsed).
//!    The best member of each group survives.
//! 3. Sort by score (desc), SQL before vector, source rank (asc), id (asc).
//! 4. Keep the longest prefix whose cumulative estimated token size fits the
//!    budget. Kept items are never reordered.
//! 5. Reassign `rank` to the 1-based position in the fused sequence.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::{CandidateSource, RetrievalCandidate};

/// Relative trust in each retrieval branch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub w_sql: f64,
    pub w_vector: f64,
    /// Base score of an SQL row before weighting.
    pub sql_row_score: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            w_sql: 0.5,
            w_vector: 0.5,
            sql_row_score: 1.0,
        }
    }
}

impl FusionWeights {
    fn factor(&self, source: CandidateSource) -> f64 {
        let max = self.w_sql.max(self.w_vector);
        if max <= 0.0 {
            return 0.0;
        }
        let w = match source {
            CandidateSource::Sql => self.w_sql,
            CandidateSource::Vector => self.w_vector,
        };
        (w / max).clamp(0.0, 1.0)
    }
}

/// Counters describing one fusion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FusionStats {
    pub vector_in: usize,
    pub sql_in: usize,
    pub duplicates_removed: usize,
    pub truncated: usize,
    pub tokens_used: usize,
}

/// Canonical form used to detect identical facts from different sources.
pub fn normalize_content(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Merge both candidate sets into a deduplicated, ranked, budget-bounded sequence.
pub fn fuse(
    vector: Vec<RetrievalCandidate>,
    sql: Vec<RetrievalCandidate>,
    budget_tokens: usize,
    weights: &FusionWeights,
) -> Vec<RetrievalCandidate> {
    fuse_explained(vector, sql, budget_tokens, weights).0
}

/// [`fuse`], also returning counters for logging.
pub fn fuse_explained(
    vector: Vec<RetrievalCandidate>,
    sql: Vec<RetrievalCandidate>,
    budget_tokens: usize,
    weights: &FusionWeights,
) -> (Vec<RetrievalCandidate>, FusionStats) {
    let mut stats = FusionStats {
        vector_in: vector.len(),
        sql_in: sql.len(),
        ..Default::default()
    };

    let scored = vector
        .into_iter()
        .map(|mut c| {
            c.score = c.score.clamp(0.0, 1.0) * weights.factor(CandidateSource::Vector);
            c
        })
        .chain(sql.into_iter().map(|mut c| {
            c.score = weights.sql_row_score.clamp(0.0, 1.0) * weights.factor(CandidateSource::Sql);
            c
        }));

    let mut best: HashMap<String, RetrievalCandidate> = HashMap::new();
    for cand in scored {
        let key = normalize_content(&cand.text());
        match best.get(&key) {
            Some(existing) if compare(existing, &cand) != Ordering::Greater => {}
            _ => {
                best.insert(key, cand);
            }
        }
    }
    stats.duplicates_removed = stats.vector_in + stats.sql_in - best.len();

    let mut ranked: Vec<RetrievalCandidate> = best.into_values().collect();
    ranked.sort_by(compare);

    let mut used = 0usize;
    let mut keep = 0usize;
    for cand in &ranked {
        let cost = cand.estimated_tokens();
        if used + cost > budget_tokens {
            break;
        }
        used += cost;
        keep += 1;
    }
    stats.truncated = ranked.len() - keep;
    stats.tokens_used = used;
    ranked.truncate(keep);

    for (i, cand) in ranked.iter_mut().enumerate() {
        cand.rank = i + 1;
    }
    (ranked, stats)
}

/// Fused ordering: `Less` means `a` ranks ahead of `b`.
fn compare(a: &RetrievalCandidate, b: &RetrievalCandidate) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| source_order(a.source).cmp(&source_order(b.source)))
        .then_with(|| a.rank.cmp(&b.rank))
        .then_with(|| a.id.cmp(&b.id))
}

fn source_order(source: CandidateSource) -> u8 {
    match source {
        CandidateSource::Sql => 0,
        CandidateSource::Vector => 1,
    }
}
