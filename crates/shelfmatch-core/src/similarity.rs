//! Lexical similarity, score blending, and match-type derivation.
//!
//! # Scoring
//!
//! ```text
//! combined = 0.6 × fuzzy + 0.4 × semantic     (semantic available)
//! combined = fuzzy                            (semantic fallback)
//! ```
//!
//! The fuzzy term is an order-insensitive token overlap with partial credit
//! for one token containing another ("masala" inside "garammasala"). Scores
//! are compared after quantization to nine decimal places so that float
//! noise never decides a tie.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::models::MatchType;

/// Weight of the lexical term in the blended score.
pub const FUZZY_WEIGHT: f64 = 0.6;
/// Weight of the semantic term in the blended score.
pub const SEMANTIC_WEIGHT: f64 = 0.4;

/// Tokens shorter than this only earn credit on exact equality.
const MIN_CONTAINMENT_LEN: usize = 3;

/// The three similarity values for one pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub fuzzy: f64,
    /// `None` when the semantic term fell back.
    pub semantic: Option<f64>,
    pub combined: f64,
}

impl ScoreBreakdown {
    pub fn new(fuzzy: f64, semantic: Option<f64>) -> Self {
        Self {
            fuzzy,
            semantic,
            combined: blend(fuzzy, semantic),
        }
    }

    pub fn fallback(&self) -> bool {
        self.semantic.is_none()
    }
}

/// Blend the two terms; the fallback path gives all weight to `fuzzy`.
pub fn blend(fuzzy: f64, semantic: Option<f64>) -> f64 {
    match semantic {
        Some(s) => FUZZY_WEIGHT * fuzzy + SEMANTIC_WEIGHT * s,
        None => fuzzy,
    }
}

/// Map a cosine similarity into `[0, 1]`.
pub fn semantic_from_cosine(cosine: f32) -> f64 {
    if cosine.is_finite() {
        (cosine as f64).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Token-overlap similarity between two normalized names, in `[0, 1]`.
///
/// Each token on one side earns the best credit it can get from a token on
/// the other side: 1.0 for equality, `shorter / longer` when one contains
/// the other. The score is the total credit of both sides over the total
/// token count, so it is symmetric and identical token sets score 1.0.
pub fn fuzzy_score(a: &str, b: &str) -> f64 {
    let ta: BTreeSet<&str> = a.split_whitespace().collect();
    let tb: BTreeSet<&str> = b.split_whitespace().collect();
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let credit = ta.iter().map(|t| best_credit(t, &tb)).sum::<f64>()
        + tb.iter().map(|t| best_credit(t, &ta)).sum::<f64>();
    (credit / (ta.len() + tb.len()) as f64).clamp(0.0, 1.0)
}

fn best_credit(token: &str, others: &BTreeSet<&str>) -> f64 {
    if others.contains(token) {
        return 1.0;
    }
    others
        .iter()
        .map(|o| containment(token, o))
        .fold(0.0, f64::max)
}

fn containment(a: &str, b: &str) -> f64 {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if short.len() < MIN_CONTAINMENT_LEN || !long.contains(short) {
        return 0.0;
    }
    short.chars().count() as f64 / long.chars().count() as f64
}

/// Quantized score used for every comparison.
pub fn score_key(score: f64) -> i64 {
    (score * 1e9).round() as i64
}

/// Ranking order: combined desc, fuzzy desc, then the caller's id asc.
pub fn rank(a: &ScoreBreakdown, a_id: &str, b: &ScoreBreakdown, b_id: &str) -> Ordering {
    score_key(b.combined)
        .cmp(&score_key(a.combined))
        .then_with(|| score_key(b.fuzzy).cmp(&score_key(a.fuzzy)))
        .then_with(|| a_id.cmp(b_id))
}

/// Whether `combined` clears `threshold` at comparison precision.
pub fn accepts(combined: f64, threshold: f64) -> bool {
    score_key(combined) >= score_key(threshold)
}

/// Bars used to tag how a match was established.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchTypeBars {
    /// Semantic alone must reach this to tag "semantic".
    pub semantic: f64,
    /// Both terms must reach this to tag "hybrid".
    pub hybrid: f64,
}

impl Default for MatchTypeBars {
    fn default() -> Self {
        Self {
            semantic: 0.9,
            hybrid: 0.5,
        }
    }
}

/// Tag an accepted pair.
///
/// Fallback pairs are never "semantic" or "hybrid".
pub fn match_type(
    primary_name: &str,
    competitor_name: &str,
    scores: &ScoreBreakdown,
    bars: MatchTypeBars,
) -> MatchType {
    if !primary_name.is_empty() && primary_name == competitor_name {
        return MatchType::Exact;
    }
    match scores.semantic {
        Some(s) if s >= bars.semantic && scores.fuzzy < s => MatchType::Semantic,
        Some(s) if s >= bars.hybrid && scores.fuzzy >= bars.hybrid => MatchType::Hybrid,
        _ => MatchType::Fuzzy,
    }
}
