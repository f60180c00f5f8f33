//! Product name normalization and the regional synonym table.
//!
//! Both the classifier and the fuzzy scorer work on a canonical "search text":
//! lowercase, alphanumeric tokens separated by single spaces. Regional
//! synonyms ("haldi" → "turmeric") are rewritten token-wise so that the
//! same product named in different dialects compares equal.

use serde::{Deserialize, Serialize};

use crate::size;

/// Words that carry no identity for grocery products.
pub const STOP_WORDS: &[&str] = &[
    "the", "and", "or", "of", "in", "with", "for", "pure", "organic", "fresh", "premium",
];

/// One synonym group from configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SynonymGroup {
    pub canonical: String,
    pub terms: Vec<String>,
}

/// Compiled synonym rewrites, longest phrase first.
#[derive(Debug, Clone, Default)]
pub struct SynonymTable {
    rewrites: Vec<(Vec<String>, Vec<String>)>,
}

impl SynonymTable {
    pub fn new(groups: &[SynonymGroup]) -> Self {
        let mut rewrites: Vec<(Vec<String>, Vec<String>)> = Vec::new();
        for group in groups {
            let canonical = tokens(&search_text(&group.canonical));
            if canonical.is_empty() {
                continue;
            }
            for term in &group.terms {
                let term = tokens(&search_text(term));
                if term.is_empty() || term == canonical {
                    continue;
                }
                rewrites.push((term, canonical.clone()));
            }
        }
        // Stable sort keeps declaration order among equal lengths.
        rewrites.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { rewrites }
    }

    pub fn len(&self) -> usize {
        self.rewrites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rewrites.is_empty()
    }

    /// Rewrite synonym phrases in an already-canonical search text.
    ///
    /// Single left-to-right pass; replaced output is never rescanned.
    pub fn rewrite(&self, text: &str) -> String {
        if self.rewrites.is_empty() {
            return text.to_string();
        }
        let input = tokens(text);
        let mut out: Vec<&str> = Vec::with_capacity(input.len());
        let mut i = 0;
        'outer: while i < input.len() {
            for (term, canonical) in &self.rewrites {
                if input[i..].starts_with(term) {
                    out.extend(canonical.iter().map(String::as_str));
                    i += term.len();
                    continue 'outer;
                }
            }
            out.push(input[i].as_str());
            i += 1;
        }
        out.join(" ")
    }
}

/// Lowercase, replace non-alphanumerics with spaces, collapse whitespace.
pub fn search_text(text: &str) -> String {
    let mapped: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize a product name for comparison.
///
/// Strips size expressions, canonicalizes the text, applies synonyms, and
/// drops stop words.
pub fn normalize_name(name: &str, synonyms: &SynonymTable) -> String {
    let stripped = size::strip_sizes(name);
    let text = synonyms.rewrite(&search_text(&stripped));
    text.split(' ')
        .filter(|t| !t.is_empty() && !STOP_WORDS.contains(t))
        .collect::<Vec<_>>()
        .join(" ")
}

fn tokens(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}
