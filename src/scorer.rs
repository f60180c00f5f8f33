//! Similarity Scorer with semantic fallback.
//!
//! The fuzzy term is always available. The semantic term needs a vector for
//! both names from the run's [`EmbeddingCache`]; when either is missing the
//! pair is scored fuzzy-only and reported as a fallback.

use std::sync::Arc;

use shelfmatch_core::embedding::cosine_similarity;
use shelfmatch_core::models::ProductFacts;
use shelfmatch_core::similarity::{fuzzy_score, semantic_from_cosine, ScoreBreakdown};

use crate::cache::{CachedVector, EmbeddingCache};

#[derive(Clone)]
pub struct Scorer {
    cache: Arc<EmbeddingCache>,
}

impl Scorer {
    pub fn new(cache: Arc<EmbeddingCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// Score one pair.
    pub async fn score(&self, a: &ProductFacts, b: &ProductFacts) -> ScoreBreakdown {
        let vectors = self
            .cache
            .get_many(&[embed_text(a), embed_text(b)])
            .await;
        combine(a, b, &vectors[0], &vectors[1])
    }

    /// Score a primary against candidates with a single cache lookup.
    ///
    /// Results are in candidate order.
    pub async fn score_all(
        &self,
        primary: &ProductFacts,
        candidates: &[Arc<ProductFacts>],
    ) -> Vec<ScoreBreakdown> {
        let mut texts = Vec::with_capacity(candidates.len() + 1);
        texts.push(embed_text(primary));
        texts.extend(candidates.iter().map(|c| embed_text(c)));
        let vectors = self.cache.get_many(&texts).await;

        candidates
            .iter()
            .zip(&vectors[1..])
            .map(|(c, v)| combine(primary, c, &vectors[0], v))
            .collect()
    }
}

/// The text sent to the embedding provider for a product.
pub fn embed_text(facts: &ProductFacts) -> String {
    facts.normalized_name.clone()
}

fn combine(a: &ProductFacts, b: &ProductFacts, va: &CachedVector, vb: &CachedVector) -> ScoreBreakdown {
    let fuzzy = fuzzy_score(&a.normalized_name, &b.normalized_name);
    let semantic = match (va, vb) {
        (Some(x), Some(y)) if x.len() == y.len() => {
            Some(semantic_from_cosine(cosine_similarity(x, y)))
        }
        _ => None,
    };
    ScoreBreakdown::new(fuzzy, semantic)
}
