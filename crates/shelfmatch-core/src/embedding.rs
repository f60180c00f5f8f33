//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that every semantic backend
//! implements, a deterministic character n-gram embedder usable offline, and
//! cosine similarity.
//!
//! Network-backed providers (OpenAI, Ollama) live in the `shelfmatch` app
//! crate.

use anyhow::Result;
use async_trait::async_trait;

/// Trait for embedding providers.
///
/// `embed` returns one vector per input text, in input order. A provider
/// failure is an `Err`; the caller decides how to degrade.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Deterministic hashed character n-gram embedder.
///
/// Trigrams and bigrams of the padded text are hashed (FNV-1a) into `dims`
/// buckets. Similar spellings share n-grams and therefore direction.
#[derive(Debug, Clone)]
pub struct NgramEmbedder {
    dims: usize,
}

impl NgramEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let normalized: String = text
            .chars()
            .map(|c| {
                if c.is_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    ' '
                }
            })
            .collect();
        for word in normalized.split_whitespace() {
            let padded: Vec<char> = format!("_{}_", word).chars().collect();
            for window in padded.windows(3) {
                let gram: String = window.iter().collect();
                v[fnv1a(&gram) as usize % self.dims] += 1.0;
            }
            for window in padded.windows(2) {
                let gram: String = window.iter().collect();
                v[fnv1a(&gram) as usize % self.dims] += 0.5;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for NgramEmbedder {
    fn model_name(&self) -> &str {
        "ngram"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn fnv1a(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in s.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
