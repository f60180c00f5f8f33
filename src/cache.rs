//! Run-scoped caches.
//!
//! Both caches live exactly as long as one matching run and are owned by
//! the resolver; nothing here is global. [`build_facts`] derives the
//! classification, size, department, and normalized name of every product
//! once. [`EmbeddingCache`] embeds each distinct text at most once per run,
//! in batches, under a per-call timeout, and remembers failures so a failing
//! provider is not asked again for the same text. Workers asking for a text
//! that another worker is already fetching wait for that fetch.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use shelfmatch_core::embedding::EmbeddingProvider;
use shelfmatch_core::models::{FactsIndex, Product};
use shelfmatch_core::rules::MatchRules;

/// Derive facts for every product, keyed by identity.
///
/// When a catalog repeats an identity, the first record wins.
pub fn build_facts<'a>(
    products: impl IntoIterator<Item = &'a Product>,
    rules: &MatchRules,
) -> FactsIndex {
    let mut index = FactsIndex::new();
    for product in products {
        index
            .entry(product.key())
            .or_insert_with(|| Arc::new(rules.facts(product)));
    }
    index
}

/// A cached vector; `None` records that the provider could not supply one.
pub type CachedVector = Option<Arc<Vec<f32>>>;

/// Embedding cache counters for the run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    /// Texts for which the provider failed or timed out.
    pub failures: usize,
    /// Provider calls that failed or timed out.
    pub failed_calls: usize,
    pub provider_calls: usize,
}

#[derive(Default)]
struct Entries {
    ready: HashMap<String, CachedVector>,
    /// Texts whose batch is in flight; the flag flips once it is stored.
    pending: HashMap<String, watch::Receiver<bool>>,
}

pub struct EmbeddingCache {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    call_timeout: Duration,
    entries: Mutex<Entries>,
    hits: AtomicUsize,
    misses: AtomicUsize,
    failures: AtomicUsize,
    failed_calls: AtomicUsize,
    provider_calls: AtomicUsize,
}

impl EmbeddingCache {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, batch_size: usize, call_timeout: Duration) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
            call_timeout,
            entries: Mutex::new(Entries::default()),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            failed_calls: AtomicUsize::new(0),
            provider_calls: AtomicUsize::new(0),
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Embed every text not yet cached. Used to warm the cache with the
    /// competitor catalog before workers start.
    pub async fn prefetch(&self, texts: &[String]) {
        let _ = self.get_many(texts).await;
    }

    /// Look up vectors for `texts`, embedding the missing ones.
    ///
    /// Returns one entry per input, in input order. Never fails: provider
    /// errors and timeouts become `None`. Texts already being fetched by a
    /// concurrent call are awaited, not fetched again.
    pub async fn get_many(&self, texts: &[String]) -> Vec<CachedVector> {
        let (batches, waits) = {
            let mut entries = self.lock();
            let mut seen = HashSet::new();
            let mut missing = Vec::new();
            let mut waits = Vec::new();
            for text in texts {
                if text.is_empty()
                    || entries.ready.contains_key(text)
                    || !seen.insert(text.as_str())
                {
                    continue;
                }
                match entries.pending.get(text) {
                    Some(rx) => waits.push(rx.clone()),
                    None => missing.push(text.clone()),
                }
            }
            let batches: Vec<(Vec<String>, watch::Sender<bool>)> = missing
                .chunks(self.batch_size)
                .map(|chunk| {
                    let (tx, rx) = watch::channel(false);
                    for text in chunk {
                        entries.pending.insert(text.clone(), rx.clone());
                    }
                    (chunk.to_vec(), tx)
                })
                .collect();
            (batches, waits)
        };

        let fetching: usize = batches.iter().map(|(batch, _)| batch.len()).sum();
        self.misses.fetch_add(fetching, Ordering::Relaxed);
        let lookups = texts.iter().filter(|t| !t.is_empty()).count();
        self.hits
            .fetch_add(lookups.saturating_sub(fetching), Ordering::Relaxed);

        for (batch, done) in batches {
            let fetched = self.fetch(&batch).await;
            {
                let mut entries = self.lock();
                for (text, vector) in batch.iter().zip(fetched) {
                    entries.pending.remove(text);
                    entries.ready.entry(text.clone()).or_insert(vector);
                }
            }
            done.send_replace(true);
        }

        for mut rx in waits {
            // A dropped sender leaves the text unresolved; it reads as `None`.
            let _ = rx.wait_for(|stored| *stored).await;
        }

        let entries = self.lock();
        texts
            .iter()
            .map(|t| entries.ready.get(t.as_str()).cloned().flatten())
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            provider_calls: self.provider_calls.load(Ordering::Relaxed),
        }
    }

    async fn fetch(&self, batch: &[String]) -> Vec<CachedVector> {
        self.provider_calls.fetch_add(1, Ordering::Relaxed);
        let outcome = tokio::time::timeout(self.call_timeout, self.provider.embed(batch)).await;
        let error = match outcome {
            Ok(Ok(vectors)) if vectors.len() == batch.len() => {
                debug!(texts = batch.len(), "embedded batch");
                return vectors
                    .into_iter()
                    .map(|v| (!v.is_empty()).then(|| Arc::new(v)))
                    .collect();
            }
            Ok(Ok(vectors)) => format!(
                "provider returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            ),
            Ok(Err(e)) => format!("{:#}", e),
            Err(_) => format!("timed out after {} ms", self.call_timeout.as_millis()),
        };

        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(batch.len(), Ordering::Relaxed);
        warn!(
            provider = self.provider.model_name(),
            texts = batch.len(),
            error = %error,
            "embedding unavailable, falling back to fuzzy scoring"
        );
        vec![None; batch.len()]
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        // A poisoned map still holds valid entries.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
