//! End-to-end tests for the matching pipeline.
//!
//! These drive the resolver and aggregator through the library API with
//! in-memory catalogs and stub embedding providers.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shelfmatch::cache::{build_facts, EmbeddingCache};
use shelfmatch::catalog::CatalogSource;
use shelfmatch::config::Config;
use shelfmatch::match_cmd::compare;
use shelfmatch::resolver::{CancelToken, MatchRun, Resolution, Resolver};
use shelfmatch_core::aggregate::Verdict;
use shelfmatch_core::embedding::{EmbeddingProvider, NgramEmbedder};
use shelfmatch_core::models::{MatchType, Product, ProductKey, SkipReason};

// ─── Fixtures ───────────────────────────────────────────────────────

const RULES: &str = r#"
[[taxonomy]]
type = "spice"
subtype = "cooking_spice"
keywords = ["turmeric", "cumin", "saffron"]

[[taxonomy]]
type = "baking"
subtype = "leavening"
keywords = ["baking powder", "baking soda"]

[forbidden]
pairs = [["spice", "baking"]]

[[synonyms]]
canonical = "turmeric"
terms = ["haldi"]

[[synonyms]]
canonical = "saffron"
terms = ["kesar"]

[[departments]]
name = "Spices"
keywords = ["spices"]
"#;

fn config(matching: &str) -> Config {
    let toml = format!("[matching]\n{}\n{}", matching, RULES);
    Config::from_toml_str(&toml).unwrap()
}

fn product(store: &str, id: &str, name: &str, price: Option<f64>) -> Product {
    Product {
        store_id: store.to_string(),
        product_id: id.to_string(),
        name: name.to_string(),
        size_text: None,
        category: None,
        brand: None,
        price,
        on_sale: false,
    }
}

fn ours(id: &str, name: &str, price: f64) -> Product {
    product("ours", id, name, Some(price))
}

fn theirs(id: &str, name: &str, price: f64) -> Product {
    product("theirs", id, name, Some(price))
}

fn ngram() -> Arc<dyn EmbeddingProvider> {
    Arc::new(NgramEmbedder::new(256))
}

/// A provider whose every call fails.
struct FailingProvider;

#[async_trait]
impl EmbeddingProvider for FailingProvider {
    fn model_name(&self) -> &str {
        "failing"
    }
    fn dims(&self) -> usize {
        256
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("provider unavailable")
    }
}

/// Trips a cancel token the first time it is asked to embed a text that
/// contains `marker`.
struct CancellingProvider {
    inner: NgramEmbedder,
    marker: &'static str,
    cancel: CancelToken,
}

#[async_trait]
impl EmbeddingProvider for CancellingProvider {
    fn model_name(&self) -> &str {
        "cancelling"
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.contains(self.marker)) {
            self.cancel.cancel();
        }
        self.inner.embed(texts).await
    }
}

/// Records every text it embeds and lingers on each call so workers overlap.
struct RecordingProvider {
    inner: NgramEmbedder,
    embedded: Mutex<Vec<String>>,
}

#[async_trait]
impl EmbeddingProvider for RecordingProvider {
    fn model_name(&self) -> &str {
        "recording"
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embedded.lock().unwrap().extend(texts.iter().cloned());
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.inner.embed(texts).await
    }
}

struct InMemoryCatalog {
    store_id: String,
    products: Vec<Product>,
}

#[async_trait]
impl CatalogSource for InMemoryCatalog {
    fn store_id(&self) -> &str {
        &self.store_id
    }
    async fn load(&self) -> Result<Vec<Product>> {
        Ok(self.products.clone())
    }
}

fn resolver(config: &Config, provider: Arc<dyn EmbeddingProvider>) -> Resolver {
    let rules = Arc::new(config.rules().unwrap());
    let cache = Arc::new(EmbeddingCache::new(
        provider,
        config.embedding.batch_size,
        Duration::from_millis(config.embedding.call_timeout_ms),
    ));
    Resolver::new(config, rules, cache)
}

async fn run(
    config: &Config,
    provider: Arc<dyn EmbeddingProvider>,
    primary: &[Product],
    competitor: &[Product],
) -> MatchRun {
    resolver(config, provider)
        .run(primary, competitor, &CancelToken::new())
        .await
        .unwrap()
}

fn matched_pairs(run: &MatchRun) -> HashSet<(ProductKey, ProductKey)> {
    run.matches()
        .into_iter()
        .map(|m| (m.primary, m.competitor))
        .collect()
}

fn catalogs() -> (Vec<Product>, Vec<Product>) {
    let primary = vec![
        ours("p1", "Turmeric Powder 500g", 3.99),
        ours("p2", "Cumin Seeds 200g", 2.49),
        ours("p3", "Baking Powder 100g", 1.29),
        ours("p4", "Saffron Threads 1g", 9.99),
    ];
    let competitor = vec![
        theirs("c1", "Haldi Powder 500 g", 8.47),
        theirs("c2", "Cumin Whole Seeds 200 g", 2.99),
        theirs("c3", "Baking Soda 454g", 1.10),
        theirs("c4", "Turmeric Root Fresh 100g", 1.50),
        theirs("c5", "Kesar Threads 2g", 14.00),
    ];
    (primary, competitor)
}

// ─── End to end ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_turmeric_end_to_end() {
    let cfg = config("");
    let mut p = ours("p1", "Turmeric Powder 500g", 3.99);
    p.category = Some("Spices".into());
    let mut c = theirs("c1", "Haldi Powder 500 g", 8.47);
    c.category = Some("Spices".into());

    let primary = InMemoryCatalog {
        store_id: "ours".into(),
        products: vec![p],
    };
    let competitor = InMemoryCatalog {
        store_id: "theirs".into(),
        products: vec![c],
    };

    let report = compare(&cfg, &primary, &competitor, ngram(), None, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.summary.matched, 1);
    assert_eq!(report.records.len(), 1);
    let r = &report.records[0];
    assert_eq!(r.match_type, MatchType::Exact);
    assert!(r.match_confidence >= 0.9);
    assert_eq!(r.category, "Spices");
    assert_eq!(r.savings, Some(4.48));
    assert!((r.savings_percent.unwrap() - 52.89).abs() < 0.01);
    assert_eq!(r.verdict, Some(Verdict::WeCheaper));
    assert_eq!(r.normalized_unit.as_deref(), Some("100g"));
    assert!((r.our_normalized_price.unwrap() - 0.798).abs() < 1e-9);
    assert!((r.their_normalized_price.unwrap() - 1.694).abs() < 1e-9);

    assert_eq!(report.statistics.we_cheaper_count, 1);
    assert!((report.statistics.we_cheaper_percent - 100.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_compare_rejects_same_store() {
    let cfg = config("");
    let a = InMemoryCatalog {
        store_id: "ours".into(),
        products: vec![],
    };
    let b = InMemoryCatalog {
        store_id: "ours".into(),
        products: vec![],
    };
    let err = compare(&cfg, &a, &b, ngram(), None, &CancelToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("same store id"));
}

#[tokio::test]
async fn test_compare_rejects_bad_threshold() {
    let cfg = config("");
    let a = InMemoryCatalog {
        store_id: "ours".into(),
        products: vec![],
    };
    let b = InMemoryCatalog {
        store_id: "theirs".into(),
        products: vec![],
    };
    assert!(compare(&cfg, &a, &b, ngram(), Some(1.5), &CancelToken::new())
        .await
        .is_err());
}

#[tokio::test]
async fn test_primary_order_preserved() {
    let cfg = config("");
    let (primary, competitor) = catalogs();
    let result = run(&cfg, ngram(), &primary, &competitor).await;

    let order: Vec<&str> = result
        .outcomes
        .iter()
        .map(|o| o.primary.product_id.as_str())
        .collect();
    assert_eq!(order, vec!["p1", "p2", "p3", "p4"]);
    assert_eq!(result.summary.primaries_total, 4);
}

#[tokio::test]
async fn test_duplicate_primary_names_embedded_once() {
    let cfg = config("workers = 4");
    let provider = Arc::new(RecordingProvider {
        inner: NgramEmbedder::new(256),
        embedded: Mutex::new(Vec::new()),
    });
    let primary: Vec<Product> = (1..=8)
        .map(|i| ours(&format!("p{i}"), "Cumin Powder 100g", 1.5))
        .collect();
    let competitor = vec![theirs("c1", "Ground Cumin 100g", 1.8)];

    let result = run(&cfg, provider.clone(), &primary, &competitor).await;
    assert_eq!(result.outcomes.len(), 8);

    let embedded = provider.embedded.lock().unwrap().clone();
    let distinct: HashSet<&String> = embedded.iter().collect();
    assert_eq!(embedded.len(), distinct.len(), "re-embedded: {embedded:?}");
    assert_eq!(embedded.len(), 2);
    // one call for the competitor warm-up, one for the shared primary name
    assert_eq!(result.summary.embedding.provider_calls, 2);
}

// ─── Degradation ────────────────────────────────────────────────────

#[tokio::test]
async fn test_provider_failure_falls_back_to_fuzzy() {
    let cfg = config("");
    let primary = vec![ours("p1", "Turmeric Powder 500g", 3.99)];
    let competitor = vec![theirs("c1", "Turmeric Powder Fine 500g", 4.50)];

    let result = run(&cfg, Arc::new(FailingProvider), &primary, &competitor).await;

    let m = result.outcomes[0].resolution.matched().expect("matched");
    assert_eq!(m.semantic_score, None);
    assert!((m.fuzzy_score - 0.8).abs() < 1e-9);
    assert!((m.match_confidence - m.fuzzy_score).abs() < 1e-12);
    assert_eq!(m.match_type, MatchType::Fuzzy);
    assert!(result.summary.semantic_fallbacks >= 1);
    assert!(result.summary.embedding.failed_calls >= 1);
}

#[tokio::test]
async fn test_fallback_exact_name_is_exact() {
    let cfg = config("");
    let primary = vec![ours("p1", "Turmeric Powder 500g", 3.99)];
    let competitor = vec![theirs("c1", "Haldi Powder 1kg", 7.00)];

    let result = run(&cfg, Arc::new(FailingProvider), &primary, &competitor).await;
    let m = result.outcomes[0].resolution.matched().expect("matched");
    assert_eq!(m.match_type, MatchType::Exact);
    assert_eq!(m.match_confidence, 1.0);
}

// ─── Determinism and rules ──────────────────────────────────────────

#[tokio::test]
async fn test_runs_are_idempotent() {
    let cfg = config("");
    let (primary, competitor) = catalogs();
    let first = run(&cfg, ngram(), &primary, &competitor).await;
    let second = run(&cfg, ngram(), &primary, &competitor).await;
    assert_eq!(first.outcomes, second.outcomes);
}

#[tokio::test]
async fn test_forbidden_pairs_never_match() {
    let cfg = config("confidence_threshold = 0.0");
    let primary = vec![ours("p1", "Baking Powder 100g", 1.29)];
    let competitor = vec![theirs("c1", "Turmeric Powder 100g", 1.99)];

    let result = run(&cfg, ngram(), &primary, &competitor).await;
    assert_eq!(
        result.outcomes[0].resolution,
        Resolution::Unmatched { best_score: None }
    );
    assert_eq!(result.summary.candidate_pairs_forbidden, 1);
    assert_eq!(result.summary.candidate_pairs_scored, 0);

    let rules = cfg.rules().unwrap();
    let facts = build_facts(primary.iter().chain(competitor.iter()), &rules);
    let pairs = resolver(&cfg, ngram())
        .candidate_pairs(
            &facts[&primary[0].key()],
            &[facts[&competitor[0].key()].clone()],
        )
        .await;
    assert_eq!(pairs.len(), 1);
    assert!(pairs[0].forbidden);
    assert!(pairs[0]
        .forbidden_reason
        .as_deref()
        .unwrap()
        .contains("forbidden type combination"));
}

#[tokio::test]
async fn test_forbidden_competitor_skipped_for_allowed_one() {
    let cfg = config("confidence_threshold = 0.0");
    let primary = vec![ours("p1", "Baking Powder 100g", 1.29)];
    let competitor = vec![
        theirs("c1", "Turmeric Powder 100g", 1.99),
        theirs("c2", "Baking Soda 454g", 1.10),
    ];
    let result = run(&cfg, ngram(), &primary, &competitor).await;
    let m = result.outcomes[0].resolution.matched().expect("matched");
    assert_eq!(m.competitor.product_id, "c2");
}

#[tokio::test]
async fn test_threshold_monotonicity() {
    let (primary, competitor) = catalogs();
    let mut previous: Option<HashSet<(ProductKey, ProductKey)>> = None;
    for threshold in [0.0, 0.3, 0.5, 0.65, 0.8, 0.95] {
        let cfg = config(&format!("confidence_threshold = {:.2}", threshold));
        let pairs = matched_pairs(&run(&cfg, ngram(), &primary, &competitor).await);
        if let Some(lower) = &previous {
            assert!(
                pairs.is_subset(lower),
                "matches at {} are not a subset of the lower threshold",
                threshold
            );
        }
        previous = Some(pairs);
    }
}

#[tokio::test]
async fn test_candidate_cap_bounds_scoring() {
    let cfg = config("candidate_cap = 1");
    let (primary, competitor) = catalogs();
    let result = run(&cfg, ngram(), &primary, &competitor).await;
    assert!(result.summary.candidate_pairs_scored <= primary.len());

    let rules = cfg.rules().unwrap();
    let facts = build_facts(primary.iter().chain(competitor.iter()), &rules);
    let pool: Vec<_> = competitor.iter().map(|c| facts[&c.key()].clone()).collect();
    let pairs = resolver(&cfg, ngram())
        .candidate_pairs(&facts[&primary[0].key()], &pool)
        .await;
    let scored: Vec<_> = pairs.iter().filter(|p| !p.forbidden).collect();
    assert_eq!(scored.len(), 1);
    assert_eq!(scored[0].competitor.product_id, "c1");
}

// ─── Record handling ────────────────────────────────────────────────

#[tokio::test]
async fn test_defective_records_skipped() {
    let cfg = config("");
    let primary = vec![
        ours("", "Turmeric Powder 500g", 3.99),
        ours("p2", "   ", 1.00),
        ours("p3", "Cumin Seeds 200g", 2.49),
    ];
    let competitor = vec![
        theirs("c1", "Cumin Seeds 200 g", 2.99),
        theirs("c2", "", 1.00),
    ];
    let result = run(&cfg, ngram(), &primary, &competitor).await;

    assert_eq!(
        result.outcomes[0].resolution,
        Resolution::Skipped {
            reason: SkipReason::MissingId
        }
    );
    assert_eq!(
        result.outcomes[1].resolution,
        Resolution::Skipped {
            reason: SkipReason::MissingName
        }
    );
    assert!(result.outcomes[2].resolution.matched().is_some());
    assert_eq!(result.summary.skipped[&SkipReason::MissingId], 1);
    assert_eq!(result.summary.skipped[&SkipReason::MissingName], 1);
    assert_eq!(result.summary.competitor_skipped[&SkipReason::MissingName], 1);
}

#[tokio::test]
async fn test_unpriced_match_has_no_verdict() {
    let cfg = config("");
    let primary = InMemoryCatalog {
        store_id: "ours".into(),
        products: vec![product("ours", "p1", "Cumin Seeds 200g", None)],
    };
    let competitor = InMemoryCatalog {
        store_id: "theirs".into(),
        products: vec![theirs("c1", "Cumin Seeds 200 g", 2.99)],
    };
    let report = compare(&cfg, &primary, &competitor, ngram(), None, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].verdict, None);
    assert_eq!(report.statistics.priced_records, 0);
}

// ─── Exclusivity ────────────────────────────────────────────────────

#[tokio::test]
async fn test_many_to_one_allows_shared_competitor() {
    let cfg = config("confidence_threshold = 0.5");
    let primary = vec![
        ours("p1", "Turmeric Powder 500g", 3.99),
        ours("p2", "Turmeric Powder Fine 500g", 4.29),
    ];
    let competitor = vec![theirs("c1", "Turmeric Powder 500 g", 8.47)];

    let result = run(&cfg, ngram(), &primary, &competitor).await;
    assert_eq!(result.summary.matched, 2);
    assert_eq!(result.summary.exclusivity_conflicts, 0);
}

#[tokio::test]
async fn test_greedy_gives_competitor_to_best_pair() {
    let cfg = config("confidence_threshold = 0.5\nexclusivity = \"greedy\"");
    let primary = vec![
        ours("p2", "Turmeric Powder Fine 500g", 4.29),
        ours("p1", "Turmeric Powder 500g", 3.99),
    ];
    let competitor = vec![theirs("c1", "Turmeric Powder 500 g", 8.47)];

    let result = run(&cfg, ngram(), &primary, &competitor).await;
    assert_eq!(result.summary.exclusivity, "greedy");
    assert_eq!(result.summary.matched, 1);
    assert_eq!(result.summary.exclusivity_conflicts, 1);
    assert!(matches!(
        result.outcomes[0].resolution,
        Resolution::Unmatched { best_score: Some(_) }
    ));
    let m = result.outcomes[1].resolution.matched().expect("matched");
    assert_eq!(m.primary.product_id, "p1");
    assert_eq!(m.match_type, MatchType::Exact);
}

// ─── Cancellation ───────────────────────────────────────────────────

#[tokio::test]
async fn test_pre_cancelled_run() {
    let cfg = config("");
    let (mut primary, competitor) = catalogs();
    primary.push(ours("", "No Id", 1.0));
    let cancel = CancelToken::new();
    cancel.cancel();

    let result = resolver(&cfg, ngram())
        .run(&primary, &competitor, &cancel)
        .await
        .unwrap();
    assert_eq!(result.summary.cancelled, 4);
    assert_eq!(result.summary.matched, 0);
    assert_eq!(result.summary.skipped[&SkipReason::MissingId], 1);
    assert!(result.matches().is_empty());
}

#[tokio::test]
async fn test_cancel_mid_run_keeps_resolved() {
    let cfg = config("workers = 1");
    let cancel = CancelToken::new();
    let provider = Arc::new(CancellingProvider {
        inner: NgramEmbedder::new(256),
        marker: "zanzibar",
        cancel: cancel.clone(),
    });
    let primary = vec![
        ours("p1", "Zanzibar Cloves Whole 50g", 2.0),
        ours("p2", "Zanzibar Cloves Ground 50g", 2.5),
        ours("p3", "Zanzibar Vanilla Pods 2ct", 6.0),
    ];
    let competitor = vec![theirs("c1", "Whole Cloves 50g", 2.2)];

    let result = resolver(&cfg, provider)
        .run(&primary, &competitor, &cancel)
        .await
        .unwrap();

    assert_eq!(result.summary.cancelled, 2);
    assert_eq!(result.summary.matched + result.summary.unmatched, 1);
    assert_eq!(result.outcomes.len(), 3);
}
