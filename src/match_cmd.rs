use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use shelfmatch_core::embedding::EmbeddingProvider;
use shelfmatch_core::models::Product;
use shelfmatch_core::size;

use crate::cache::EmbeddingCache;
use crate::catalog::{CatalogSource, JsonCatalog};
use crate::config::Config;
use crate::embedding;
use crate::export::{self, ComparisonReport};
use crate::resolver::{CancelToken, Resolver};

/// Options for `shelfmatch run`.
#[derive(Debug, Clone, Default)]
pub struct MatchOptions {
    pub primary: PathBuf,
    pub competitor: PathBuf,
    pub json: Option<PathBuf>,
    pub csv: Option<PathBuf>,
    pub threshold: Option<f64>,
}

/// Load both catalogs, match them, and aggregate the result.
pub async fn compare(
    config: &Config,
    primary: &dyn CatalogSource,
    competitor: &dyn CatalogSource,
    provider: Arc<dyn EmbeddingProvider>,
    threshold: Option<f64>,
    cancel: &CancelToken,
) -> Result<ComparisonReport> {
    if let Some(t) = threshold {
        if !(0.0..=1.0).contains(&t) {
            bail!("threshold must be in [0.0, 1.0], got {}", t);
        }
    }
    if primary.store_id() == competitor.store_id() {
        bail!(
            "primary and competitor catalogs have the same store id '{}'",
            primary.store_id()
        );
    }

    let rules = Arc::new(config.rules()?);
    let primary_products: Vec<Product> = primary.load().await?;
    let competitor_products: Vec<Product> = competitor.load().await?;

    let cache = Arc::new(EmbeddingCache::new(
        provider,
        config.embedding.batch_size,
        Duration::from_millis(config.embedding.call_timeout_ms),
    ));
    let mut resolver = Resolver::new(config, rules, cache);
    if let Some(t) = threshold {
        resolver = resolver.with_threshold(t);
    }

    let run = resolver
        .run(&primary_products, &competitor_products, cancel)
        .await?;
    Ok(ComparisonReport::from_run(&run))
}

/// `shelfmatch run`: match two catalog files and write the report.
pub async fn run_match(config: &Config, opts: &MatchOptions) -> Result<()> {
    let primary = JsonCatalog::open(&opts.primary, None)?;
    let competitor = JsonCatalog::open(&opts.competitor, None)?;
    let provider = embedding::create_provider(&config.embedding)?;

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight products");
            on_signal.cancel();
        }
    });

    let report = compare(
        config,
        &primary,
        &competitor,
        provider,
        opts.threshold,
        &cancel,
    )
    .await?;

    let json_path = opts.json.as_deref().or(config.export.json_path.as_deref());
    let csv_path = opts.csv.as_deref().or(config.export.csv_path.as_deref());

    match json_path {
        Some(path) if path == Path::new("-") => {
            export::write_json(&report, None, config.export.pretty)?;
        }
        Some(path) => {
            export::write_json(&report, Some(path), config.export.pretty)?;
            info!(path = %path.display(), "wrote JSON report");
        }
        None => {}
    }
    if let Some(path) = csv_path {
        export::write_csv_file(&report.records, path)?;
        info!(path = %path.display(), "wrote CSV report");
    }

    if json_path != Some(Path::new("-")) {
        print_summary(&report);
    }
    Ok(())
}

fn print_summary(report: &ComparisonReport) {
    let s = &report.summary;
    let st = &report.statistics;
    println!("match {} vs {}", report.primary_store, report.competitor_store);
    println!("  run: {}", s.run_id);
    println!("  primaries: {}", s.primaries_total);
    println!("  matched: {}", s.matched);
    println!("  unmatched: {}", s.unmatched);
    println!("  skipped: {}", s.skipped.values().sum::<usize>());
    if s.cancelled > 0 {
        println!("  cancelled: {}", s.cancelled);
    }
    println!("  pairs scored: {}", s.candidate_pairs_scored);
    println!("  pairs forbidden: {}", s.candidate_pairs_forbidden);
    println!("  semantic fallbacks: {}", s.semantic_fallbacks);
    println!(
        "  we cheaper: {} ({:.1}%)",
        st.we_cheaper_count, st.we_cheaper_percent
    );
    println!(
        "  they cheaper: {} ({:.1}%)",
        st.they_cheaper_count, st.they_cheaper_percent
    );
    println!("  ties: {} ({:.1}%)", st.tie_count, st.tie_percent);
    match (st.average_savings_amount, st.average_savings_percent) {
        (Some(a), Some(p)) => println!("  average savings: ${:.2} ({:.1}%)", a, p),
        (Some(a), None) => println!("  average savings: ${:.2}", a),
        _ => println!("  average savings: N/A"),
    }
}

/// `shelfmatch size`: show how a size descriptor normalizes.
pub fn run_size(text: &str) -> Result<()> {
    match size::extract(text) {
        Some(s) => {
            println!("size: {}", s.display());
            println!("  quantity: {}", s.quantity);
            println!("  unit: {}", s.unit);
            println!("  confidence: {:.2}", s.confidence);
        }
        None => println!("size: unextracted"),
    }
    Ok(())
}

/// `shelfmatch classify`: show the derived facts for a product name.
pub fn run_classify(config: &Config, name: &str, category: Option<&str>) -> Result<()> {
    let rules = config.rules()?;
    let product = Product {
        store_id: "cli".to_string(),
        product_id: "cli".to_string(),
        name: name.to_string(),
        size_text: None,
        category: category.map(str::to_string),
        brand: None,
        price: None,
        on_sale: false,
    };
    let facts = rules.facts(&product);
    match &facts.classification {
        Some(c) => println!("classification: {}", c.label()),
        None => println!("classification: unclassified"),
    }
    println!(
        "  department: {}",
        facts.department.as_deref().unwrap_or("-")
    );
    println!("  normalized: {}", facts.normalized_name);
    match &facts.size {
        Some(s) => println!("  size: {} (confidence {:.2})", s.display(), s.confidence),
        None => println!("  size: unextracted"),
    }
    Ok(())
}

/// `shelfmatch check`: validate configuration and print what was loaded.
pub fn run_check(config: &Config) -> Result<()> {
    let rules = config.rules()?;
    println!("config ok");
    println!("  fingerprint: {}", config.fingerprint);
    println!("  taxonomy entries: {}", rules.taxonomy.len());
    println!("  forbidden rules: {}", rules.forbidden.len());
    println!("  synonyms: {}", rules.synonyms.len());
    println!("  embedding provider: {}", config.embedding.provider);
    println!(
        "  threshold: {:.2}",
        config.matching.confidence_threshold
    );
    Ok(())
}
