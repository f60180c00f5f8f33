use anyhow::{bail, Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::info;

use shelfmatch_core::classify::{Department, TaxonomyEntry};
use shelfmatch_core::normalize::SynonymGroup;
use shelfmatch_core::rules::{ForbiddenConfig, MatchRules};
use shelfmatch_core::similarity::MatchTypeBars;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub taxonomy: Vec<TaxonomyEntry>,
    #[serde(default)]
    pub forbidden: ForbiddenConfig,
    #[serde(default)]
    pub synonyms: Vec<SynonymGroup>,
    #[serde(default)]
    pub departments: Vec<Department>,
    #[serde(default)]
    pub export: ExportConfig,
    /// SHA-256 of the raw configuration text, hex encoded.
    #[serde(skip)]
    pub fingerprint: String,
}

/// Competitor-side exclusivity policy.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Exclusivity {
    /// Several primaries may resolve to the same competitor product.
    #[default]
    ManyToOne,
    /// Highest-scoring pairs claim competitor products first.
    Greedy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatchingConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_candidate_cap")]
    pub candidate_cap: usize,
    /// `0` means one worker per available core.
    #[serde(default)]
    pub workers: usize,
    #[serde(default)]
    pub exclusivity: Exclusivity,
    #[serde(default = "default_semantic_bar")]
    pub semantic_bar: f64,
    #[serde(default = "default_hybrid_bar")]
    pub hybrid_bar: f64,
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    #[serde(default = "default_max_matches_per_product")]
    pub max_matches_per_product: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            candidate_cap: default_candidate_cap(),
            workers: 0,
            exclusivity: Exclusivity::default(),
            semantic_bar: default_semantic_bar(),
            hybrid_bar: default_hybrid_bar(),
            run_timeout_secs: None,
            max_matches_per_product: default_max_matches_per_product(),
        }
    }
}

impl MatchingConfig {
    pub fn bars(&self) -> MatchTypeBars {
        MatchTypeBars {
            semantic: self.semantic_bar,
            hybrid: self.hybrid_bar,
        }
    }

    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

fn default_confidence_threshold() -> f64 {
    0.65
}
fn default_candidate_cap() -> usize {
    50
}
fn default_semantic_bar() -> f64 {
    0.9
}
fn default_hybrid_bar() -> f64 {
    0.5
}
fn default_max_matches_per_product() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Upper bound for one provider call, retries included.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_call_timeout_ms() -> u64 {
    5000
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    fn needs_model(&self) -> bool {
        matches!(self.provider.as_str(), "openai" | "ollama")
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExportConfig {
    /// Default JSON report path when `--json` is not given.
    #[serde(default)]
    pub json_path: Option<PathBuf>,
    /// Default CSV path when `--csv` is not given.
    #[serde(default)]
    pub csv_path: Option<PathBuf>,
    #[serde(default)]
    pub pretty: bool,
}

impl Config {
    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        config.fingerprint = fingerprint(content);
        Ok(config)
    }

    /// Compile the rule tables. Every taxonomy/forbidden defect is reported
    /// here, before any matching starts.
    pub fn rules(&self) -> Result<MatchRules> {
        MatchRules::new(
            &self.taxonomy,
            &self.forbidden,
            &self.synonyms,
            &self.departments,
        )
        .context("invalid matching rules")
    }

    fn validate(&self) -> Result<()> {
        let m = &self.matching;
        if !(0.0..=1.0).contains(&m.confidence_threshold) {
            bail!("matching.confidence_threshold must be in [0.0, 1.0]");
        }
        if m.candidate_cap == 0 {
            bail!("matching.candidate_cap must be > 0");
        }
        if m.max_matches_per_product == 0 {
            bail!("matching.max_matches_per_product must be >= 1");
        }
        for (name, bar) in [("semantic_bar", m.semantic_bar), ("hybrid_bar", m.hybrid_bar)] {
            if !(0.0..=1.0).contains(&bar) {
                bail!("matching.{} must be in [0.0, 1.0]", name);
            }
        }
        if m.run_timeout_secs == Some(0) {
            bail!("matching.run_timeout_secs must be > 0 when set");
        }

        let e = &self.embedding;
        match e.provider.as_str() {
            "disabled" | "ngram" | "openai" | "ollama" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, ngram, openai, or ollama.",
                other
            ),
        }
        if e.is_enabled() && e.dims == Some(0) {
            bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
        }
        if e.needs_model() {
            if e.dims.is_none() {
                bail!("embedding.dims must be set when provider is '{}'", e.provider);
            }
            if e.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    e.provider
                );
            }
        }
        if e.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
        if e.call_timeout_ms == 0 {
            bail!("embedding.call_timeout_ms must be > 0");
        }

        self.rules()?;
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config = Config::from_toml_str(&content)
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    info!(
        path = %path.display(),
        fingerprint = %config.fingerprint,
        taxonomy = config.taxonomy.len(),
        provider = %config.embedding.provider,
        "configuration loaded"
    );
    Ok(config)
}

fn fingerprint(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
