//! Match Resolver.
//!
//! Drives one matching run between a primary and a competitor catalog:
//!
//! 1. Derive facts for every product once ([`build_facts`]).
//! 2. Warm the embedding cache with competitor names.
//! 3. Resolve every primary product on a bounded worker pool. Each primary
//!    moves `Pending → Scoring → {Matched, Unmatched}`; defective records
//!    are skipped and primaries not started before cancellation are
//!    reported as cancelled.
//! 4. Barrier. Apply the exclusivity policy and assemble a [`MatchRun`] in
//!    primary catalog order.
//!
//! Per primary: narrow candidates to the same department when possible,
//! reject forbidden pairs unscored, pre-rank by fuzzy score and truncate to
//! the candidate cap, score the rest with semantic fallback, rank by
//! `(combined desc, fuzzy desc, competitor id asc)`, and accept at or above
//! the confidence threshold.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use shelfmatch_core::models::{
    CandidatePair, FactsIndex, Match, Product, ProductFacts, ProductKey, SkipReason,
};
use shelfmatch_core::rules::MatchRules;
use shelfmatch_core::similarity::{
    accepts, fuzzy_score, match_type, rank, score_key, ScoreBreakdown,
};

use crate::cache::{build_facts, CacheStats, EmbeddingCache};
use crate::config::{Config, Exclusivity, MatchingConfig};
use crate::scorer::{embed_text, Scorer};

/// Size ratio beyond which a match carries a warning.
const SIZE_RATIO_WARNING: f64 = 2.0;
/// Absolute price ratio beyond which a match carries a warning.
const PRICE_RATIO_WARNING: f64 = 5.0;

/// Shared cancellation flag, checked before each primary product.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Terminal state of one primary product.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Resolution {
    Matched {
        #[serde(rename = "match")]
        best: Match,
        /// Further accepted candidates, best first, excluding `best`.
        alternatives: Vec<Match>,
    },
    Unmatched {
        /// Highest combined score seen, if any pair was scored.
        best_score: Option<f64>,
    },
    Skipped {
        reason: SkipReason,
    },
    Cancelled,
}

impl Resolution {
    pub fn matched(&self) -> Option<&Match> {
        match self {
            Self::Matched { best, .. } => Some(best),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrimaryOutcome {
    pub primary: ProductKey,
    pub resolution: Resolution,
}

/// Structured audit of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub config_fingerprint: String,
    pub primary_store: String,
    pub competitor_store: String,
    pub confidence_threshold: f64,
    pub exclusivity: String,
    pub embedding_model: String,
    pub primaries_total: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub cancelled: usize,
    pub skipped: BTreeMap<SkipReason, usize>,
    pub competitor_skipped: BTreeMap<SkipReason, usize>,
    pub candidate_pairs_scored: usize,
    pub candidate_pairs_forbidden: usize,
    pub semantic_fallbacks: usize,
    /// Matches released by the greedy policy because another primary won
    /// their competitor product.
    pub exclusivity_conflicts: usize,
    pub embedding: CacheStats,
}

/// Everything a run produces.
#[derive(Debug, Clone)]
pub struct MatchRun {
    pub summary: RunSummary,
    /// One outcome per primary record, in catalog order.
    pub outcomes: Vec<PrimaryOutcome>,
    /// Facts for every valid product of both catalogs.
    pub facts: FactsIndex,
}

impl MatchRun {
    /// Accepted matches in primary catalog order.
    pub fn matches(&self) -> Vec<Match> {
        self.outcomes
            .iter()
            .filter_map(|o| o.resolution.matched().cloned())
            .collect()
    }
}

/// Counters from resolving one primary.
#[derive(Debug, Default, Clone, Copy)]
struct PrimaryCounts {
    scored: usize,
    forbidden: usize,
    fallbacks: usize,
}

/// Competitor pools shared read-only by every worker.
struct CandidatePools {
    all: Vec<Arc<ProductFacts>>,
    by_department: HashMap<String, Vec<Arc<ProductFacts>>>,
}

impl CandidatePools {
    fn new(competitors: Vec<Arc<ProductFacts>>) -> Self {
        let mut by_department: HashMap<String, Vec<Arc<ProductFacts>>> = HashMap::new();
        for c in &competitors {
            if let Some(d) = &c.department {
                by_department.entry(d.clone()).or_default().push(c.clone());
            }
        }
        Self {
            all: competitors,
            by_department,
        }
    }

    fn for_primary(&self, primary: &ProductFacts) -> &[Arc<ProductFacts>] {
        primary
            .department
            .as_ref()
            .and_then(|d| self.by_department.get(d))
            .filter(|pool| !pool.is_empty())
            .map(Vec::as_slice)
            .unwrap_or(&self.all)
    }
}

#[derive(Clone)]
pub struct Resolver {
    matching: MatchingConfig,
    rules: Arc<MatchRules>,
    scorer: Scorer,
    fingerprint: String,
}

impl Resolver {
    pub fn new(config: &Config, rules: Arc<MatchRules>, cache: Arc<EmbeddingCache>) -> Self {
        Self {
            matching: config.matching.clone(),
            rules,
            scorer: Scorer::new(cache),
            fingerprint: config.fingerprint.clone(),
        }
    }

    /// Override the acceptance threshold for this resolver.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.matching.confidence_threshold = threshold;
        self
    }

    pub fn matching(&self) -> &MatchingConfig {
        &self.matching
    }

    /// Run matching between two catalogs.
    ///
    /// Never fails on data: defective records are skipped, provider failures
    /// degrade to fuzzy scoring, and cancellation returns what was resolved.
    pub async fn run(
        &self,
        primary: &[Product],
        competitor: &[Product],
        cancel: &CancelToken,
    ) -> Result<MatchRun> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let deadline = self
            .matching
            .run_timeout_secs
            .map(|s| Instant::now() + Duration::from_secs(s));

        let primary_store = store_of(primary);
        let competitor_store = store_of(competitor);
        info!(
            run_id = %run_id,
            primary = %primary_store,
            competitor = %competitor_store,
            primaries = primary.len(),
            competitors = competitor.len(),
            threshold = self.matching.confidence_threshold,
            "starting match run"
        );

        let mut competitor_skipped = BTreeMap::new();
        let valid_competitors: Vec<&Product> = competitor
            .iter()
            .filter(|p| match p.defect() {
                Some(reason) => {
                    *competitor_skipped.entry(reason).or_insert(0) += 1;
                    false
                }
                None => true,
            })
            .collect();

        let facts = build_facts(
            primary
                .iter()
                .filter(|p| p.defect().is_none())
                .chain(valid_competitors.iter().copied()),
            &self.rules,
        );

        let mut seen = HashSet::new();
        let competitor_facts: Vec<Arc<ProductFacts>> = valid_competitors
            .iter()
            .filter(|p| seen.insert(p.key()))
            .filter_map(|p| facts.get(&p.key()).cloned())
            .collect();
        let names: Vec<String> = competitor_facts.iter().map(|c| embed_text(c)).collect();
        self.scorer.cache().prefetch(&names).await;
        let pools = Arc::new(CandidatePools::new(competitor_facts));

        let mut slots: Vec<Option<(Resolution, PrimaryCounts)>> = vec![None; primary.len()];
        let semaphore = Arc::new(Semaphore::new(self.matching.effective_workers().max(1)));
        let mut tasks = JoinSet::new();

        for (index, product) in primary.iter().enumerate() {
            if let Some(reason) = product.defect() {
                debug!(product = %product.key(), %reason, "skipping primary record");
                slots[index] = Some((Resolution::Skipped { reason }, PrimaryCounts::default()));
                continue;
            }
            let Some(primary_facts) = facts.get(&product.key()).cloned() else {
                continue;
            };
            let resolver = self.clone();
            let pools = pools.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let expired = deadline.is_some_and(|d| Instant::now() >= d);
                if cancel.is_cancelled() || expired {
                    return (index, Resolution::Cancelled, PrimaryCounts::default());
                }
                let (resolution, counts) = resolver.resolve_one(&primary_facts, &pools).await;
                (index, resolution, counts)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, resolution, counts)) => slots[index] = Some((resolution, counts)),
                Err(e) => warn!(error = %e, "resolver worker failed"),
            }
        }

        let mut outcomes = Vec::with_capacity(primary.len());
        let mut totals = PrimaryCounts::default();
        for (product, slot) in primary.iter().zip(slots) {
            let (resolution, counts) = slot.unwrap_or((Resolution::Cancelled, PrimaryCounts::default()));
            totals.scored += counts.scored;
            totals.forbidden += counts.forbidden;
            totals.fallbacks += counts.fallbacks;
            outcomes.push(PrimaryOutcome {
                primary: product.key(),
                resolution,
            });
        }

        let conflicts = match self.matching.exclusivity {
            Exclusivity::ManyToOne => 0,
            Exclusivity::Greedy => apply_greedy(&mut outcomes),
        };

        let summary = self.summarize(
            run_id,
            started_at,
            primary_store,
            competitor_store,
            &outcomes,
            competitor_skipped,
            totals,
            conflicts,
        );
        info!(
            run_id = %summary.run_id,
            matched = summary.matched,
            unmatched = summary.unmatched,
            skipped = summary.skipped.values().sum::<usize>(),
            cancelled = summary.cancelled,
            fallbacks = summary.semantic_fallbacks,
            "match run finished"
        );

        Ok(MatchRun {
            summary,
            outcomes,
            facts,
        })
    }

    /// All candidate pairs for one primary, ranked best first. Forbidden
    /// pairs come last, unscored.
    pub async fn candidate_pairs(
        &self,
        primary: &ProductFacts,
        competitors: &[Arc<ProductFacts>],
    ) -> Vec<CandidatePair> {
        let (pairs, _) = self.score_candidates(primary, competitors).await;
        pairs
    }

    async fn resolve_one(
        &self,
        primary: &ProductFacts,
        pools: &CandidatePools,
    ) -> (Resolution, PrimaryCounts) {
        let (pairs, counts) = self
            .score_candidates(primary, pools.for_primary(primary))
            .await;

        let best_score = pairs.iter().find(|p| !p.forbidden).map(|p| p.combined_score);
        let accepted: Vec<Match> = pairs
            .iter()
            .filter(|p| !p.forbidden && accepts(p.combined_score, self.matching.confidence_threshold))
            .take(self.matching.max_matches_per_product)
            .filter_map(|p| self.to_match(primary, p, &pools.all))
            .collect();

        let mut accepted = accepted.into_iter();
        let resolution = match accepted.next() {
            Some(best) => {
                debug!(
                    primary = %primary.product.key(),
                    competitor = %best.competitor,
                    confidence = best.match_confidence,
                    match_type = %best.match_type,
                    "matched"
                );
                Resolution::Matched {
                    best,
                    alternatives: accepted.collect(),
                }
            }
            None => {
                debug!(primary = %primary.product.key(), ?best_score, "unmatched");
                Resolution::Unmatched { best_score }
            }
        };
        (resolution, counts)
    }

    async fn score_candidates(
        &self,
        primary: &ProductFacts,
        competitors: &[Arc<ProductFacts>],
    ) -> (Vec<CandidatePair>, PrimaryCounts) {
        let mut counts = PrimaryCounts::default();
        let mut forbidden = Vec::new();
        let mut allowed: Vec<(f64, Arc<ProductFacts>)> = Vec::new();

        for c in competitors {
            if let Some(reason) = self.rules.forbidden.check(primary, c) {
                forbidden.push(CandidatePair {
                    primary: primary.product.key(),
                    competitor: c.product.key(),
                    fuzzy_score: 0.0,
                    semantic_score: None,
                    combined_score: 0.0,
                    forbidden: true,
                    forbidden_reason: Some(reason),
                });
                continue;
            }
            allowed.push((fuzzy_score(&primary.normalized_name, &c.normalized_name), c.clone()));
        }

        // Cheap pre-rank so the cap bounds embedding work.
        allowed.sort_by(|(fa, a), (fb, b)| {
            score_key(*fb)
                .cmp(&score_key(*fa))
                .then_with(|| a.product.product_id.cmp(&b.product.product_id))
        });
        allowed.truncate(self.matching.candidate_cap);

        let candidates: Vec<Arc<ProductFacts>> = allowed.into_iter().map(|(_, c)| c).collect();
        let scores = self.scorer.score_all(primary, &candidates).await;

        let mut ranked: Vec<(ScoreBreakdown, &Arc<ProductFacts>)> =
            scores.into_iter().zip(candidates.iter()).collect();
        ranked.sort_by(|(sa, a), (sb, b)| {
            rank(sa, &a.product.product_id, sb, &b.product.product_id)
        });

        counts.scored = ranked.len();
        counts.forbidden = forbidden.len();
        counts.fallbacks = ranked.iter().filter(|(s, _)| s.fallback()).count();

        let mut pairs: Vec<CandidatePair> = ranked
            .into_iter()
            .map(|(s, c)| CandidatePair {
                primary: primary.product.key(),
                competitor: c.product.key(),
                fuzzy_score: s.fuzzy,
                semantic_score: s.semantic,
                combined_score: s.combined,
                forbidden: false,
                forbidden_reason: None,
            })
            .collect();
        forbidden.sort_by(|a, b| a.competitor.cmp(&b.competitor));
        pairs.extend(forbidden);
        (pairs, counts)
    }

    fn to_match(
        &self,
        primary: &ProductFacts,
        pair: &CandidatePair,
        competitors: &[Arc<ProductFacts>],
    ) -> Option<Match> {
        let competitor = competitors
            .iter()
            .find(|c| c.product.key() == pair.competitor)?;
        let scores = ScoreBreakdown {
            fuzzy: pair.fuzzy_score,
            semantic: pair.semantic_score,
            combined: pair.combined_score,
        };
        Some(Match {
            primary: pair.primary.clone(),
            competitor: pair.competitor.clone(),
            match_confidence: pair.combined_score,
            fuzzy_score: pair.fuzzy_score,
            semantic_score: pair.semantic_score,
            match_type: match_type(
                &primary.normalized_name,
                &competitor.normalized_name,
                &scores,
                self.matching.bars(),
            ),
            warnings: warnings(primary, competitor),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn summarize(
        &self,
        run_id: String,
        started_at: DateTime<Utc>,
        primary_store: String,
        competitor_store: String,
        outcomes: &[PrimaryOutcome],
        competitor_skipped: BTreeMap<SkipReason, usize>,
        totals: PrimaryCounts,
        conflicts: usize,
    ) -> RunSummary {
        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            config_fingerprint: self.fingerprint.clone(),
            primary_store,
            competitor_store,
            confidence_threshold: self.matching.confidence_threshold,
            exclusivity: match self.matching.exclusivity {
                Exclusivity::ManyToOne => "many_to_one".to_string(),
                Exclusivity::Greedy => "greedy".to_string(),
            },
            embedding_model: self.scorer.cache().model_name().to_string(),
            primaries_total: outcomes.len(),
            matched: 0,
            unmatched: 0,
            cancelled: 0,
            skipped: BTreeMap::new(),
            competitor_skipped,
            candidate_pairs_scored: totals.scored,
            candidate_pairs_forbidden: totals.forbidden,
            semantic_fallbacks: totals.fallbacks,
            exclusivity_conflicts: conflicts,
            embedding: self.scorer.cache().stats(),
        };
        for o in outcomes {
            match &o.resolution {
                Resolution::Matched { .. } => summary.matched += 1,
                Resolution::Unmatched { .. } => summary.unmatched += 1,
                Resolution::Cancelled => summary.cancelled += 1,
                Resolution::Skipped { reason } => *summary.skipped.entry(*reason).or_insert(0) += 1,
            }
        }
        summary
    }
}

/// Claim competitor products highest score first. Returns how many
/// primaries lost their original best match.
fn apply_greedy(outcomes: &mut [PrimaryOutcome]) -> usize {
    let mut offers: Vec<(usize, Match)> = Vec::new();
    for (i, o) in outcomes.iter().enumerate() {
        if let Resolution::Matched { best, alternatives } = &o.resolution {
            offers.push((i, best.clone()));
            offers.extend(alternatives.iter().cloned().map(|m| (i, m)));
        }
    }
    offers.sort_by(|(_, a), (_, b)| greedy_order(a, b));

    let mut claimed: HashMap<ProductKey, usize> = HashMap::new();
    let mut winner: HashMap<usize, Match> = HashMap::new();
    for (i, m) in offers {
        if winner.contains_key(&i) || claimed.contains_key(&m.competitor) {
            continue;
        }
        claimed.insert(m.competitor.clone(), i);
        winner.insert(i, m);
    }

    let mut conflicts = 0;
    for (i, o) in outcomes.iter_mut().enumerate() {
        let Resolution::Matched { best, alternatives } = &o.resolution else {
            continue;
        };
        let original = best.competitor.clone();
        let best_score = Some(best.match_confidence);
        let remaining: Vec<Match> = std::iter::once(best.clone())
            .chain(alternatives.iter().cloned())
            .filter(|m| claimed.get(&m.competitor).map_or(true, |owner| *owner == i))
            .collect();

        o.resolution = match winner.remove(&i) {
            Some(won) => {
                if won.competitor != original {
                    conflicts += 1;
                }
                let alternatives = remaining
                    .into_iter()
                    .filter(|m| m.competitor != won.competitor)
                    .collect();
                Resolution::Matched {
                    best: won,
                    alternatives,
                }
            }
            None => {
                conflicts += 1;
                Resolution::Unmatched { best_score }
            }
        };
    }
    conflicts
}

fn greedy_order(a: &Match, b: &Match) -> CmpOrdering {
    score_key(b.match_confidence)
        .cmp(&score_key(a.match_confidence))
        .then_with(|| score_key(b.fuzzy_score).cmp(&score_key(a.fuzzy_score)))
        .then_with(|| a.primary.cmp(&b.primary))
        .then_with(|| a.competitor.cmp(&b.competitor))
}

/// Advisory notes about a pair. Never affects scoring or acceptance.
fn warnings(ours: &ProductFacts, theirs: &ProductFacts) -> Vec<String> {
    let mut out = Vec::new();
    if let (Some(a), Some(b)) = (&ours.size, &theirs.size) {
        if a.family() != b.family() {
            out.push(format!(
                "size units differ: {} vs {}",
                a.display(),
                b.display()
            ));
        } else if a.quantity > 0.0 && b.quantity > 0.0 {
            let ratio = a.quantity.max(b.quantity) / a.quantity.min(b.quantity);
            if ratio > SIZE_RATIO_WARNING {
                out.push(format!(
                    "package sizes differ {:.1}x: {} vs {}",
                    ratio,
                    a.display(),
                    b.display()
                ));
            }
        }
    }
    if let (Some(a), Some(b)) = (ours.product.usable_price(), theirs.product.usable_price()) {
        if a > 0.0 && b > 0.0 {
            let ratio = a.max(b) / a.min(b);
            if ratio > PRICE_RATIO_WARNING {
                out.push(format!("prices differ {:.1}x: {:.2} vs {:.2}", ratio, a, b));
            }
        }
    }
    out
}

fn store_of(products: &[Product]) -> String {
    products
        .first()
        .map(|p| p.store_id.clone())
        .unwrap_or_default()
}
