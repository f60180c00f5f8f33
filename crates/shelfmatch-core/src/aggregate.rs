//! Comparison Aggregator: per-unit prices, savings, and run statistics.
//!
//! # Sign convention
//!
//! ```text
//! savings         = their_price − our_price
//! savings_percent = savings / their_price × 100
//! ```
//!
//! A positive saving means the primary store is cheaper. Normalized prices
//! are per 100 g or per 100 ml. Count sizes are not normalized; their
//! package prices pass through with a note. Nothing here is cached:
//! every call recomputes from the matches it is given.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::{FactsIndex, Match, MatchType, NormalizedSize, ProductFacts, UnitFamily};

/// Savings smaller than half a cent count as a tie.
const TIE_EPSILON: f64 = 0.005;

/// Category label used when a product maps to no department.
pub const OTHER_DEPARTMENT: &str = "Other";

/// Which store is cheaper for a compared pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    WeCheaper,
    TheyCheaper,
    Tie,
}

/// A match enriched with price fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRecord {
    pub primary_store: String,
    pub primary_id: String,
    pub competitor_store: String,
    pub competitor_id: String,
    pub primary_name: String,
    pub competitor_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub our_brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub their_brand: Option<String>,
    pub category: String,
    pub our_price: Option<f64>,
    pub their_price: Option<f64>,
    pub our_size: Option<String>,
    pub their_size: Option<String>,
    pub our_normalized_price: Option<f64>,
    pub their_normalized_price: Option<f64>,
    /// `"100g"` or `"100ml"`, or `"package"` for count sizes passed through
    /// unnormalized.
    pub normalized_unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalization_note: Option<String>,
    pub normalized_savings_percent: Option<f64>,
    /// Rounded to cents.
    pub savings: Option<f64>,
    pub savings_percent: Option<f64>,
    pub verdict: Option<Verdict>,
    pub match_confidence: f64,
    pub match_type: MatchType,
    pub our_on_sale: bool,
    pub their_on_sale: bool,
}

/// Summary over the records of one competitor store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComparisonStatistics {
    pub total_records: usize,
    /// Records where both prices were usable; the denominator of the verdict
    /// percentages.
    pub priced_records: usize,
    pub we_cheaper_count: usize,
    pub they_cheaper_count: usize,
    pub tie_count: usize,
    pub we_cheaper_percent: f64,
    pub they_cheaper_percent: f64,
    pub tie_percent: f64,
    /// Mean of `savings` over priced records, in currency units.
    pub average_savings_amount: Option<f64>,
    pub average_savings_percent: Option<f64>,
    pub average_normalized_savings_percent: Option<f64>,
    pub average_match_confidence: Option<f64>,
    /// Share of record sides (two per record) with an extracted size, 0–100.
    pub size_extraction_rate: f64,
    /// Share of records with both normalized prices, 0–100.
    pub normalization_rate: f64,
    pub match_types: BTreeMap<MatchType, usize>,
}

/// Build comparison records for `matches` and summarize them.
///
/// Matches whose products are not in `facts` are dropped.
pub fn aggregate(
    matches: &[Match],
    facts: &FactsIndex,
) -> (Vec<ComparisonRecord>, ComparisonStatistics) {
    let records: Vec<ComparisonRecord> = matches
        .iter()
        .filter_map(|m| {
            let ours = facts.get(&m.primary)?;
            let theirs = facts.get(&m.competitor)?;
            Some(compare(m, ours, theirs))
        })
        .collect();
    let stats = statistics(&records);
    (records, stats)
}

/// Compare one matched pair.
pub fn compare(m: &Match, ours: &ProductFacts, theirs: &ProductFacts) -> ComparisonRecord {
    let our_price = ours.product.usable_price();
    let their_price = theirs.product.usable_price();

    let (savings, savings_percent, verdict) = match (our_price, their_price) {
        (Some(o), Some(t)) => {
            let raw = t - o;
            let percent = (t > 0.0).then(|| raw / t * 100.0);
            let verdict = if raw.abs() < TIE_EPSILON {
                Verdict::Tie
            } else if raw > 0.0 {
                Verdict::WeCheaper
            } else {
                Verdict::TheyCheaper
            };
            (Some(round_cents(raw)), percent, Some(verdict))
        }
        _ => (None, None, None),
    };

    let norm = normalize_pair(our_price, ours.size.as_ref(), their_price, theirs.size.as_ref());

    ComparisonRecord {
        primary_store: m.primary.store_id.clone(),
        primary_id: m.primary.product_id.clone(),
        competitor_store: m.competitor.store_id.clone(),
        competitor_id: m.competitor.product_id.clone(),
        primary_name: ours.product.name.clone(),
        competitor_name: theirs.product.name.clone(),
        our_brand: ours.product.brand.clone(),
        their_brand: theirs.product.brand.clone(),
        category: ours
            .department
            .clone()
            .or_else(|| theirs.department.clone())
            .unwrap_or_else(|| OTHER_DEPARTMENT.to_string()),
        our_price,
        their_price,
        our_size: ours.size.as_ref().map(NormalizedSize::display),
        their_size: theirs.size.as_ref().map(NormalizedSize::display),
        our_normalized_price: norm.ours,
        their_normalized_price: norm.theirs,
        normalized_unit: norm.unit.map(str::to_string),
        normalization_note: norm.note,
        normalized_savings_percent: norm.savings_percent,
        savings,
        savings_percent,
        verdict,
        match_confidence: m.match_confidence,
        match_type: m.match_type,
        our_on_sale: ours.product.on_sale,
        their_on_sale: theirs.product.on_sale,
    }
}

#[derive(Debug, Default)]
struct NormalizedPair {
    ours: Option<f64>,
    theirs: Option<f64>,
    unit: Option<&'static str>,
    note: Option<String>,
    savings_percent: Option<f64>,
}

fn normalize_pair(
    our_price: Option<f64>,
    our_size: Option<&NormalizedSize>,
    their_price: Option<f64>,
    their_size: Option<&NormalizedSize>,
) -> NormalizedPair {
    let (Some(op), Some(os), Some(tp), Some(ts)) = (our_price, our_size, their_price, their_size)
    else {
        return NormalizedPair::default();
    };
    if os.family() != ts.family() {
        return NormalizedPair {
            note: Some(format!(
                "sizes not comparable: {} vs {}",
                os.display(),
                ts.display()
            )),
            ..Default::default()
        };
    }
    if os.quantity <= 0.0 || ts.quantity <= 0.0 {
        return NormalizedPair::default();
    }

    let (ours, theirs, unit, note) = match os.family() {
        UnitFamily::Mass => (op / os.quantity * 100.0, tp / ts.quantity * 100.0, "100g", None),
        UnitFamily::Volume => (op / os.quantity * 100.0, tp / ts.quantity * 100.0, "100ml", None),
        UnitFamily::Count => (
            op,
            tp,
            "package",
            Some(format!(
                "count sizes not normalized: {} vs {}",
                os.display(),
                ts.display()
            )),
        ),
    };

    NormalizedPair {
        ours: Some(ours),
        theirs: Some(theirs),
        unit: Some(unit),
        note,
        savings_percent: (theirs > 0.0).then(|| (theirs - ours) / theirs * 100.0),
    }
}

/// Summarize a set of records. Always recomputed from scratch.
pub fn statistics(records: &[ComparisonRecord]) -> ComparisonStatistics {
    let mut stats = ComparisonStatistics {
        total_records: records.len(),
        ..Default::default()
    };
    if records.is_empty() {
        return stats;
    }

    for r in records {
        match r.verdict {
            Some(Verdict::WeCheaper) => stats.we_cheaper_count += 1,
            Some(Verdict::TheyCheaper) => stats.they_cheaper_count += 1,
            Some(Verdict::Tie) => stats.tie_count += 1,
            None => {}
        }
        *stats.match_types.entry(r.match_type).or_insert(0) += 1;
    }

    stats.priced_records = stats.we_cheaper_count + stats.they_cheaper_count + stats.tie_count;
    stats.we_cheaper_percent = percent(stats.we_cheaper_count, stats.priced_records);
    stats.they_cheaper_percent = percent(stats.they_cheaper_count, stats.priced_records);
    stats.tie_percent = percent(stats.tie_count, stats.priced_records);

    stats.average_savings_amount = mean(records.iter().filter_map(|r| r.savings));
    stats.average_savings_percent = mean(records.iter().filter_map(|r| r.savings_percent));
    stats.average_normalized_savings_percent =
        mean(records.iter().filter_map(|r| r.normalized_savings_percent));
    stats.average_match_confidence = mean(records.iter().map(|r| r.match_confidence));

    let sized_sides = records
        .iter()
        .map(|r| r.our_size.is_some() as usize + r.their_size.is_some() as usize)
        .sum::<usize>();
    stats.size_extraction_rate = percent(sized_sides, records.len() * 2);
    stats.normalization_rate = percent(
        records
            .iter()
            .filter(|r| r.our_normalized_price.is_some() && r.their_normalized_price.is_some())
            .count(),
        records.len(),
    );

    stats
}

fn percent(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
