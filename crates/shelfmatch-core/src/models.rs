//! Core data models shared by the extractor, classifier, scorer, resolver,
//! and aggregator.
//!
//! Products are read-only once ingested. Everything else in this module is
//! derived from products plus configuration and is recomputed on every run.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identity of a product within the run: `(store id, product id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProductKey {
    pub store_id: String,
    pub product_id: String,
}

impl ProductKey {
    pub fn new(store_id: impl Into<String>, product_id: impl Into<String>) -> Self {
        Self {
            store_id: store_id.into(),
            product_id: product_id.into(),
        }
    }
}

impl fmt::Display for ProductKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.store_id, self.product_id)
    }
}

/// A product record as supplied by a catalog collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub store_id: String,
    pub product_id: String,
    pub name: String,
    /// Raw size descriptor as printed by the store (e.g. `"2 x 500g"`).
    #[serde(default)]
    pub size_text: Option<String>,
    /// Store-provided category label, free text.
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    /// Package price in the store's currency. Absent when not collected.
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub on_sale: bool,
}

impl Product {
    pub fn key(&self) -> ProductKey {
        ProductKey::new(self.store_id.clone(), self.product_id.clone())
    }

    /// Returns why this record cannot take part in matching, if anything.
    pub fn defect(&self) -> Option<SkipReason> {
        if self.product_id.trim().is_empty() {
            return Some(SkipReason::MissingId);
        }
        if self.name.trim().is_empty() {
            return Some(SkipReason::MissingName);
        }
        None
    }

    /// The price if it is usable for comparison (finite and non-negative).
    pub fn usable_price(&self) -> Option<f64> {
        self.price.filter(|p| p.is_finite() && *p >= 0.0)
    }
}

/// Why a product record was skipped by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingId,
    MissingName,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingId => write!(f, "missing_id"),
            Self::MissingName => write!(f, "missing_name"),
        }
    }
}

/// `(type, subtype)` assigned to a product by the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Classification {
    #[serde(rename = "type")]
    pub product_type: String,
    pub subtype: String,
}

impl Classification {
    pub fn new(product_type: impl Into<String>, subtype: impl Into<String>) -> Self {
        Self {
            product_type: product_type.into(),
            subtype: subtype.into(),
        }
    }

    /// `"type:subtype"`, the form used by forbidden-pair references.
    pub fn label(&self) -> String {
        format!("{}:{}", self.product_type, self.subtype)
    }
}

/// Units a size can be expressed in.
///
/// Mass canonicalizes to grams, volume to milliliters, and counts stay counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Gram,
    Kilogram,
    Milliliter,
    Liter,
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitFamily {
    Mass,
    Volume,
    Count,
}

impl Unit {
    pub fn family(self) -> UnitFamily {
        match self {
            Self::Gram | Self::Kilogram => UnitFamily::Mass,
            Self::Milliliter | Self::Liter => UnitFamily::Volume,
            Self::Count => UnitFamily::Count,
        }
    }

    /// The canonical unit of this unit's family.
    pub fn canonical(self) -> Unit {
        match self.family() {
            UnitFamily::Mass => Self::Gram,
            UnitFamily::Volume => Self::Milliliter,
            UnitFamily::Count => Self::Count,
        }
    }

    /// Multiplier converting a quantity in this unit to the canonical unit.
    pub fn canonical_factor(self) -> f64 {
        match self {
            Self::Kilogram | Self::Liter => 1000.0,
            Self::Gram | Self::Milliliter | Self::Count => 1.0,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Gram => "g",
            Self::Kilogram => "kg",
            Self::Milliliter => "ml",
            Self::Liter => "l",
            Self::Count => "ct",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A size descriptor resolved to a canonical quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSize {
    /// Quantity in [`NormalizedSize::unit`]; always positive.
    pub quantity: f64,
    /// Always a canonical unit (gram, milliliter, or count).
    pub unit: Unit,
    /// Extraction certainty in `[0, 1]`.
    pub confidence: f64,
    /// The text the size was extracted from.
    pub source_text: String,
}

impl NormalizedSize {
    pub fn family(&self) -> UnitFamily {
        self.unit.family()
    }

    /// Human-readable canonical rendering, e.g. `"1000 g"` or `"12 ct"`.
    pub fn display(&self) -> String {
        let q = if self.quantity.fract() == 0.0 {
            format!("{}", self.quantity as i64)
        } else {
            let s = format!("{:.3}", self.quantity);
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        };
        format!("{} {}", q, self.unit.symbol())
    }
}

/// Everything derived from one product that the pipeline needs.
///
/// Computed once per product per run and shared between workers.
#[derive(Debug, Clone)]
pub struct ProductFacts {
    pub product: Product,
    pub classification: Option<Classification>,
    pub size: Option<NormalizedSize>,
    /// Broad department used for candidate pre-filtering.
    pub department: Option<String>,
    /// Lowercased, synonym-rewritten name with sizes and stop words removed.
    pub normalized_name: String,
}

/// Derived facts keyed by product identity.
pub type FactsIndex = HashMap<ProductKey, Arc<ProductFacts>>;

/// How an accepted match was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Fuzzy,
    Semantic,
    Hybrid,
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Fuzzy => write!(f, "fuzzy"),
            Self::Semantic => write!(f, "semantic"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// A `(primary, competitor)` pair considered during resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidatePair {
    pub primary: ProductKey,
    pub competitor: ProductKey,
    pub fuzzy_score: f64,
    /// `None` when the embedding provider could not supply both vectors.
    pub semantic_score: Option<f64>,
    pub combined_score: f64,
    /// Forbidden pairs are rejected before scoring; their scores are zero.
    pub forbidden: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forbidden_reason: Option<String>,
}

impl CandidatePair {
    pub fn semantic_fallback(&self) -> bool {
        !self.forbidden && self.semantic_score.is_none()
    }
}

/// The accepted correspondence for one primary product.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub primary: ProductKey,
    pub competitor: ProductKey,
    /// The combined score of the winning pair, in `[0, 1]`.
    pub match_confidence: f64,
    pub fuzzy_score: f64,
    pub semantic_score: Option<f64>,
    pub match_type: MatchType,
    /// Advisory notes (size or price disagreements); never affect scoring.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: &str, name: &str) -> Product {
        Product {
            store_id: "s".into(),
            product_id: id.into(),
            name: name.into(),
            size_text: None,
            category: None,
            brand: None,
            price: Some(1.0),
            on_sale: false,
        }
    }

    #[test]
    fn test_defects() {
        assert_eq!(product("", "Rice").defect(), Some(SkipReason::MissingId));
        assert_eq!(product("1", "  ").defect(), Some(SkipReason::MissingName));
        assert_eq!(product("1", "Rice").defect(), None);
    }

    #[test]
    fn test_usable_price_rejects_nan_and_negative() {
        let mut p = product("1", "Rice");
        p.price = Some(f64::NAN);
        assert_eq!(p.usable_price(), None);
        p.price = Some(-2.0);
        assert_eq!(p.usable_price(), None);
        p.price = Some(0.0);
        assert_eq!(p.usable_price(), Some(0.0));
    }

    #[test]
    fn test_unit_canonicalization() {
        assert_eq!(Unit::Kilogram.canonical(), Unit::Gram);
        assert_eq!(Unit::Liter.canonical(), Unit::Milliliter);
        assert_eq!(Unit::Count.canonical(), Unit::Count);
        assert_eq!(Unit::Liter.canonical_factor(), 1000.0);
    }

    #[test]
    fn test_size_display() {
        let s = NormalizedSize {
            quantity: 1000.0,
            unit: Unit::Gram,
            confidence: 1.0,
            source_text: "1kg".into(),
        };
        assert_eq!(s.display(), "1000 g");
        let s = NormalizedSize {
            quantity: 340.194,
            ..s
        };
        assert_eq!(s.display(), "340.194 g");
    }

    #[test]
    fn test_match_type_serializes_lowercase() {
        let json = serde_json::to_string(&MatchType::Hybrid).unwrap();
        assert_eq!(json, "\"hybrid\"");
    }
}
