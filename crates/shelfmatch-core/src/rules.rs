//! Forbidden-pair rules and the compiled rule set for a run.
//!
//! A pair of products is forbidden when their classifications appear in the
//! configured forbidden type pairs (checked in both orders), or when their
//! names trip a keyword rule such as "baking powder" vs "cumin|turmeric".
//! Type pairs need both sides classified; keyword rules look at names only.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::classify::{Department, Departments, Taxonomy, TaxonomyEntry};
use crate::models::{Classification, Product, ProductFacts};
use crate::normalize::{normalize_name, search_text, SynonymGroup, SynonymTable};
use crate::size;

/// A reference to a type (`"spice"`) or a type+subtype (`"spice:whole"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Type(String),
    Subtype(String, String),
}

impl TypeRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        match raw.split_once(':') {
            Some((t, s)) if !t.trim().is_empty() && !s.trim().is_empty() => {
                Ok(Self::Subtype(t.trim().to_string(), s.trim().to_string()))
            }
            Some(_) => bail!("malformed type reference '{}'", raw),
            None if !raw.is_empty() => Ok(Self::Type(raw.to_string())),
            None => bail!("empty type reference"),
        }
    }

    pub fn matches(&self, c: &Classification) -> bool {
        match self {
            Self::Type(t) => &c.product_type == t,
            Self::Subtype(t, s) => &c.product_type == t && &c.subtype == s,
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type(t) => write!(f, "{}", t),
            Self::Subtype(t, s) => write!(f, "{}:{}", t, s),
        }
    }
}

/// A name-based forbidden rule as written in configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeywordRule {
    pub left: Vec<String>,
    pub right: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// The `[forbidden]` configuration section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ForbiddenConfig {
    #[serde(default)]
    pub pairs: Vec<[String; 2]>,
    #[serde(default)]
    pub keywords: Vec<KeywordRule>,
}

#[derive(Debug, Clone)]
struct CompiledKeywordRule {
    left: Vec<String>,
    right: Vec<String>,
    reason: String,
}

impl CompiledKeywordRule {
    fn hits(&self, a: &str, b: &str) -> bool {
        let any = |kws: &[String], text: &str| kws.iter().any(|k| text.contains(k.as_str()));
        (any(&self.left, a) && any(&self.right, b)) || (any(&self.right, a) && any(&self.left, b))
    }
}

/// Compiled forbidden rules.
#[derive(Debug, Clone, Default)]
pub struct ForbiddenRules {
    pairs: Vec<(TypeRef, TypeRef)>,
    keywords: Vec<CompiledKeywordRule>,
}

impl ForbiddenRules {
    /// Compile forbidden rules, checking every type reference against the
    /// taxonomy.
    pub fn new(config: &ForbiddenConfig, taxonomy: &Taxonomy) -> Result<Self> {
        let mut pairs = Vec::with_capacity(config.pairs.len());
        for [a, b] in &config.pairs {
            let a = TypeRef::parse(a)?;
            let b = TypeRef::parse(b)?;
            for r in [&a, &b] {
                let declared = match r {
                    TypeRef::Type(t) => taxonomy.declares(t, None),
                    TypeRef::Subtype(t, s) => taxonomy.declares(t, Some(s)),
                };
                if !declared {
                    bail!("forbidden pair references '{}', which is not in the taxonomy", r);
                }
            }
            pairs.push((a, b));
        }

        let mut keywords = Vec::with_capacity(config.keywords.len());
        for rule in &config.keywords {
            let pad = |kws: &[String]| -> Vec<String> {
                kws.iter()
                    .map(|k| search_text(k))
                    .filter(|k| !k.is_empty())
                    .map(|k| format!(" {} ", k))
                    .collect()
            };
            let left = pad(&rule.left);
            let right = pad(&rule.right);
            if left.is_empty() || right.is_empty() {
                bail!("forbidden keyword rule needs non-empty left and right lists");
            }
            let reason = rule.reason.clone().unwrap_or_else(|| {
                format!("{} cannot match {}", rule.left.join("|"), rule.right.join("|"))
            });
            keywords.push(CompiledKeywordRule {
                left,
                right,
                reason,
            });
        }

        Ok(Self { pairs, keywords })
    }

    pub fn len(&self) -> usize {
        self.pairs.len() + self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the reason a pair is forbidden, or `None` if it may be scored.
    pub fn check(&self, a: &ProductFacts, b: &ProductFacts) -> Option<String> {
        if let (Some(ca), Some(cb)) = (&a.classification, &b.classification) {
            for (x, y) in &self.pairs {
                if (x.matches(ca) && y.matches(cb)) || (y.matches(ca) && x.matches(cb)) {
                    return Some(format!(
                        "forbidden type combination: {} vs {}",
                        ca.label(),
                        cb.label()
                    ));
                }
            }
        }

        if !self.keywords.is_empty() {
            let ta = format!(" {} ", search_text(&a.product.name));
            let tb = format!(" {} ", search_text(&b.product.name));
            if let Some(rule) = self.keywords.iter().find(|r| r.hits(&ta, &tb)) {
                return Some(rule.reason.clone());
            }
        }

        None
    }
}

/// Everything configuration contributes to a run, compiled once and
/// immutable for the run's duration.
#[derive(Debug, Clone, Default)]
pub struct MatchRules {
    pub taxonomy: Taxonomy,
    pub forbidden: ForbiddenRules,
    pub synonyms: SynonymTable,
    pub departments: Departments,
}

impl MatchRules {
    pub fn new(
        taxonomy: &[TaxonomyEntry],
        forbidden: &ForbiddenConfig,
        synonyms: &[SynonymGroup],
        departments: &[Department],
    ) -> Result<Self> {
        let taxonomy = Taxonomy::new(taxonomy)?;
        let forbidden = ForbiddenRules::new(forbidden, &taxonomy)?;
        Ok(Self {
            taxonomy,
            forbidden,
            synonyms: SynonymTable::new(synonyms),
            departments: Departments::new(departments)?,
        })
    }

    /// Classify with synonyms applied to both name and category hint.
    pub fn classify(&self, product: &Product) -> Option<Classification> {
        let name = self.synonyms.rewrite(&search_text(&product.name));
        let hint = product
            .category
            .as_deref()
            .map(|c| self.synonyms.rewrite(&search_text(c)));
        self.taxonomy.classify(&name, hint.as_deref())
    }

    /// Derive all per-product facts in one pass.
    pub fn facts(&self, product: &Product) -> ProductFacts {
        ProductFacts {
            product: product.clone(),
            classification: self.classify(product),
            size: size::extract_for_product(product),
            department: self
                .departments
                .department_of(product.category.as_deref(), &product.name)
                .map(str::to_string),
            normalized_name: normalize_name(&product.name, &self.synonyms),
        }
    }
}
