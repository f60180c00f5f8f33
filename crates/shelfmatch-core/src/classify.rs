//! Taxonomy classification and department lookup.
//!
//! The taxonomy is an ordered table loaded from configuration. A product is
//! classified by walking the table in declaration order and taking the first
//! entry whose keywords (whole-token phrases) or patterns match the product
//! name. Only when no entry matches the name is the category hint tried the
//! same way. Declaration order is therefore the tie-break.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::models::Classification;
use crate::normalize::search_text;

/// One taxonomy row as written in configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaxonomyEntry {
    #[serde(rename = "type")]
    pub product_type: String,
    #[serde(default = "default_subtype")]
    pub subtype: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Regular expressions matched against the canonical search text.
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub description: String,
}

fn default_subtype() -> String {
    "generic".to_string()
}

#[derive(Debug, Clone)]
struct CompiledEntry {
    classification: Classification,
    /// Keywords as padded search text (`" garam masala "`).
    keywords: Vec<String>,
    patterns: Vec<Regex>,
}

impl CompiledEntry {
    fn matches(&self, padded: &str) -> bool {
        self.keywords.iter().any(|k| padded.contains(k.as_str()))
            || self.patterns.iter().any(|p| p.is_match(padded.trim()))
    }
}

/// A validated, compiled taxonomy.
#[derive(Debug, Clone, Default)]
pub struct Taxonomy {
    entries: Vec<CompiledEntry>,
}

impl Taxonomy {
    /// Compile and validate taxonomy entries.
    ///
    /// # Errors
    ///
    /// Fails on an empty type, an entry with neither keywords nor patterns,
    /// a duplicate `(type, subtype)`, or an invalid regex.
    pub fn new(entries: &[TaxonomyEntry]) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(entries.len());

        for (i, entry) in entries.iter().enumerate() {
            let product_type = entry.product_type.trim();
            let subtype = entry.subtype.trim();
            if product_type.is_empty() || subtype.is_empty() {
                bail!("taxonomy entry #{} has an empty type or subtype", i + 1);
            }
            if product_type.contains(':') || subtype.contains(':') {
                bail!(
                    "taxonomy entry '{}:{}' must not contain ':' in type or subtype",
                    product_type,
                    subtype
                );
            }
            if !seen.insert((product_type.to_string(), subtype.to_string())) {
                bail!("duplicate taxonomy entry '{}:{}'", product_type, subtype);
            }

            let keywords: Vec<String> = entry
                .keywords
                .iter()
                .map(|k| search_text(k))
                .filter(|k| !k.is_empty())
                .map(|k| format!(" {} ", k))
                .collect();

            let patterns = entry
                .patterns
                .iter()
                .map(|p| {
                    Regex::new(p).with_context(|| {
                        format!(
                            "invalid pattern '{}' in taxonomy entry '{}:{}'",
                            p, product_type, subtype
                        )
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            if keywords.is_empty() && patterns.is_empty() {
                bail!(
                    "taxonomy entry '{}:{}' has no keywords or patterns",
                    product_type,
                    subtype
                );
            }

            compiled.push(CompiledEntry {
                classification: Classification::new(product_type, subtype),
                keywords,
                patterns,
            });
        }

        Ok(Self { entries: compiled })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any entry has this type (and subtype, when given).
    pub fn declares(&self, product_type: &str, subtype: Option<&str>) -> bool {
        self.entries.iter().any(|e| {
            e.classification.product_type == product_type
                && subtype.map_or(true, |s| e.classification.subtype == s)
        })
    }

    /// Classify a product from its name, then its category hint.
    ///
    /// Both inputs are canonicalized here; callers may pass raw text or text
    /// already rewritten through the synonym table.
    pub fn classify(&self, name: &str, category_hint: Option<&str>) -> Option<Classification> {
        self.first_match(name).or_else(|| {
            category_hint
                .filter(|h| !h.trim().is_empty())
                .and_then(|h| self.first_match(h))
        })
    }

    fn first_match(&self, text: &str) -> Option<Classification> {
        let padded = format!(" {} ", search_text(text));
        self.entries
            .iter()
            .find(|e| e.matches(&padded))
            .map(|e| e.classification.clone())
    }
}

/// Free-function form of [`Taxonomy::classify`].
pub fn classify(name: &str, category_hint: Option<&str>, taxonomy: &Taxonomy) -> Option<Classification> {
    taxonomy.classify(name, category_hint)
}

/// One broad department as written in configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Department {
    pub name: String,
    pub keywords: Vec<String>,
}

/// Ordered department lookup used for candidate pre-filtering.
#[derive(Debug, Clone, Default)]
pub struct Departments {
    entries: Vec<(String, Vec<String>)>,
}

impl Departments {
    pub fn new(departments: &[Department]) -> Result<Self> {
        let mut entries = Vec::with_capacity(departments.len());
        for d in departments {
            let name = d.name.trim();
            if name.is_empty() {
                bail!("department with empty name");
            }
            let keywords: Vec<String> = d
                .keywords
                .iter()
                .map(|k| search_text(k))
                .filter(|k| !k.is_empty())
                .map(|k| format!(" {} ", k))
                .collect();
            if keywords.is_empty() {
                bail!("department '{}' has no keywords", name);
            }
            entries.push((name.to_string(), keywords));
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Department for a product: the store's category label decides first,
    /// the product name second.
    pub fn department_of(&self, category: Option<&str>, name: &str) -> Option<&str> {
        category
            .and_then(|c| self.lookup(c))
            .or_else(|| self.lookup(name))
    }

    fn lookup(&self, text: &str) -> Option<&str> {
        let padded = format!(" {} ", search_text(text));
        self.entries
            .iter()
            .find(|(_, kws)| kws.iter().any(|k| padded.contains(k.as_str())))
            .map(|(name, _)| name.as_str())
    }
}
