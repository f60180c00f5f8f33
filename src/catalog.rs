//! Catalog loading.
//!
//! A catalog is an ordered list of [`Product`] records for one store. The
//! bundled [`JsonCatalog`] reads either a bare JSON array of records or an
//! object of the form `{ "store_id": "...", "products": [...] }`.
//!
//! Loading is lenient: records with a blank id or name are kept so that the
//! resolver can skip them with a recorded reason, and prices that are not
//! usable numbers load as absent.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use shelfmatch_core::models::Product;

/// A supplier of product records for one store.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Store identifier stamped on every loaded product.
    fn store_id(&self) -> &str;

    /// Load the catalog in source order.
    async fn load(&self) -> Result<Vec<Product>>;
}

/// A catalog stored as a JSON file.
#[derive(Debug, Clone)]
pub struct JsonCatalog {
    path: PathBuf,
    store_id: String,
}

impl JsonCatalog {
    /// Open a catalog file. The store id comes from the file's `store_id`
    /// field when present, otherwise from `fallback_store_id`, otherwise from
    /// the file stem.
    pub fn open(path: &Path, fallback_store_id: Option<&str>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog: {}", path.display()))?;
        let embedded = serde_json::from_str::<Value>(&content)
            .with_context(|| format!("Failed to parse catalog JSON: {}", path.display()))?
            .get("store_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let store_id = embedded
            .or_else(|| fallback_store_id.map(str::to_string))
            .or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().to_string())
            })
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("Cannot determine store id for {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            store_id,
        })
    }
}

#[async_trait]
impl CatalogSource for JsonCatalog {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    async fn load(&self) -> Result<Vec<Product>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read catalog: {}", self.path.display()))?;
        let products = parse_catalog(&content, &self.store_id)
            .with_context(|| format!("Failed to parse catalog: {}", self.path.display()))?;
        debug!(
            store = %self.store_id,
            path = %self.path.display(),
            products = products.len(),
            "catalog loaded"
        );
        Ok(products)
    }
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default, alias = "id", alias = "sku")]
    product_id: Option<Value>,
    #[serde(default, alias = "title")]
    name: Option<String>,
    #[serde(default, alias = "size_text", alias = "weight")]
    size: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    price: Option<Value>,
    #[serde(default)]
    on_sale: bool,
}

/// Parse catalog JSON text into products for `store_id`.
pub fn parse_catalog(content: &str, store_id: &str) -> Result<Vec<Product>> {
    let root: Value = serde_json::from_str(content)?;
    let records = match root {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("products") {
            Some(Value::Array(items)) => items,
            _ => bail!("catalog object must contain a \"products\" array"),
        },
        _ => bail!("catalog must be a JSON array or an object with \"products\""),
    };

    let mut seen = HashSet::new();
    let mut products = Vec::with_capacity(records.len());
    for (i, value) in records.into_iter().enumerate() {
        let raw: RawRecord = serde_json::from_value(value)
            .with_context(|| format!("catalog record #{} is malformed", i + 1))?;
        let product = Product {
            store_id: store_id.to_string(),
            product_id: raw.product_id.as_ref().map(id_text).unwrap_or_default(),
            name: raw.name.unwrap_or_default().trim().to_string(),
            size_text: raw.size.filter(|s| !s.trim().is_empty()),
            category: raw.category.filter(|s| !s.trim().is_empty()),
            brand: raw.brand.filter(|s| !s.trim().is_empty()),
            price: raw.price.as_ref().and_then(price_value),
            on_sale: raw.on_sale,
        };
        if !product.product_id.is_empty() && !seen.insert(product.product_id.clone()) {
            warn!(
                store = store_id,
                product_id = %product.product_id,
                "duplicate product id in catalog"
            );
        }
        products.push(product);
    }
    Ok(products)
}

fn id_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

/// Accept `3.99`, `"3.99"`, or `"$3.99"`; anything else is absent.
fn price_value(v: &Value) -> Option<f64> {
    let p = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s
            .trim()
            .trim_start_matches(['$', '€', '£'])
            .replace(',', "")
            .parse::<f64>()
            .ok()?,
        _ => return None,
    };
    (p.is_finite() && p >= 0.0).then_some(p)
}
