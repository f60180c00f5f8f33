//! Size/unit extraction.
//!
//! Parses free-text size descriptors ("500g", "2 x 500 g", "1.5 L",
//! "12 pack", "16 oz") into a [`NormalizedSize`] in canonical units:
//! grams for mass, milliliters for volume, and a plain count otherwise.
//!
//! # Resolution order
//!
//! 1. Multi-pack expressions (`N x Q unit`, `Q unit x N`) multiply out.
//! 2. Otherwise the first mass/volume token wins. A separate pack count
//!    ("330ml 12 pack") multiplies it with slightly reduced confidence.
//! 3. Otherwise a pack/count token gives a count.
//! 4. No recognizable unit token yields `None`.
//!
//! Confidence is lowered when other measures with a different unit family
//! appear (`"500g 1L"`), when competing measures of the same family
//! disagree, or when unexplained standalone numbers remain.

use regex::{Captures, Regex};
use std::ops::Range;
use std::sync::LazyLock;

use crate::models::{NormalizedSize, Product, Unit};

/// A single unambiguous quantity+unit token, or a recognized multi-pack.
pub const FULL_CONFIDENCE: f64 = 1.0;
/// A measure multiplied by a separately stated pack count.
pub const PACK_COUNT_CONFIDENCE: f64 = 0.9;
/// A bare multiplier such as `"x6"` with no unit.
pub const BARE_MULTIPLIER_CONFIDENCE: f64 = 0.8;
/// Extra numbers or disagreeing same-family measures in the text.
pub const AMBIGUOUS_CONFIDENCE: f64 = 0.7;
/// Measures from different unit families in the same text.
pub const CONFLICT_CONFIDENCE: f64 = 0.5;

/// A quantity: `1,000` and `1,000.5` use thousands separators; any other
/// comma is a decimal comma (`1,5`).
const NUM: &str = r"(\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:[.,]\d+)?)";
const UNIT: &str = r"(fl\.?\s?oz|kilogrammes?|kilograms?|kilos?|kgs?|milligrams?|mg|grammes?|grams?|gms?|gr|g|millilit(?:er|re)s?|mls?|centilit(?:er|re)s?|cl|lit(?:er|re)s?|ltrs?|lt|l|pounds?|lbs?|ounces?|oz)";

static MULTI_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\b(\d+)\s*[x×]\s*{NUM}\s*{UNIT}\b")).expect("valid multipack regex")
});

static MULTI_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\b{NUM}\s*{UNIT}\s*[x×]\s*(\d+)\b")).expect("valid multipack regex")
});

static MEASURE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\b{NUM}\s*{UNIT}\b")).expect("valid measure regex"));

static COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d+)\s*-?\s*(?:packs?|pk|pcs?|pieces?|count|ct|each|ea)\b")
        .expect("valid count regex")
});

static PACK_OF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bpack\s+of\s+(\d+)\b").expect("valid pack-of regex"));

static BARE_MULTIPLIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^a-z0-9])[x×]\s*(\d+)\b|\b(\d+)\s*[x×](?:[^a-z0-9]|$)")
        .expect("valid multiplier regex")
});

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\b{NUM}\b")).expect("valid number regex"));

static THOUSANDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{1,3}(?:,\d{3})+(?:\.\d+)?$").expect("valid thousands regex")
});

/// A decimal written without its leading zero (`.5 kg`).
static LEADING_DOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[^\w.,])\.(\d)").expect("valid leading-dot regex"));

/// A parsed mass/volume token.
#[derive(Debug, Clone)]
struct Measure {
    quantity: f64,
    unit: Unit,
    span: Range<usize>,
}

/// Extract a normalized size from a raw size descriptor.
///
/// Returns `None` for blank text or text without a recognizable unit token.
pub fn extract(raw_size_text: &str) -> Option<NormalizedSize> {
    let text = raw_size_text.trim();
    if text.is_empty() {
        return None;
    }
    let lower = canonical_text(text);

    let mut consumed: Vec<Range<usize>> = Vec::new();
    let (quantity, unit, mut confidence) = if let Some(m) = multipack(&lower) {
        consumed.push(m.span.clone());
        (m.quantity, m.unit, FULL_CONFIDENCE)
    } else {
        let measures = measures(&lower);
        if let Some(first) = measures.first() {
            consumed.push(first.span.clone());
            let mut quantity = first.quantity;
            let mut confidence = FULL_CONFIDENCE;
            if let Some((pack, span, pack_conf)) = pack_count(&lower, &consumed) {
                consumed.push(span);
                quantity *= pack;
                confidence = confidence.min(pack_conf.min(PACK_COUNT_CONFIDENCE));
            }
            (quantity, first.unit, confidence)
        } else if let Some((count, span, conf)) = pack_count(&lower, &consumed) {
            consumed.push(span);
            (count, Unit::Count, conf)
        } else {
            return None;
        }
    };

    // Competing measures that the chosen expression did not account for.
    for other in measures(&lower) {
        if overlaps(&consumed, &other.span) {
            continue;
        }
        if other.unit.family() != unit.family() {
            confidence = confidence.min(CONFLICT_CONFIDENCE);
        } else if other.quantity != quantity {
            confidence = confidence.min(AMBIGUOUS_CONFIDENCE);
        }
        consumed.push(other.span);
    }

    if NUMBER
        .find_iter(&lower)
        .any(|m| !overlaps(&consumed, &m.range()))
    {
        confidence = confidence.min(AMBIGUOUS_CONFIDENCE);
    }

    if quantity <= 0.0 || !quantity.is_finite() {
        return None;
    }

    Some(NormalizedSize {
        quantity,
        unit,
        confidence,
        source_text: text.to_string(),
    })
}

/// Extract a product's size from its size text, falling back to its name.
pub fn extract_for_product(product: &Product) -> Option<NormalizedSize> {
    product
        .size_text
        .as_deref()
        .and_then(extract)
        .or_else(|| extract(&product.name))
}

/// Lowercase `text` and blank out every size expression in it.
///
/// Used by name normalization so that `"Turmeric Powder 500g"` and
/// `"Turmeric Powder 500 g"` compare as the same name.
pub fn strip_sizes(text: &str) -> String {
    let mut out = canonical_text(text);
    for re in [&*MULTI_PREFIX, &*MULTI_SUFFIX, &*MEASURE, &*COUNT, &*PACK_OF] {
        out = re.replace_all(&out, " ").into_owned();
    }
    out
}

/// Lowercase and restore leading zeros so `.5` parses as `0.5`.
fn canonical_text(text: &str) -> String {
    LEADING_DOT
        .replace_all(&text.to_lowercase(), "${1}0.${2}")
        .into_owned()
}

fn multipack(lower: &str) -> Option<Measure> {
    if let Some(caps) = MULTI_PREFIX.captures(lower) {
        let count = parse_number(&caps[1])?;
        let (quantity, unit) = measure_quantity(&caps[2], &caps[3])?;
        return Some(Measure {
            quantity: count * quantity,
            unit,
            span: span_of(&caps),
        });
    }
    if let Some(caps) = MULTI_SUFFIX.captures(lower) {
        let (quantity, unit) = measure_quantity(&caps[1], &caps[2])?;
        let count = parse_number(&caps[3])?;
        return Some(Measure {
            quantity: count * quantity,
            unit,
            span: span_of(&caps),
        });
    }
    None
}

fn measures(lower: &str) -> Vec<Measure> {
    MEASURE
        .captures_iter(lower)
        .filter_map(|caps| {
            let (quantity, unit) = measure_quantity(&caps[1], &caps[2])?;
            Some(Measure {
                quantity,
                unit,
                span: span_of(&caps),
            })
        })
        .collect()
}

/// Find a pack/count token not already consumed.
fn pack_count(lower: &str, consumed: &[Range<usize>]) -> Option<(f64, Range<usize>, f64)> {
    for (re, confidence) in [(&*COUNT, FULL_CONFIDENCE), (&*PACK_OF, FULL_CONFIDENCE)] {
        for caps in re.captures_iter(lower) {
            let span = span_of(&caps);
            if overlaps(consumed, &span) {
                continue;
            }
            if let Some(n) = parse_number(&caps[1]) {
                return Some((n, span, confidence));
            }
        }
    }
    for caps in BARE_MULTIPLIER.captures_iter(lower) {
        let span = span_of(&caps);
        if overlaps(consumed, &span) {
            continue;
        }
        let digits = caps.get(1).or_else(|| caps.get(2))?;
        if let Some(n) = parse_number(digits.as_str()) {
            return Some((n, digits.range(), BARE_MULTIPLIER_CONFIDENCE));
        }
    }
    None
}

/// Convert a number and unit token into a canonical quantity.
fn measure_quantity(number: &str, unit: &str) -> Option<(f64, Unit)> {
    let value = parse_number(number)?;
    let (unit, factor) = parse_unit(unit)?;
    Some((value * factor * unit.canonical_factor(), unit.canonical()))
}

/// Map a unit token to a unit plus any extra factor for units outside
/// the [`Unit`] enum (mg, lb, oz, fl oz, cl).
fn parse_unit(token: &str) -> Option<(Unit, f64)> {
    let t: String = token.chars().filter(|c| c.is_alphabetic()).collect();
    let parsed = match t.as_str() {
        "floz" => (Unit::Milliliter, 29.573_529_562_5),
        "g" | "gm" | "gms" | "gr" | "gram" | "grams" | "gramme" | "grammes" => (Unit::Gram, 1.0),
        "kg" | "kgs" | "kilo" | "kilos" | "kilogram" | "kilograms" | "kilogramme"
        | "kilogrammes" => (Unit::Kilogram, 1.0),
        "mg" | "milligram" | "milligrams" => (Unit::Gram, 0.001),
        "lb" | "lbs" | "pound" | "pounds" => (Unit::Gram, 453.592_37),
        "oz" | "ounce" | "ounces" => (Unit::Gram, 28.349_523_125),
        "ml" | "mls" | "milliliter" | "milliliters" | "millilitre" | "millilitres" => {
            (Unit::Milliliter, 1.0)
        }
        "cl" | "centiliter" | "centiliters" | "centilitre" | "centilitres" => {
            (Unit::Milliliter, 10.0)
        }
        "l" | "lt" | "ltr" | "ltrs" | "liter" | "liters" | "litre" | "litres" => (Unit::Liter, 1.0),
        _ => return None,
    };
    Some(parsed)
}

fn parse_number(s: &str) -> Option<f64> {
    let normalized = if THOUSANDS.is_match(s) {
        s.replace(',', "")
    } else {
        s.replace(',', ".")
    };
    normalized.parse::<f64>().ok()
}

fn span_of(caps: &Captures<'_>) -> Range<usize> {
    caps.get(0).map(|m| m.range()).unwrap_or(0..0)
}

fn overlaps(consumed: &[Range<usize>], span: &Range<usize>) -> bool {
    consumed
        .iter()
        .any(|c| c.start < span.end && span.start < c.end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grams(text: &str) -> f64 {
        let s = extract(text).unwrap();
        assert_eq!(s.unit, Unit::Gram, "{text}");
        s.quantity
    }

    #[test]
    fn test_single_mass_token() {
        let s = extract("500g").unwrap();
        assert_eq!(s.quantity, 500.0);
        assert_eq!(s.unit, Unit::Gram);
        assert_eq!(s.confidence, FULL_CONFIDENCE);
        assert_eq!(s.source_text, "500g");
    }

    #[test]
    fn test_unit_variants() {
        assert_eq!(grams("500 g"), 500.0);
        assert_eq!(grams("500 gms"), 500.0);
        assert_eq!(grams("500 Grams"), 500.0);
        assert_eq!(grams("1kg"), 1000.0);
        assert_eq!(grams("1.5 KG"), 1500.0);
        assert_eq!(grams("2 kilos"), 2000.0);
        assert_eq!(grams("1,5 kg"), 1500.0);
        assert_eq!(grams("250mg"), 0.25);
    }

    #[test]
    fn test_thousands_separators() {
        let s = extract("1,000 ml").unwrap();
        assert_eq!(s.unit, Unit::Milliliter);
        assert_eq!(s.quantity, 1000.0);
        assert_eq!(s.confidence, FULL_CONFIDENCE);

        assert_eq!(grams("2,500 g"), 2500.0);
        assert_eq!(grams("1,000.5g"), 1000.5);
        assert_eq!(grams("2 x 1,000g"), 2000.0);
        // not a three-digit group, so still a decimal comma
        assert_eq!(grams("1,50 kg"), 1500.0);
    }

    #[test]
    fn test_leading_dot_decimal() {
        let s = extract(".5 kg").unwrap();
        assert_eq!(s.quantity, 500.0);
        assert_eq!(s.confidence, FULL_CONFIDENCE);
        assert_eq!(grams("Sea Salt .75kg"), 750.0);
        assert!((grams("(.25 lb)") - 113.398_092_5).abs() < 1e-9);
        assert!(!strip_sizes("Sea Salt .5kg").contains('5'));
    }

    #[test]
    fn test_volume_canonicalizes_to_milliliters() {
        let s = extract("1.5 L").unwrap();
        assert_eq!(s.unit, Unit::Milliliter);
        assert_eq!(s.quantity, 1500.0);

        let s = extract("750 ml").unwrap();
        assert_eq!(s.quantity, 750.0);

        let s = extract("2 litres").unwrap();
        assert_eq!(s.quantity, 2000.0);

        let s = extract("33cl").unwrap();
        assert_eq!(s.quantity, 330.0);
    }

    #[test]
    fn test_imperial_units() {
        assert!((grams("1 lb") - 453.59237).abs() < 1e-9);
        assert!((grams("16 oz") - 453.59237).abs() < 1e-9);
        let s = extract("12 fl oz").unwrap();
        assert_eq!(s.unit, Unit::Milliliter);
        assert!((s.quantity - 354.882_354_75).abs() < 1e-6);
    }

    #[test]
    fn test_multipack_multiplies() {
        let s = extract("2 x 500g").unwrap();
        assert_eq!(s.quantity, 1000.0);
        assert_eq!(s.unit, Unit::Gram);
        assert!(s.confidence >= FULL_CONFIDENCE);

        let s = extract("6x330ml").unwrap();
        assert_eq!(s.quantity, 1980.0);
        assert_eq!(s.unit, Unit::Milliliter);

        let s = extract("100g x 4").unwrap();
        assert_eq!(s.quantity, 400.0);

        let s = extract("2 × 1kg").unwrap();
        assert_eq!(s.quantity, 2000.0);
    }

    #[test]
    fn test_measure_with_pack_count() {
        let s = extract("330ml 12 pack").unwrap();
        assert_eq!(s.quantity, 3960.0);
        assert_eq!(s.unit, Unit::Milliliter);
        assert_eq!(s.confidence, PACK_COUNT_CONFIDENCE);
    }

    #[test]
    fn test_counts() {
        let s = extract("12 pack").unwrap();
        assert_eq!(s.unit, Unit::Count);
        assert_eq!(s.quantity, 12.0);
        assert_eq!(s.confidence, FULL_CONFIDENCE);

        assert_eq!(extract("pack of 6").unwrap().quantity, 6.0);
        assert_eq!(extract("10 pcs").unwrap().quantity, 10.0);
        assert_eq!(extract("24ct").unwrap().quantity, 24.0);

        let s = extract("x6").unwrap();
        assert_eq!(s.unit, Unit::Count);
        assert_eq!(s.quantity, 6.0);
        assert_eq!(s.confidence, BARE_MULTIPLIER_CONFIDENCE);
    }

    #[test]
    fn test_conflicting_units_keep_first_with_reduced_confidence() {
        let s = extract("500g 1L").unwrap();
        assert_eq!(s.quantity, 500.0);
        assert_eq!(s.unit, Unit::Gram);
        assert_eq!(s.confidence, CONFLICT_CONFIDENCE);
    }

    #[test]
    fn test_stray_numbers_reduce_confidence() {
        let s = extract("Basmati Rice 5kg Harvest 2024").unwrap();
        assert_eq!(s.quantity, 5000.0);
        assert_eq!(s.confidence, AMBIGUOUS_CONFIDENCE);
    }

    #[test]
    fn test_embedded_digits_are_not_stray() {
        let s = extract("7up 2L").unwrap();
        assert_eq!(s.quantity, 2000.0);
        assert_eq!(s.confidence, FULL_CONFIDENCE);
    }

    #[test]
    fn test_unextracted() {
        assert!(extract("").is_none());
        assert!(extract("   ").is_none());
        assert!(extract("family size").is_none());
        assert!(extract("500").is_none());
        assert!(extract("gold label").is_none());
        assert!(extract("0g").is_none());
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(extract("2 x 500g 1L"), extract("2 x 500g 1L"));
    }

    #[test]
    fn test_product_falls_back_to_name() {
        let p = Product {
            store_id: "s".into(),
            product_id: "1".into(),
            name: "Turmeric Powder 500g".into(),
            size_text: Some("n/a".into()),
            category: None,
            brand: None,
            price: None,
            on_sale: false,
        };
        let s = extract_for_product(&p).unwrap();
        assert_eq!(s.quantity, 500.0);
        assert_eq!(s.source_text, "Turmeric Powder 500g");
    }

    #[test]
    fn test_strip_sizes() {
        let a = strip_sizes("Turmeric Powder 500g");
        let b = strip_sizes("Turmeric Powder 500 g");
        assert_eq!(a.split_whitespace().collect::<Vec<_>>(), ["turmeric", "powder"]);
        assert_eq!(
            a.split_whitespace().collect::<Vec<_>>(),
            b.split_whitespace().collect::<Vec<_>>()
        );
        assert_eq!(strip_sizes("Cola 6 x 330ml").trim(), "cola");
    }
}
