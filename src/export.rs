//! Export comparison results as JSON and CSV.
//!
//! The JSON report carries the run summary, statistics, and every
//! [`ComparisonRecord`] with raw numeric fields. The CSV is the dashboard
//! view: one row per record, prices formatted to two decimals and absent
//! values rendered as `N/A`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

use shelfmatch_core::aggregate::{aggregate, ComparisonRecord, ComparisonStatistics, Verdict};

use crate::resolver::{MatchRun, RunSummary};

/// Results for one (primary store, competitor store) pair.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonReport {
    pub primary_store: String,
    pub competitor_store: String,
    pub generated_at: DateTime<Utc>,
    pub summary: RunSummary,
    pub statistics: ComparisonStatistics,
    pub records: Vec<ComparisonRecord>,
}

impl ComparisonReport {
    /// Aggregate a finished run into a report.
    pub fn from_run(run: &MatchRun) -> Self {
        let (records, statistics) = aggregate(&run.matches(), &run.facts);
        Self {
            primary_store: run.summary.primary_store.clone(),
            competitor_store: run.summary.competitor_store.clone(),
            generated_at: Utc::now(),
            summary: run.summary.clone(),
            statistics,
            records,
        }
    }
}

/// Write the report as JSON to `output`, or stdout when `None`.
pub fn write_json(report: &ComparisonReport, output: Option<&Path>, pretty: bool) -> Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(report)?
    } else {
        serde_json::to_string(report)?
    };

    match output {
        Some(path) => {
            std::fs::write(path, json.as_bytes())
                .with_context(|| format!("Failed to write report: {}", path.display()))?;
        }
        None => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            handle.write_all(json.as_bytes())?;
            handle.write_all(b"\n")?;
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct CsvRow<'a> {
    #[serde(rename = "Product Name (Ours)")]
    product_name: &'a str,
    #[serde(rename = "Product Name (Theirs)")]
    competitor_name: &'a str,
    #[serde(rename = "Size")]
    size: &'a str,
    #[serde(rename = "Category")]
    category: &'a str,
    #[serde(rename = "Our Price")]
    our_price: String,
    #[serde(rename = "Their Price")]
    their_price: String,
    #[serde(rename = "Price/100g or ml (Ours)")]
    our_normalized: String,
    #[serde(rename = "Price/100g or ml (Theirs)")]
    their_normalized: String,
    #[serde(rename = "Savings")]
    savings: String,
    #[serde(rename = "Savings %")]
    savings_percent: String,
    #[serde(rename = "Verdict")]
    verdict: &'static str,
    #[serde(rename = "Match Type")]
    match_type: String,
    #[serde(rename = "Confidence")]
    confidence: String,
}

const CSV_HEADER: [&str; 13] = [
    "Product Name (Ours)",
    "Product Name (Theirs)",
    "Size",
    "Category",
    "Our Price",
    "Their Price",
    "Price/100g or ml (Ours)",
    "Price/100g or ml (Theirs)",
    "Savings",
    "Savings %",
    "Verdict",
    "Match Type",
    "Confidence",
];

/// Write comparison records as CSV.
pub fn write_csv<W: Write>(records: &[ComparisonRecord], writer: W) -> Result<()> {
    let mut csv_writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .has_headers(false)
        .from_writer(writer);

    csv_writer.write_record(CSV_HEADER)?;
    for r in records {
        csv_writer.serialize(CsvRow {
            product_name: &r.primary_name,
            competitor_name: &r.competitor_name,
            size: r.our_size.as_deref().unwrap_or("-"),
            category: &r.category,
            our_price: money(r.our_price),
            their_price: money(r.their_price),
            our_normalized: money(r.our_normalized_price),
            their_normalized: money(r.their_normalized_price),
            savings: money(r.savings),
            savings_percent: r
                .savings_percent
                .map(|p| format!("{:.1}%", p))
                .unwrap_or_else(|| "N/A".to_string()),
            verdict: match r.verdict {
                Some(Verdict::WeCheaper) => "we_cheaper",
                Some(Verdict::TheyCheaper) => "they_cheaper",
                Some(Verdict::Tie) => "tie",
                None => "N/A",
            },
            match_type: r.match_type.to_string(),
            confidence: format!("{:.3}", r.match_confidence),
        })?;
    }
    csv_writer.flush()?;
    Ok(())
}

/// Write comparison records as CSV to a file.
pub fn write_csv_file(records: &[ComparisonRecord], path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create CSV: {}", path.display()))?;
    write_csv(records, std::io::BufWriter::new(file))
}

fn money(value: Option<f64>) -> String {
    match value {
        Some(v) if v < 0.0 => format!("-${:.2}", -v),
        Some(v) => format!("${:.2}", v),
        None => "N/A".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfmatch_core::models::MatchType;

    fn record() -> ComparisonRecord {
        ComparisonRecord {
            primary_store: "p".into(),
            primary_id: "1".into(),
            competitor_store: "c".into(),
            competitor_id: "9".into(),
            primary_name: "Turmeric Powder 500g".into(),
            competitor_name: "Turmeric Powder, 500 g".into(),
            our_brand: None,
            their_brand: Some("Everest".into()),
            category: "Spices".into(),
            our_price: Some(3.99),
            their_price: Some(8.47),
            our_size: Some("500 g".into()),
            their_size: Some("500 g".into()),
            our_normalized_price: Some(0.798),
            their_normalized_price: None,
            normalized_unit: None,
            normalization_note: None,
            normalized_savings_percent: None,
            savings: Some(4.48),
            savings_percent: Some(52.892),
            verdict: Some(Verdict::WeCheaper),
            match_confidence: 0.9523,
            match_type: MatchType::Exact,
            our_on_sale: false,
            their_on_sale: false,
        }
    }

    #[test]
    fn test_csv_columns_and_formatting() {
        let mut out = Vec::new();
        write_csv(&[record()], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), CSV_HEADER.join(","));
        let row = lines.next().unwrap();
        assert!(row.starts_with("Turmeric Powder 500g,\"Turmeric Powder, 500 g\",500 g,Spices,"));
        assert!(row.contains("$3.99,$8.47,$0.80,N/A,$4.48,52.9%,we_cheaper,exact,0.952"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_csv_header_without_records() {
        let mut out = Vec::new();
        write_csv(&[], &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap().trim_end(), CSV_HEADER.join(","));
    }

    #[test]
    fn test_money() {
        assert_eq!(money(Some(-1.5)), "-$1.50");
        assert_eq!(money(None), "N/A");
    }

    #[test]
    fn test_json_record_fields() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(json["verdict"], "we_cheaper");
        assert_eq!(json["match_type"], "exact");
        assert!(json["their_normalized_price"].is_null());
    }
}
