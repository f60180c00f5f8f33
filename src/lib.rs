//! # shelfmatch
//!
//! Entity resolution and price comparison between two grocery catalogs.
//!
//! shelfmatch decides which competitor products are the same real-world item
//! as which primary products, scores each correspondence, and produces
//! per-unit price comparisons with summary statistics.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────┐   ┌────────────┐
//! │ Catalogs │──▶│ Facts: size, │──▶│ Resolver  │──▶│ Aggregator │──▶ JSON / CSV
//! │  (JSON)  │   │ class, dept  │   │ pool+cache│   │ prices     │
//! └──────────┘   └──────────────┘   └─────┬─────┘   └────────────┘
//!                                         ▼
//!                                  ┌────────────┐
//!                                  │ Embedding  │
//!                                  │ provider   │
//!                                  └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! shelfmatch check
//! shelfmatch size "2 x 500g"
//! shelfmatch classify "Haldi Powder 200g"
//! shelfmatch run --primary ours.json --competitor theirs.json --csv out.csv
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`catalog`] | Catalog sources |
//! | [`embedding`] | Concrete embedding providers |
//! | [`cache`] | Run-scoped facts and embedding caches |
//! | [`scorer`] | Similarity scoring with semantic fallback |
//! | [`resolver`] | Match resolution worker pool |
//! | [`export`] | JSON and CSV reports |
//! | [`match_cmd`] | CLI command implementations |
//!
//! Pure matching logic lives in the `shelfmatch-core` crate.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod embedding;
pub mod export;
pub mod match_cmd;
pub mod resolver;
pub mod scorer;
