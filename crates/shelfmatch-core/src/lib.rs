//! # shelfmatch core
//!
//! Pure matching logic for shelfmatch: the product data model, size/unit
//! extraction, name normalization, taxonomy classification, forbidden-pair
//! rules, fuzzy and semantic similarity, and the price comparison aggregator.
//!
//! This crate contains no tokio, filesystem, or network dependencies. The
//! embedding provider is only described here as a trait; concrete providers,
//! the worker pool, and configuration loading live in the `shelfmatch` crate.

pub mod aggregate;
pub mod classify;
pub mod embedding;
pub mod models;
pub mod normalize;
pub mod rules;
pub mod similarity;
pub mod size;
