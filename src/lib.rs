//! # shelfcheck
//!
//! Barcode and product attribute extraction from shelf photos, with a
//! content-addressed processing cache and claim verification against an
//! inventory.
//!
//! ## Architecture
//!
//! - **hashing**: SHA-256 content fingerprints and the cache hit/miss gate
//! - **recognition**: Boundary to the external text/barcode recognizer, plus a scripted fake
//! - **barcode**: Standalone token extraction and GS1 check digits
//! - **rules**: Ordered field rules for brand, model, color, type and part number
//! - **fusion**: Merges recognizer output into one extraction with provenance
//! - **cache**: Persistent per-image records in LMDB (heed)
//! - **inventory**: Barcode-keyed inventory items in the same LMDB environment
//! - **processor**: Single-image pipeline with per-path locking
//! - **verify**: Exact and fuzzy claim matching with attribute cross-checks
//! - **batch**: Directory runs with parallel hashing and cancellation

pub mod barcode;
pub mod batch;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod fusion;
pub mod hashing;
pub mod inventory;
pub mod processor;
pub mod recognition;
pub mod rules;
pub mod verify;

pub use error::{Error, Result};
