//! Turns raw recognition output into a structured extraction.
//!
//! Two barcode sources are merged: tokens found in the recognized text and
//! strings the engine decoded directly from bar patterns. Both go through the
//! same length and check digit validation, so every barcode in an
//! [`Extraction`] is a well-formed EAN-8, UPC-A or EAN-13.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::barcode;
use crate::recognition::RawRecognition;
use crate::rules::{Field, FieldRules};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarcodeSource {
    Text,
    Decoder,
    Both,
}

impl BarcodeSource {
    fn merge(self, other: BarcodeSource) -> BarcodeSource {
        if self == other { self } else { BarcodeSource::Both }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSource {
    pub rule: String,
    pub block: usize,
}

/// Which source contributed each barcode and attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default)]
    pub barcodes: BTreeMap<String, BarcodeSource>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSource>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub barcodes: BTreeSet<String>,
    pub product_info: BTreeMap<String, String>,
    pub provenance: Provenance,
    pub rejected_decodes: Vec<String>,
}

pub fn fuse(raw: &RawRecognition, rules: &FieldRules) -> Extraction {
    let (barcode_sources, rejected_decodes) =
        merge_barcodes(&raw.text_blocks, &raw.barcode_decodes);
    let (product_info, field_sources) = extract_attributes(&raw.text_blocks, rules);

    if !rejected_decodes.is_empty() {
        tracing::debug!(
            rejected = ?rejected_decodes,
            "dropped decoder output failing length or check digit validation"
        );
    }

    Extraction {
        barcodes: barcode_sources.keys().cloned().collect(),
        product_info,
        provenance: Provenance {
            barcodes: barcode_sources,
            fields: field_sources,
        },
        rejected_decodes,
    }
}

fn merge_barcodes(
    text_blocks: &[String],
    decodes: &[String],
) -> (BTreeMap<String, BarcodeSource>, Vec<String>) {
    let mut merged: BTreeMap<String, BarcodeSource> = BTreeMap::new();

    for block in text_blocks {
        for code in barcode::candidates_in_text(block) {
            merged
                .entry(code)
                .and_modify(|s| *s = s.merge(BarcodeSource::Text))
                .or_insert(BarcodeSource::Text);
        }
    }

    let mut rejected = Vec::new();
    for raw in decodes {
        match barcode::normalize_decoded(raw) {
            Some(code) => {
                merged
                    .entry(code)
                    .and_modify(|s| *s = s.merge(BarcodeSource::Decoder))
                    .or_insert(BarcodeSource::Decoder);
            }
            None => rejected.push(raw.clone()),
        }
    }

    (merged, rejected)
}

/// Field values the rules find in `text_blocks`, without provenance.
pub fn attributes(text_blocks: &[String], rules: &FieldRules) -> BTreeMap<String, String> {
    extract_attributes(text_blocks, rules).0
}

fn extract_attributes(
    text_blocks: &[String],
    rules: &FieldRules,
) -> (BTreeMap<String, String>, BTreeMap<String, FieldSource>) {
    let mut values = BTreeMap::new();
    let mut sources = BTreeMap::new();

    for field in Field::ALL {
        let hit = rules.for_field(field).find_map(|rule| {
            text_blocks
                .iter()
                .enumerate()
                .find_map(|(idx, block)| rule.capture(block).map(|v| (v, rule.name, idx)))
        });
        if let Some((value, rule, block)) = hit {
            values.insert(field.as_str().to_string(), value);
            sources.insert(
                field.as_str().to_string(),
                FieldSource {
                    rule: rule.to_string(),
                    block,
                },
            );
        }
    }

    (values, sources)
}
