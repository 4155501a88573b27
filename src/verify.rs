//! Decides whether a claimed barcode belongs to the product in an image.
//!
//! Scoring:
//! - the claim is one of the extracted barcodes: matched, confidence 1.0;
//! - otherwise the closest extracted barcode by normalized Levenshtein
//!   similarity is taken, matched when it reaches the fuzzy cutoff;
//! - when the claim names a stocked item, extracted brand/model/color/type
//!   are checked against the item's name and description. An attribute the
//!   item states differently is a contradiction, and any contradiction costs
//!   a fixed penalty on a matched confidence. Attributes the item never
//!   mentions are not held against it.
//!
//! The inventory `verified` flag is only ever raised here, never cleared.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::barcode::parse_claim;
use crate::cache::ImageRecord;
use crate::error::{Error, Result};
use crate::hashing::cache_key;
use crate::inventory::{ExtractionSnapshot, ITEM_FIELDS, Inventory, InventoryItem, words};
use crate::processor::ImageProcessor;
use crate::rules::FieldRules;

pub const DEFAULT_VERIFICATION_THRESHOLD: f64 = 0.6;
pub const DEFAULT_FUZZY_CUTOFF: f64 = 0.6;
pub const DEFAULT_MISMATCH_PENALTY: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VerificationPolicy {
    pub verification_threshold: f64,
    pub fuzzy_cutoff: f64,
    pub mismatch_penalty: f64,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self {
            verification_threshold: DEFAULT_VERIFICATION_THRESHOLD,
            fuzzy_cutoff: DEFAULT_FUZZY_CUTOFF,
            mismatch_penalty: DEFAULT_MISMATCH_PENALTY,
        }
    }
}

impl VerificationPolicy {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("verification threshold", self.verification_threshold),
            ("fuzzy cutoff", self.fuzzy_cutoff),
            ("mismatch penalty", self.mismatch_penalty),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::validation(format!(
                    "{name} must be within 0.0..=1.0, got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    pub barcode: String,
    pub image_path: String,
    pub matched: bool,
    pub confidence: f64,
    pub matched_fields: BTreeMap<String, String>,
    pub matched_candidate: Option<String>,
    pub candidates: Vec<String>,
    pub verified: bool,
}

/// Scores `claim` against an already processed record. Pure: touches neither
/// the cache nor the inventory.
pub fn assess(
    claim: &str,
    image_path: &str,
    record: &ImageRecord,
    item: Option<&InventoryItem>,
    rules: &FieldRules,
    policy: &VerificationPolicy,
) -> VerificationResult {
    let candidates: Vec<String> = record.barcodes.iter().cloned().collect();

    let (matched, mut confidence, matched_candidate) = if record.barcodes.contains(claim) {
        (true, 1.0, Some(claim.to_string()))
    } else {
        match closest(claim, &candidates) {
            Some((code, similarity)) if similarity >= policy.fuzzy_cutoff => {
                (true, similarity, Some(code.to_string()))
            }
            _ => (false, 0.0, None),
        }
    };

    let mut matched_fields = BTreeMap::new();
    if let Some(item) = item {
        let known = item.keywords();
        let stated = item.attributes(rules);
        let mut contradictions = 0u32;
        for field in ITEM_FIELDS.map(|f| f.as_str()) {
            let Some(value) = record.product_info.get(field) else {
                continue;
            };
            if agrees(value, &known) {
                matched_fields.insert(field.to_string(), value.clone());
            } else if stated
                .get(field)
                .is_some_and(|recorded| !recorded.eq_ignore_ascii_case(value))
            {
                contradictions += 1;
            }
        }
        if matched && contradictions > 0 {
            confidence = (confidence - policy.mismatch_penalty).max(0.0);
        }
    }
    if !matched {
        confidence = 0.0;
    }

    VerificationResult {
        barcode: claim.to_string(),
        image_path: image_path.to_string(),
        matched,
        confidence,
        matched_fields,
        matched_candidate,
        candidates,
        verified: false,
    }
}

/// Highest similarity candidate; the first one wins ties.
fn closest<'c>(claim: &str, candidates: &'c [String]) -> Option<(&'c str, f64)> {
    let mut best: Option<(&str, f64)> = None;
    for code in candidates {
        let similarity = strsim::normalized_levenshtein(claim, code);
        if best.is_none_or(|(_, s)| similarity > s) {
            best = Some((code.as_str(), similarity));
        }
    }
    best
}

fn agrees(value: &str, known: &BTreeSet<String>) -> bool {
    let mut value_words = words(value).peekable();
    value_words.peek().is_some() && value_words.all(|w| known.contains(&w))
}

pub struct Verifier<'p, 'a> {
    processor: &'p ImageProcessor<'a>,
    inventory: &'p Inventory,
    policy: VerificationPolicy,
}

impl<'p, 'a> Verifier<'p, 'a> {
    pub fn new(
        processor: &'p ImageProcessor<'a>,
        inventory: &'p Inventory,
        policy: VerificationPolicy,
    ) -> Self {
        Self {
            processor,
            inventory,
            policy,
        }
    }

    pub fn policy(&self) -> &VerificationPolicy {
        &self.policy
    }

    /// Processes the image (reusing the cache when possible) and scores the
    /// claim against it.
    pub fn verify(&self, barcode: &str, image: &Path) -> Result<VerificationResult> {
        let claim = parse_claim(barcode)?;
        let record = self.processor.process_image(image, false)?;
        self.verify_resolved(&claim, image, &record)
    }

    /// Scores `barcode` against a record the caller already holds. The claim
    /// is validated and a failed record is refused, as in [`Verifier::verify`].
    pub fn verify_resolved(
        &self,
        barcode: &str,
        image: &Path,
        record: &ImageRecord,
    ) -> Result<VerificationResult> {
        let claim = parse_claim(barcode)?;
        if !record.success {
            return Err(Error::ImageFailed {
                path: image.to_path_buf(),
                reason: record
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            });
        }

        let image_path = cache_key(image)?;
        let item = self.inventory.get(&claim)?;
        let mut result = assess(
            &claim,
            &image_path,
            record,
            item.as_ref(),
            self.processor.rules(),
            &self.policy,
        );

        if item.is_some()
            && result.matched
            && result.confidence >= self.policy.verification_threshold
        {
            let snapshot = ExtractionSnapshot::from_record(&image_path, record);
            result.verified = self.inventory.mark_verified(&claim, snapshot)?;
        }

        tracing::info!(
            barcode = %claim,
            path = %image_path,
            matched = result.matched,
            confidence = result.confidence,
            verified = result.verified,
            "verification finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(codes: &[&str], info: &[(&str, &str)]) -> ImageRecord {
        let mut r = ImageRecord::failed("epson_black.jpg", 10, "");
        r.success = true;
        r.error_message = None;
        r.barcodes = codes.iter().map(|c| c.to_string()).collect();
        r.product_info = info
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        r
    }

    fn epson_item() -> InventoryItem {
        InventoryItem::new("Epson 03C Black Ink", 3, "Black ink cartridge")
    }

    fn rules() -> FieldRules {
        FieldRules::builtin().unwrap()
    }

    #[test]
    fn exact_match_is_full_confidence() {
        let rec = record(&["8885007027531", "8885007027555"], &[]);
        let result = assess("8885007027531", "/x.jpg", &rec, None, &rules(), &VerificationPolicy::default());
        assert!(result.matched);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.matched_candidate.as_deref(), Some("8885007027531"));
        assert_eq!(result.candidates.len(), 2);
        assert!(!result.verified);
    }

    #[test]
    fn unrelated_claim_scores_zero() {
        let rec = record(&["8885007027531"], &[]);
        let result = assess("9999999999999", "/x.jpg", &rec, None, &rules(), &VerificationPolicy::default());
        assert!(!result.matched);
        assert_eq!(result.confidence, 0.0);
        assert!(result.matched_candidate.is_none());
    }

    #[test]
    fn one_digit_misread_is_a_fuzzy_match() {
        let rec = record(&["8885007027531"], &[]);
        let result = assess("8885007027537", "/x.jpg", &rec, None, &rules(), &VerificationPolicy::default());
        assert!(result.matched);
        assert!((result.confidence - 12.0 / 13.0).abs() < 1e-9);
        assert_eq!(result.matched_candidate.as_deref(), Some("8885007027531"));
    }

    #[test]
    fn no_candidates_never_matches() {
        let rec = record(&[], &[("brand", "EPSON")]);
        let result = assess(
            "8885007027531",
            "/x.jpg",
            &rec,
            Some(&epson_item()),
            &rules(),
            &VerificationPolicy::default(),
        );
        assert!(!result.matched);
        assert_eq!(result.confidence, 0.0);
        assert!(result.candidates.is_empty());
    }

    #[test]
    fn agreeing_attributes_are_reported() {
        let rec = record(
            &["8885007027531"],
            &[("brand", "EPSON"), ("model", "03C"), ("color", "Black"), ("type", "Ink")],
        );
        let result = assess(
            "8885007027531",
            "/x.jpg",
            &rec,
            Some(&epson_item()),
            &rules(),
            &VerificationPolicy::default(),
        );
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.matched_fields.len(), 4);
    }

    #[test]
    fn attribute_mismatch_lowers_confidence_without_flipping_match() {
        let rec = record(&["8885007027531"], &[("brand", "EPSON"), ("color", "Cyan")]);
        let result = assess(
            "8885007027531",
            "/x.jpg",
            &rec,
            Some(&epson_item()),
            &rules(),
            &VerificationPolicy::default(),
        );
        assert!(result.matched);
        assert!((result.confidence - 0.8).abs() < 1e-9);
        assert_eq!(
            result.matched_fields.keys().collect::<Vec<_>>(),
            vec!["brand"]
        );

        let harsh = VerificationPolicy {
            mismatch_penalty: 1.0,
            ..VerificationPolicy::default()
        };
        let result = assess("8885007027531", "/x.jpg", &rec, Some(&epson_item()), &rules(), &harsh);
        assert!(result.matched);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn attributes_the_item_never_states_cost_nothing() {
        let rec = record(
            &["8885007027531"],
            &[("brand", "EPSON"), ("model", "03C"), ("color", "Black"), ("type", "Ink")],
        );
        let placeholder = InventoryItem::new("Item-7531", 1, "New item - update description");
        let result = assess(
            "8885007027531",
            "/x.jpg",
            &rec,
            Some(&placeholder),
            &rules(),
            &VerificationPolicy::default(),
        );
        assert!(result.matched);
        assert_eq!(result.confidence, 1.0);
        assert!(result.matched_fields.is_empty());

        // Brand and color agree; the model is absent from the item's text.
        let partial = InventoryItem::new("EPSON Black Ink", 1, "Auto-detected from image: a.jpg");
        let result = assess(
            "8885007027531",
            "/x.jpg",
            &rec,
            Some(&partial),
            &rules(),
            &VerificationPolicy::default(),
        );
        assert_eq!(result.confidence, 1.0);
        assert_eq!(
            result.matched_fields.keys().collect::<Vec<_>>(),
            vec!["brand", "color", "type"]
        );
    }

    #[test]
    fn policy_rejects_out_of_range_values() {
        assert!(VerificationPolicy::default().validate().is_ok());
        let bad = VerificationPolicy {
            verification_threshold: 1.5,
            ..VerificationPolicy::default()
        };
        assert!(bad.validate().unwrap_err().is_validation());
    }
}
