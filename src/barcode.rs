//! Barcode-shaped token extraction and GS1 check digit validation.
//!
//! Only whole tokens are considered. A digit run that is glued to letters,
//! hyphens, plus signs or decimal points belongs to some other kind of number
//! (phone numbers, prices, part codes) and is never split out of it.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Symbology {
    Ean8,
    UpcA,
    Ean13,
}

impl Symbology {
    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            8 => Some(Self::Ean8),
            12 => Some(Self::UpcA),
            13 => Some(Self::Ean13),
            _ => None,
        }
    }
}

const SEPARATORS: &[char] = &[
    ',', ';', ':', '(', ')', '[', ']', '{', '}', '|', '"', '\'', '*', '#', '=', '<', '>', '`',
];

const TRAILING_PUNCTUATION: &[char] = &['.', '!', '?'];

/// Returns the symbology when `code` is a fixed-length digit string with a
/// valid check digit.
pub fn validate(code: &str) -> Option<Symbology> {
    if !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let symbology = Symbology::from_len(code.len())?;
    let digits: Vec<u32> = code.bytes().map(|b| u32::from(b - b'0')).collect();
    let (check, data) = digits.split_last()?;
    if gs1_check_digit(data) == *check {
        Some(symbology)
    } else {
        None
    }
}

/// Mod-10 check digit shared by EAN-8, UPC-A and EAN-13: weights 3 and 1
/// alternate leftwards starting from the rightmost data digit.
pub fn gs1_check_digit(data: &[u32]) -> u32 {
    let sum: u32 = data
        .iter()
        .rev()
        .enumerate()
        .map(|(i, d)| if i % 2 == 0 { d * 3 } else { *d })
        .sum();
    (10 - sum % 10) % 10
}

pub fn tokens(fragment: &str) -> impl Iterator<Item = &str> {
    fragment
        .split(|c: char| c.is_whitespace() || SEPARATORS.contains(&c))
        .map(|t| t.trim_end_matches(TRAILING_PUNCTUATION))
        .filter(|t| !t.is_empty())
}

/// Valid barcodes found as standalone tokens in `fragment`, in order of
/// appearance, duplicates included.
pub fn candidates_in_text(fragment: &str) -> Vec<String> {
    tokens(fragment)
        .filter(|t| validate(t).is_some())
        .map(str::to_string)
        .collect()
}

/// Cleans a string reported by a barcode decoder. Decoders sometimes group
/// digits with spaces, so inner whitespace is dropped before validation.
pub fn normalize_decoded(raw: &str) -> Option<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    validate(&compact).map(|_| compact)
}

/// Trims a caller-supplied barcode and rejects empty or non-numeric input.
/// Length and check digit are not enforced: a claim may be a misread.
pub fn parse_claim(raw: &str) -> Result<String> {
    let claim = raw.trim();
    if claim.is_empty() {
        return Err(Error::validation("barcode is empty"));
    }
    if !claim.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::validation(format!(
            "barcode must contain only digits: {claim:?}"
        )));
    }
    Ok(claim.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_known_codes_of_each_length() {
        assert_eq!(validate("8885007027531"), Some(Symbology::Ean13));
        assert_eq!(validate("036000291452"), Some(Symbology::UpcA));
        assert_eq!(validate("96385074"), Some(Symbology::Ean8));
    }

    #[test]
    fn rejects_bad_checksum_and_wrong_length() {
        assert_eq!(validate("8885007027532"), None);
        assert_eq!(validate("036000291453"), None);
        assert_eq!(validate("1234567890"), None);
        assert_eq!(validate("88850070275311"), None);
        assert_eq!(validate("888500702753a"), None);
    }

    #[test]
    fn extracts_standalone_tokens_with_punctuation() {
        let text = "EAN:8885007027531, alt (036000291452). Lot 12345";
        assert_eq!(
            candidates_in_text(text),
            vec!["8885007027531".to_string(), "036000291452".to_string()]
        );
    }

    #[test]
    fn ignores_digits_embedded_in_longer_numbers() {
        // 13-digit valid code hidden inside a 14-digit run, a phone number and a decimal.
        let text = "Call +18885007027531 or 888-500-7027 ref 88850070275310 price 1.8885007027531";
        assert!(candidates_in_text(text).is_empty());
    }

    #[test]
    fn markdown_table_cells_are_split() {
        let text = "| Barcode | 8885007027555 |";
        assert_eq!(candidates_in_text(text), vec!["8885007027555".to_string()]);
    }

    #[test]
    fn parse_claim_trims_and_validates() {
        assert_eq!(parse_claim(" 8885007027531\n").unwrap(), "8885007027531");
        assert!(parse_claim("   ").unwrap_err().is_validation());
        assert!(parse_claim("88850-07027531").unwrap_err().is_validation());
        assert_eq!(parse_claim("123").unwrap(), "123");
    }

    #[test]
    fn normalize_decoded_strips_grouping_spaces() {
        assert_eq!(
            normalize_decoded(" 8 885007 027531 ").as_deref(),
            Some("8885007027531")
        );
        assert_eq!(normalize_decoded("8885007027530"), None);
    }
}
