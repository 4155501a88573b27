//! Ordered rule table that fills product attributes from recognized text.
//!
//! The table is compiled once when the processor is built and is read-only
//! afterwards. For each field the rules are tried in ascending priority; the
//! first rule that matches anywhere in the text wins.

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Brand,
    Model,
    Color,
    Type,
    PartNumber,
}

impl Field {
    pub const ALL: [Field; 5] = [
        Field::Brand,
        Field::Model,
        Field::Color,
        Field::Type,
        Field::PartNumber,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Field::Brand => "brand",
            Field::Model => "model",
            Field::Color => "color",
            Field::Type => "type",
            Field::PartNumber => "part_number",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Matcher {
    /// Whole-word, case-insensitive; the leftmost keyword in the text wins.
    Keywords(&'static [&'static str]),
    /// Regex with exactly one capture group holding the value.
    Pattern(&'static str),
}

#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub field: Field,
    pub name: &'static str,
    pub priority: u8,
    pub matcher: Matcher,
}

#[derive(Debug, Clone)]
pub struct FieldRule {
    pub field: Field,
    pub name: &'static str,
    pub priority: u8,
    regex: Regex,
}

impl FieldRule {
    fn compile(spec: &RuleSpec) -> Result<Self, regex::Error> {
        let pattern = match &spec.matcher {
            Matcher::Keywords(words) => {
                let alternation = words
                    .iter()
                    .map(|w| regex::escape(w))
                    .collect::<Vec<_>>()
                    .join("|");
                format!(r"(?i)\b({alternation})\b")
            }
            Matcher::Pattern(p) => (*p).to_string(),
        };
        Ok(Self {
            field: spec.field,
            name: spec.name,
            priority: spec.priority,
            regex: Regex::new(&pattern)?,
        })
    }

    pub fn capture(&self, text: &str) -> Option<String> {
        let caps = self.regex.captures(text)?;
        let value = caps.get(1)?.as_str().trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }
}

const BRANDS: &[&str] = &["epson", "hp", "canon", "brother", "lexmark", "xerox"];
const COLORS: &[&str] = &["black", "cyan", "magenta", "yellow", "blue", "red", "green"];
const TYPES: &[&str] = &["ink", "toner", "cartridge", "ribbon"];

pub fn builtin_specs() -> Vec<RuleSpec> {
    vec![
        RuleSpec {
            field: Field::Brand,
            name: "brand_keyword",
            priority: 10,
            matcher: Matcher::Keywords(BRANDS),
        },
        RuleSpec {
            field: Field::Brand,
            name: "brand_label",
            priority: 20,
            matcher: Matcher::Pattern(r"(?i)\bbrand[:\s]+(\w+)"),
        },
        RuleSpec {
            field: Field::Model,
            name: "model_label",
            priority: 10,
            matcher: Matcher::Pattern(r"(?i)\bmodel[:\s]+([A-Z0-9][A-Z0-9\-]*)"),
        },
        RuleSpec {
            field: Field::Model,
            name: "model_ink_code",
            priority: 20,
            matcher: Matcher::Pattern(r"\b(\d{2,3}[A-Z]{1,2})\b"),
        },
        RuleSpec {
            field: Field::Color,
            name: "color_keyword",
            priority: 10,
            matcher: Matcher::Keywords(COLORS),
        },
        RuleSpec {
            field: Field::Color,
            name: "color_label",
            priority: 20,
            matcher: Matcher::Pattern(r"(?i)\bcolou?r[:\s]+(\w+)"),
        },
        RuleSpec {
            field: Field::Type,
            name: "type_keyword",
            priority: 10,
            matcher: Matcher::Keywords(TYPES),
        },
        RuleSpec {
            field: Field::Type,
            name: "type_label",
            priority: 20,
            matcher: Matcher::Pattern(r"(?i)\btype[:\s]+(\w+)"),
        },
        RuleSpec {
            field: Field::PartNumber,
            name: "part_label",
            priority: 10,
            matcher: Matcher::Pattern(
                r"(?i)\bpart(?:\s*(?:no\.?|number))?[:\s#]+([A-Z0-9][A-Z0-9\-]*)",
            ),
        },
        RuleSpec {
            field: Field::PartNumber,
            name: "pn_label",
            priority: 20,
            matcher: Matcher::Pattern(r"(?i)\bp/?n[:\s#]+([A-Z0-9][A-Z0-9\-]*)"),
        },
    ]
}

#[derive(Debug, Clone)]
pub struct FieldRules {
    rules: Vec<FieldRule>,
}

impl FieldRules {
    pub fn new(specs: &[RuleSpec]) -> Result<Self, regex::Error> {
        let mut rules = specs
            .iter()
            .map(FieldRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        rules.sort_by(|a, b| a.field.cmp(&b.field).then(a.priority.cmp(&b.priority)));
        Ok(Self { rules })
    }

    pub fn builtin() -> Result<Self, regex::Error> {
        Self::new(&builtin_specs())
    }

    /// Rules for `field` in evaluation order.
    pub fn for_field(&self, field: Field) -> impl Iterator<Item = &FieldRule> {
        self.rules.iter().filter(move |r| r.field == field)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
