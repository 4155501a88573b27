//! Inventory records keyed by barcode.
//!
//! Lives in the same LMDB environment as the processing cache, in its own
//! named database. Read-modify-write operations (add, remove, applying an
//! extraction) run inside a single write transaction, so concurrent callers
//! never interleave on the same barcode.

use chrono::{DateTime, Utc};
use heed::Env;
use heed::types::Str;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::barcode::parse_claim;
use crate::cache::{INVENTORY_DB, ImageRecord, StrDb};
use crate::error::Result;
use crate::fusion;
use crate::rules::{Field, FieldRules};

/// Attributes an item's name and description are built from, and the ones a
/// verification compares against the item.
pub const ITEM_FIELDS: [Field; 4] = [Field::Brand, Field::Model, Field::Color, Field::Type];

/// What an image said about an item the last time it was looked at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionSnapshot {
    pub image_path: String,
    pub file_hash: String,
    pub barcodes: BTreeSet<String>,
    pub product_info: BTreeMap<String, String>,
    pub extracted_at: DateTime<Utc>,
}

impl ExtractionSnapshot {
    pub fn from_record(image_path: &str, record: &ImageRecord) -> Self {
        Self {
            image_path: image_path.to_string(),
            file_hash: record.file_hash.clone(),
            barcodes: record.barcodes.clone(),
            product_info: record.product_info.clone(),
            extracted_at: record.processed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub name: String,
    pub quantity: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub last_extraction: Option<ExtractionSnapshot>,
    pub last_updated: DateTime<Utc>,
}

impl InventoryItem {
    pub fn new(name: impl Into<String>, quantity: u32, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quantity,
            description: description.into(),
            verified: false,
            last_extraction: None,
            last_updated: Utc::now(),
        }
    }

    /// Lowercased alphanumeric words of the name and description.
    pub fn keywords(&self) -> BTreeSet<String> {
        words(&self.name).chain(words(&self.description)).collect()
    }

    /// Attributes the item itself states, read from its name and description
    /// with the same rules used on images.
    pub fn attributes(&self, rules: &FieldRules) -> BTreeMap<String, String> {
        fusion::attributes(&[self.name.clone(), self.description.clone()], rules)
    }
}

pub(crate) fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

#[derive(Debug, Clone, Serialize)]
pub struct StockedItem {
    pub barcode: String,
    #[serde(flatten)]
    pub item: InventoryItem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RemoveOutcome {
    Decremented { remaining: u32 },
    Deleted,
    NotFound,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InventorySync {
    pub created: Vec<String>,
    pub updated: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InventorySummary {
    pub unique_items: u64,
    pub total_quantity: u64,
    pub verified_items: u64,
}

#[derive(Clone)]
pub struct Inventory {
    env: Arc<Env>,
    items: StrDb,
}

impl Inventory {
    pub fn new(env: Arc<Env>) -> Result<Self> {
        let mut wtxn = env.write_txn()?;
        let items = env.create_database::<Str, Str>(&mut wtxn, Some(INVENTORY_DB))?;
        wtxn.commit()?;
        Ok(Self { env, items })
    }

    pub fn get(&self, barcode: &str) -> Result<Option<InventoryItem>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.items.get(&rtxn, barcode)?.and_then(|raw| decode(barcode, raw)))
    }

    pub fn upsert(&self, barcode: &str, item: &InventoryItem) -> Result<()> {
        let barcode = parse_claim(barcode)?;
        let payload = serde_json::to_string(item)?;
        let mut wtxn = self.env.write_txn()?;
        self.items.put(&mut wtxn, &barcode, &payload)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<StockedItem>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.items.iter(&rtxn)? {
            let (barcode, raw) = entry?;
            if let Some(item) = decode(barcode, raw) {
                out.push(StockedItem {
                    barcode: barcode.to_string(),
                    item,
                });
            }
        }
        Ok(out)
    }

    pub fn summary(&self) -> Result<InventorySummary> {
        let mut summary = InventorySummary::default();
        for stocked in self.list()? {
            summary.unique_items += 1;
            summary.total_quantity += u64::from(stocked.item.quantity);
            if stocked.item.verified {
                summary.verified_items += 1;
            }
        }
        Ok(summary)
    }

    /// Adds one unit, creating a placeholder item named after the last four
    /// digits when the barcode is new.
    pub fn add(&self, barcode: &str) -> Result<InventoryItem> {
        let barcode = parse_claim(barcode)?;
        let mut wtxn = self.env.write_txn()?;
        let existing = self
            .items
            .get(&wtxn, &barcode)?
            .and_then(|raw| decode(&barcode, raw));

        let item = match existing {
            Some(mut item) => {
                item.quantity = item.quantity.saturating_add(1);
                item.last_updated = Utc::now();
                item
            }
            None => {
                let suffix_start = barcode.len().saturating_sub(4);
                InventoryItem::new(
                    format!("Item-{}", &barcode[suffix_start..]),
                    1,
                    "New item - update description",
                )
            }
        };

        let payload = serde_json::to_string(&item)?;
        self.items.put(&mut wtxn, &barcode, &payload)?;
        wtxn.commit()?;
        Ok(item)
    }

    /// Takes one unit away; the item disappears when its last unit goes.
    pub fn remove(&self, barcode: &str) -> Result<RemoveOutcome> {
        let barcode = parse_claim(barcode)?;
        let mut wtxn = self.env.write_txn()?;
        let Some(mut item) = self
            .items
            .get(&wtxn, &barcode)?
            .and_then(|raw| decode(&barcode, raw))
        else {
            return Ok(RemoveOutcome::NotFound);
        };

        let outcome = if item.quantity > 1 {
            item.quantity -= 1;
            item.last_updated = Utc::now();
            let payload = serde_json::to_string(&item)?;
            self.items.put(&mut wtxn, &barcode, &payload)?;
            RemoveOutcome::Decremented {
                remaining: item.quantity,
            }
        } else {
            self.items.delete(&mut wtxn, &barcode)?;
            RemoveOutcome::Deleted
        };
        wtxn.commit()?;
        Ok(outcome)
    }

    /// Brings the inventory in line with what an image showed. Known items get
    /// the snapshot and a description rebuilt from brand, model, color and type;
    /// unknown barcodes become new items. The verified flag is left alone.
    pub fn record_extraction(&self, image_path: &str, record: &ImageRecord) -> Result<InventorySync> {
        let mut sync = InventorySync::default();
        if !record.success || record.barcodes.is_empty() {
            return Ok(sync);
        }

        let snapshot = ExtractionSnapshot::from_record(image_path, record);
        let described = describe(&record.product_info);
        let now = Utc::now();

        let mut wtxn = self.env.write_txn()?;
        for code in &record.barcodes {
            let existing = self.items.get(&wtxn, code)?.and_then(|raw| decode(code, raw));
            let item = match existing {
                Some(mut item) => {
                    if let Some(description) = &described {
                        item.description = description.clone();
                    }
                    item.last_extraction = Some(snapshot.clone());
                    item.last_updated = now;
                    sync.updated.push(code.clone());
                    item
                }
                None => {
                    let mut item = InventoryItem::new(
                        default_name(&record.product_info),
                        1,
                        format!("Auto-detected from image: {}", record.filename),
                    );
                    item.last_extraction = Some(snapshot.clone());
                    item.last_updated = now;
                    sync.created.push(code.clone());
                    item
                }
            };
            let payload = serde_json::to_string(&item)?;
            self.items.put(&mut wtxn, code, &payload)?;
        }
        wtxn.commit()?;
        Ok(sync)
    }

    /// Empties the inventory and returns how many items were dropped.
    pub fn reset(&self) -> Result<u64> {
        let mut wtxn = self.env.write_txn()?;
        let removed = self.items.len(&wtxn)?;
        self.items.clear(&mut wtxn)?;
        wtxn.commit()?;
        tracing::info!(removed, "inventory reset");
        Ok(removed)
    }

    /// Sets `verified` on an existing item. Returns false when the barcode is
    /// not stocked.
    pub fn mark_verified(&self, barcode: &str, snapshot: ExtractionSnapshot) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let Some(mut item) = self
            .items
            .get(&wtxn, barcode)?
            .and_then(|raw| decode(barcode, raw))
        else {
            return Ok(false);
        };
        item.verified = true;
        item.last_extraction = Some(snapshot);
        item.last_updated = Utc::now();
        let payload = serde_json::to_string(&item)?;
        self.items.put(&mut wtxn, barcode, &payload)?;
        wtxn.commit()?;
        Ok(true)
    }
}

fn decode(barcode: &str, raw: &str) -> Option<InventoryItem> {
    match serde_json::from_str(raw) {
        Ok(item) => Some(item),
        Err(err) => {
            tracing::warn!(barcode, error = %err, "ignoring undecodable inventory entry");
            None
        }
    }
}

fn describe(product_info: &BTreeMap<String, String>) -> Option<String> {
    let parts: Vec<&str> = ITEM_FIELDS
        .iter()
        .filter_map(|f| product_info.get(f.as_str()).map(String::as_str))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

fn default_name(product_info: &BTreeMap<String, String>) -> String {
    ITEM_FIELDS
        .iter()
        .filter_map(|field| {
            let value = product_info.get(field.as_str()).map(String::as_str);
            match field {
                Field::Brand => Some(value.unwrap_or("Unknown")),
                Field::Type => Some(value.unwrap_or("Item")),
                _ => value,
            }
        })
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
