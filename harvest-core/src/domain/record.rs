//! Scraped record types

use serde::{Deserialize, Serialize};

/// One result line emitted by a scraper subprocess
///
/// Older scripts emit `competitor_price` instead of `price`; both are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedRecord {
    pub name: String,
    #[serde(alias = "competitor_price")]
    pub price: f64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub ean: Option<String>,
    /// Identifier of the item on the scraped site
    #[serde(default)]
    pub source_id: Option<String>,
}

impl ScrapedRecord {
    /// Parses a stdout line as a record
    ///
    /// Returns `None` for anything that is not a JSON object with a non-empty
    /// name and a finite price.
    pub fn from_line(line: &str) -> Option<Self> {
        if !line.starts_with('{') {
            return None;
        }
        let record: ScrapedRecord = serde_json::from_str(line).ok()?;
        if record.name.trim().is_empty() || !record.price.is_finite() {
            return None;
        }
        Some(record)
    }
}
