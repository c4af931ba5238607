//! Core domain model for the Shopee link checker.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "slc-core";

/// Status marker written for a listing that is still live.
pub const STATUS_LIVE: &str = "x";

/// Status marker written for everything else.
pub const STATUS_BLANK: &str = "";

/// Shop/item pair addressed by a marketplace product URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductIdentifier {
    pub shop_id: String,
    pub item_id: String,
    pub locale: String,
}

impl ProductIdentifier {
    pub fn new(
        shop_id: impl Into<String>,
        item_id: impl Into<String>,
        locale: impl Into<String>,
    ) -> Self {
        Self {
            shop_id: shop_id.into(),
            item_id: item_id.into(),
            locale: locale.into(),
        }
    }

    /// Dedup key. Locale is deliberately not part of it.
    pub fn key(&self) -> String {
        format!("{}-{}", self.shop_id, self.item_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckOutcome {
    Exists,
    NotExists,
    Inconclusive,
}

impl CheckOutcome {
    pub fn status_marker(self) -> &'static str {
        match self {
            CheckOutcome::Exists => STATUS_LIVE,
            CheckOutcome::NotExists | CheckOutcome::Inconclusive => STATUS_BLANK,
        }
    }
}

/// One cell of an uploaded sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Bool(bool),
    #[default]
    Blank,
}

impl CellValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Blank => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Text(s) => f.write_str(s),
            CellValue::Number(n) => write!(f, "{n}"),
            CellValue::Bool(b) => write!(f, "{b}"),
            CellValue::Blank => Ok(()),
        }
    }
}

/// Ordered column-key → value mapping for one data row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RowRecord {
    /// 0-based sheet row the record was read from (row 0 is the header).
    pub sheet_row: u32,
    cells: Vec<(String, CellValue)>,
}

impl RowRecord {
    pub fn with_cells(sheet_row: u32, cells: Vec<(String, CellValue)>) -> Self {
        Self { sheet_row, cells }
    }

    pub fn get(&self, key: &str) -> Option<&CellValue> {
        self.cells.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Overwrites the value under `key`, appending the key if it is new.
    pub fn set(&mut self, key: &str, value: CellValue) {
        match self.cells.iter_mut().find(|(k, _)| k == key) {
            Some((_, slot)) => *slot = value,
            None => self.cells.push((key.to_string(), value)),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(k, _)| k.as_str())
    }

    pub fn cells(&self) -> &[(String, CellValue)] {
        &self.cells
    }
}

/// Link/status column keys, resolved once per dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub link_column_key: String,
    pub status_column_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_rows: usize,
    pub marketplace_links: usize,
    pub live_links: usize,
    pub missing_links: usize,
}
