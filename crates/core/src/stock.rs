//! Stock Index: the reference set of known identifiers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::id::Serial;

/// Default cap on display names, in characters.
pub const DEFAULT_NAME_LIMIT: usize = 100;

/// One known physical stock unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockItem {
    pub serial: Serial,
    pub name: String,
}

impl StockItem {
    pub fn new(serial: Serial, name: impl Into<String>) -> Self {
        Self {
            serial,
            name: name.into(),
        }
    }
}

/// In-memory lookup of known identifiers to display names.
///
/// Bulk-replaced on refresh or import, patched by remote change
/// notifications, and read-only from the scan path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockIndex {
    items: BTreeMap<Serial, StockItem>,
    name_limit: usize,
}

impl Default for StockIndex {
    fn default() -> Self {
        Self::new(DEFAULT_NAME_LIMIT)
    }
}

impl StockIndex {
    pub fn new(name_limit: usize) -> Self {
        Self {
            items: BTreeMap::new(),
            name_limit,
        }
    }

    /// Build an index from items; later duplicates win.
    pub fn from_items(items: impl IntoIterator<Item = StockItem>) -> Self {
        let mut index = Self::default();
        index.replace_all(items);
        index
    }

    /// Replace the whole index (refresh / re-import).
    pub fn replace_all(&mut self, items: impl IntoIterator<Item = StockItem>) {
        self.items.clear();
        for item in items {
            self.upsert(item);
        }
    }

    /// Insert or update a single item, capping its display name.
    pub fn upsert(&mut self, mut item: StockItem) {
        item.name = cap_chars(item.name.trim(), self.name_limit);
        self.items.insert(item.serial.clone(), item);
    }

    pub fn remove(&mut self, serial: &Serial) -> Option<StockItem> {
        self.items.remove(serial)
    }

    pub fn get(&self, serial: &Serial) -> Option<&StockItem> {
        self.items.get(serial)
    }

    /// Look up a raw (un-normalized) code.
    pub fn lookup(&self, raw: &str) -> Option<&StockItem> {
        let serial = Serial::parse(raw).ok()?;
        self.items.get(&serial)
    }

    pub fn contains(&self, serial: &Serial) -> bool {
        self.items.contains_key(serial)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &StockItem> {
        self.items.values()
    }

    /// Owned snapshot, e.g. for the local cache.
    pub fn to_items(&self) -> Vec<StockItem> {
        self.items.values().cloned().collect()
    }
}

fn cap_chars(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}
