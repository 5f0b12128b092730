//! Last-write-wins map.
//!
//! `put` overwrites unconditionally. Which write is "last" is decided before
//! the map is touched: remote commands are admitted in versionstamp order and
//! local writes are applied as they happen.

use std::collections::BTreeMap;

use serde_json::Value;

/// The map CRDT.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LwwMap {
    entries: BTreeMap<String, Value>,
}

impl LwwMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Remove a key outright. Maps keep no tombstones.
    pub fn delete(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Snapshot of the whole map.
    pub fn to_object(&self) -> BTreeMap<String, Value> {
        self.entries.clone()
    }

    /// Fill in keys missing locally. Existing keys are left untouched.
    ///
    /// Returns whether anything changed.
    pub fn merge<I>(&mut self, entries: I) -> bool
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut changed = false;
        for (key, value) in entries {
            if !self.entries.contains_key(&key) {
                self.entries.insert(key, value);
                changed = true;
            }
        }
        changed
    }
}
