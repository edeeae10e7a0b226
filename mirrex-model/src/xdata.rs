use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::pending::ChangelogCounts;

/// Auxiliary key/value payload attached to requests and replies, the dict of
/// the host framework. Values are raw bytes; typed accessors decode the few
/// shapes the core cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Xdata(BTreeMap<String, Vec<u8>>);

impl Xdata {
    pub fn new() -> Self {
        Xdata::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.0.insert(key.into(), value.into());
    }

    /// Set a presence-only flag (empty value).
    pub fn mark(&mut self, key: impl Into<String>) {
        self.0.insert(key.into(), Vec::new());
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.0.remove(key)
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        let raw = self.get(key)?;
        let bytes: [u8; 4] = raw.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn set_u32(&mut self, key: impl Into<String>, value: u32) {
        self.set(key, value.to_be_bytes().to_vec());
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|raw| std::str::from_utf8(raw).ok())
    }

    /// Decode a changelog-counter xattr if present and well-formed.
    pub fn get_counts(&self, key: &str) -> Option<ChangelogCounts> {
        self.get(key).and_then(|raw| ChangelogCounts::from_wire(raw).ok())
    }

    pub fn set_counts(&mut self, key: impl Into<String>, counts: &ChangelogCounts) {
        self.set(key, counts.to_wire());
    }

    pub fn get_delta(&self, key: &str) -> Option<crate::pending::ChangelogDelta> {
        self.get(key)
            .and_then(|raw| crate::pending::ChangelogDelta::from_wire(raw).ok())
    }

    pub fn set_delta(&mut self, key: impl Into<String>, delta: &crate::pending::ChangelogDelta) {
        self.set(key, delta.to_wire());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Keys absent in `self` are copied from `other`; existing keys win.
    pub fn merge_missing(&mut self, other: &Xdata) {
        for (key, value) in &other.0 {
            self.0.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}
