use std::collections::HashMap;

use crate::{PatchError, Result};

/// Bookkeeping needed to undo one applied patch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchRecord {
    pub name: String,
    /// Resolved absolute address of the patch site
    pub address: usize,
    /// Bytes found at `address` before the patch was written
    pub original: Vec<u8>,
}

impl PatchRecord {
    pub fn len(&self) -> usize {
        self.original.len()
    }

    pub fn is_empty(&self) -> bool {
        self.original.is_empty()
    }
}

/// Table of live patches, at most one record per name.
#[derive(Debug, Default)]
pub struct PatchStore {
    records: HashMap<String, PatchRecord>,
}

impl PatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: PatchRecord) -> Result<()> {
        if self.records.contains_key(&record.name) {
            return Err(PatchError::AlreadyApplied(record.name));
        }
        self.records.insert(record.name.clone(), record);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PatchRecord> {
        self.records.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<PatchRecord> {
        self.records.remove(name)
    }

    /// Names of every live record, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatchRecord> {
        self.records.values()
    }
}
