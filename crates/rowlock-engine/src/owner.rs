//! Process-local reentrancy bookkeeping, keyed by lock key and owner.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rowlock_core::holder::OwnerId;

/// What this process believes about one `(key, owner)` hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OwnerEntry {
    pub count: u32,
    /// Lease written to the record; reused on partial unlocks.
    pub lease: Duration,
    pub auto_extend: bool,
}

#[derive(Default)]
pub(crate) struct OwnerTable {
    entries: Mutex<HashMap<(String, OwnerId), OwnerEntry>>,
}

impl OwnerTable {
    pub fn get(&self, key: &str, owner: &OwnerId) -> Option<OwnerEntry> {
        self.entries
            .lock()
            .get(&(key.to_string(), owner.clone()))
            .copied()
    }

    pub fn contains(&self, key: &str, owner: &OwnerId) -> bool {
        self.get(key, owner).is_some()
    }

    /// Inserts or replaces the entry, returning the previous one.
    pub fn insert(&self, key: &str, owner: &OwnerId, entry: OwnerEntry) -> Option<OwnerEntry> {
        self.entries
            .lock()
            .insert((key.to_string(), owner.clone()), entry)
    }

    pub fn set_count(&self, key: &str, owner: &OwnerId, count: u32) {
        if let Some(entry) = self.entries.lock().get_mut(&(key.to_string(), owner.clone())) {
            entry.count = count;
        }
    }

    pub fn remove(&self, key: &str, owner: &OwnerId) -> Option<OwnerEntry> {
        self.entries.lock().remove(&(key.to_string(), owner.clone()))
    }

    /// Removes and returns every entry belonging to `owner`.
    pub fn take_owner(&self, owner: &OwnerId) -> Vec<(String, OwnerEntry)> {
        let mut entries = self.entries.lock();
        let keys: Vec<(String, OwnerId)> = entries
            .keys()
            .filter(|(_, o)| o == owner)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|id| entries.remove(&id).map(|entry| (id.0, entry)))
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
