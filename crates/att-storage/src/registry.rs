//! Registry of named storages

use std::collections::HashMap;
use std::sync::Arc;

use crate::storage::{Storage, StorageError, StorageResult};

/// Maps storage role names (`cache`, `store`, ...) to backends.
///
/// Built once at startup and shared; never mutated afterwards.
#[derive(Clone, Default)]
pub struct StorageRegistry {
    storages: HashMap<String, Arc<dyn Storage>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a storage under `key`
    pub fn with(mut self, key: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        self.storages.insert(key.into(), storage);
        self
    }

    /// Look up a storage by key
    pub fn get(&self, key: &str) -> StorageResult<&Arc<dyn Storage>> {
        self.storages
            .get(key)
            .ok_or_else(|| StorageError::UnknownStorage(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.storages.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.storages.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&str> = self.keys().collect();
        keys.sort_unstable();
        f.debug_struct("StorageRegistry").field("storages", &keys).finish()
    }
}
