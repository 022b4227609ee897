//! In-memory storage for tests and development

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::storage::{Storage, StorageError, StorageResult};

/// In-memory storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all stored ids
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.files.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Get number of stored files
    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.read().await.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn upload(&self, id: &str, data: Bytes) -> StorageResult<()> {
        self.files.write().await.insert(id.to_string(), data);
        Ok(())
    }

    async fn open(&self, id: &str) -> StorageResult<Bytes> {
        self.files
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn exists(&self, id: &str) -> StorageResult<bool> {
        Ok(self.files.read().await.contains_key(id))
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        self.files
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    fn url(&self, id: &str) -> String {
        format!("memory://{}", id)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_upload_open() {
        let storage = MemoryStorage::new();
        let data = Bytes::from("Hello, World!");

        storage.upload("test.txt", data.clone()).await.unwrap();
        assert_eq!(storage.open("test.txt").await.unwrap(), data);
        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn test_memory_storage_delete() {
        let storage = MemoryStorage::new();

        storage.upload("test.txt", Bytes::from("x")).await.unwrap();
        assert!(storage.exists("test.txt").await.unwrap());

        storage.delete("test.txt").await.unwrap();
        assert!(!storage.exists("test.txt").await.unwrap());
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_memory_storage_not_found() {
        let storage = MemoryStorage::new();

        assert!(matches!(
            storage.open("missing.txt").await,
            Err(StorageError::NotFound(_))
        ));
        let err = storage.delete("missing.txt").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_memory_storage_keys_sorted() {
        let storage = MemoryStorage::new();
        storage.upload("b", Bytes::new()).await.unwrap();
        storage.upload("a", Bytes::new()).await.unwrap();

        assert_eq!(storage.keys().await, vec!["a".to_string(), "b".to_string()]);
    }
}
