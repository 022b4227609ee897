//! Storage Abstraction
//!
//! Provides a unified interface for file storage backends.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Unknown storage: {0}")]
    UnknownStorage(String),
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage trait - unified interface for storage backends.
///
/// The caller chooses the id (location) of every upload. `delete` of an id
/// that does not exist returns `StorageError::NotFound`; callers that want
/// idempotent deletion absorb that variant.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store data under `id`, replacing anything already there
    async fn upload(&self, id: &str, data: Bytes) -> StorageResult<()>;

    /// Retrieve data by id
    async fn open(&self, id: &str) -> StorageResult<Bytes>;

    /// Check if id exists
    async fn exists(&self, id: &str) -> StorageResult<bool>;

    /// Delete data by id
    async fn delete(&self, id: &str) -> StorageResult<()>;

    /// URL under which the file is served
    fn url(&self, id: &str) -> String;

    /// Get storage name for logging
    fn name(&self) -> &str;
}
