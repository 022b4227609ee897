//! Attachment error types

use att_storage::StorageError;
use thiserror::Error;

use crate::record::PersistenceError;

/// Attacher errors.
///
/// Validation failures are not errors; they accumulate on the attacher.
#[derive(Debug, Error)]
pub enum AttachmentError {
    /// The persisted attachment no longer matches what this process
    /// started from. Expected under concurrency; the later change wins.
    #[error("Attachment changed: {0}")]
    AttachmentChanged(String),
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Persistence error: {0}")]
    PersistenceError(#[from] PersistenceError),
    #[error("Invalid attachment data: {0}")]
    Serialization(String),
    #[error("Invalid file: {0}")]
    InvalidFile(String),
    #[error("Job queue closed")]
    QueueClosed,
    #[error("No job queue configured")]
    NoJobQueue,
    #[error("Job failed: {0}")]
    JobFailed(String),
}

impl From<serde_json::Error> for AttachmentError {
    fn from(err: serde_json::Error) -> Self {
        AttachmentError::Serialization(err.to_string())
    }
}

impl AttachmentError {
    pub fn is_attachment_changed(&self) -> bool {
        matches!(self, AttachmentError::AttachmentChanged(_))
    }

    /// A storage reported the file as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, AttachmentError::StorageError(e) if e.is_not_found())
    }
}

pub type AttachmentResult<T> = Result<T, AttachmentError>;
