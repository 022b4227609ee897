//! Metadata extraction and uploading into named storages

use std::sync::Arc;

use att_storage::{generate_location, LocationContext, StorageRegistry};
use bytes::Bytes;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::error::AttachmentResult;
use crate::file::{extension_of, Metadata, UploadedFile};

/// Raw input of an upload
#[derive(Debug, Clone)]
pub struct UploadInput {
    pub data: Bytes,
    /// Client-supplied filename
    pub filename: Option<String>,
    /// Client-declared MIME type
    pub mime_type: Option<String>,
}

impl UploadInput {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            filename: None,
            mime_type: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    fn extension(&self) -> Option<&str> {
        self.filename.as_deref().and_then(extension_of)
    }
}

/// Adds entries to the metadata of a file being uploaded.
///
/// Closures of the form `Fn(&UploadInput, &mut Metadata)` are extractors.
pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, input: &UploadInput, metadata: &mut Metadata);
}

impl<F> MetadataExtractor for F
where
    F: Fn(&UploadInput, &mut Metadata) + Send + Sync,
{
    fn extract(&self, input: &UploadInput, metadata: &mut Metadata) {
        (self)(input, metadata)
    }
}

/// Extracts `filename`, `size` and `mime_type`.
///
/// The MIME type is the client-declared one when present, otherwise it is
/// guessed from the filename extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicMetadata;

impl MetadataExtractor for BasicMetadata {
    fn extract(&self, input: &UploadInput, metadata: &mut Metadata) {
        let filename = input.filename.clone().map(Value::String).unwrap_or(Value::Null);
        metadata.insert("filename".to_string(), filename);
        metadata.insert("size".to_string(), Value::from(input.data.len() as u64));

        let mime_type = input.mime_type.clone().or_else(|| {
            input
                .filename
                .as_deref()
                .and_then(|name| mime_guess::from_path(name).first())
                .map(|mime| mime.to_string())
        });
        metadata.insert(
            "mime_type".to_string(),
            mime_type.map(Value::String).unwrap_or(Value::Null),
        );
    }
}

/// Stores the hex SHA256 digest of the content as `sha256`
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureExtractor;

impl MetadataExtractor for SignatureExtractor {
    fn extract(&self, input: &UploadInput, metadata: &mut Metadata) {
        let mut hasher = Sha256::new();
        hasher.update(&input.data);
        metadata.insert(
            "sha256".to_string(),
            Value::String(hex::encode(hasher.finalize())),
        );
    }
}

/// Uploads inputs into the registered storages
#[derive(Clone)]
pub struct Uploader {
    storages: StorageRegistry,
    extractors: Vec<Arc<dyn MetadataExtractor>>,
}

impl Uploader {
    /// Uploader with the basic metadata extractor
    pub fn new(storages: StorageRegistry) -> Self {
        Self {
            storages,
            extractors: vec![Arc::new(BasicMetadata)],
        }
    }

    /// Append an extractor; later extractors may overwrite earlier keys
    pub fn extractor(mut self, extractor: impl MetadataExtractor + 'static) -> Self {
        self.extractors.push(Arc::new(extractor));
        self
    }

    pub fn storages(&self) -> &StorageRegistry {
        &self.storages
    }

    pub fn extract_metadata(&self, input: &UploadInput) -> Metadata {
        let mut metadata = Metadata::new();
        for extractor in &self.extractors {
            extractor.extract(input, &mut metadata);
        }
        metadata
    }

    /// Upload `input` into the storage registered as `storage_key`
    #[instrument(skip(self, input, context), fields(size = input.data.len()))]
    pub async fn upload(
        &self,
        input: &UploadInput,
        storage_key: &str,
        context: Option<&LocationContext>,
    ) -> AttachmentResult<UploadedFile> {
        let storage = self.storages.get(storage_key)?;
        let metadata = self.extract_metadata(input);
        let id = generate_location(input.extension(), context);

        storage.upload(&id, input.data.clone()).await?;
        debug!(id = %id, storage = %storage_key, "File uploaded");

        Ok(UploadedFile::new(id, storage_key, metadata))
    }

    /// Copy `file` into `storage_key` under a new location, keeping metadata
    #[instrument(skip(self, file, context), fields(from = %file.storage_key(), id = %file.id()))]
    pub async fn transfer(
        &self,
        file: &UploadedFile,
        storage_key: &str,
        context: Option<&LocationContext>,
    ) -> AttachmentResult<UploadedFile> {
        let target = self.storages.get(storage_key)?;
        let data = file.open(&self.storages).await?;
        let id = generate_location(file.extension().as_deref(), context);

        target.upload(&id, data).await?;
        debug!(id = %id, storage = %storage_key, "File transferred");

        Ok(UploadedFile::new(id, storage_key, file.metadata().clone()))
    }
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("storages", &self.storages)
            .field("extractors", &self.extractors.len())
            .finish()
    }
}
