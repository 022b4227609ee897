//! Uploaded file value type
//!
//! Column and job payload format:
//!
//! ```json
//! {"id":"abc.jpg","storage":"cache","metadata":{"size":5000,"filename":"a.jpg","mime_type":"image/jpeg"}}
//! ```

use std::hash::{Hash, Hasher};
use std::sync::LazyLock;

use att_storage::StorageRegistry;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AttachmentResult;

/// Ordered string-keyed metadata
pub type Metadata = serde_json::Map<String, Value>;

static NO_METADATA: LazyLock<Metadata> = LazyLock::new(Metadata::new);

/// A file uploaded to one of the registered storages.
///
/// Immutable value: identity is `(id, storage)`, metadata does not take part
/// in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedFile {
    id: String,
    #[serde(rename = "storage")]
    storage_key: String,
    /// `None` when the payload carried no `metadata` key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Metadata>,
}

impl UploadedFile {
    pub fn new(id: impl Into<String>, storage_key: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            storage_key: storage_key.into(),
            metadata: Some(metadata),
        }
    }

    /// Parse column/payload JSON
    pub fn from_json(data: &str) -> AttachmentResult<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn from_value(value: Value) -> AttachmentResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> String {
        // a struct of strings and a string-keyed map cannot fail to serialize
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    pub fn metadata(&self) -> &Metadata {
        self.metadata.as_ref().unwrap_or(&*NO_METADATA)
    }

    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata().get(key)
    }

    /// File size in bytes
    pub fn size(&self) -> Option<u64> {
        self.metadata_value("size").and_then(Value::as_u64)
    }

    pub fn original_filename(&self) -> Option<&str> {
        self.metadata_value("filename").and_then(Value::as_str)
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.metadata_value("mime_type").and_then(Value::as_str)
    }

    pub fn width(&self) -> Option<u64> {
        self.metadata_value("width").and_then(Value::as_u64)
    }

    pub fn height(&self) -> Option<u64> {
        self.metadata_value("height").and_then(Value::as_u64)
    }

    /// Lowercased extension of the id, falling back to the original filename
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.id)
            .or_else(|| self.original_filename().and_then(extension_of))
            .map(|ext| ext.to_ascii_lowercase())
    }

    pub async fn open(&self, storages: &StorageRegistry) -> AttachmentResult<Bytes> {
        Ok(storages.get(&self.storage_key)?.open(&self.id).await?)
    }

    pub async fn exists(&self, storages: &StorageRegistry) -> AttachmentResult<bool> {
        Ok(storages.get(&self.storage_key)?.exists(&self.id).await?)
    }

    pub async fn delete(&self, storages: &StorageRegistry) -> AttachmentResult<()> {
        Ok(storages.get(&self.storage_key)?.delete(&self.id).await?)
    }

    pub fn url(&self, storages: &StorageRegistry) -> AttachmentResult<String> {
        Ok(storages.get(&self.storage_key)?.url(&self.id))
    }
}

/// Extension of the last path segment; only alphanumeric extensions count
pub(crate) fn extension_of(path: &str) -> Option<&str> {
    let basename = path.rsplit(['/', '\\']).next()?;
    let (stem, ext) = basename.rsplit_once('.')?;
    let valid = !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric());
    (!stem.is_empty() && valid).then_some(ext)
}

impl PartialEq for UploadedFile {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.storage_key == other.storage_key
    }
}

impl Eq for UploadedFile {}

impl Hash for UploadedFile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.storage_key.hash(state);
    }
}
