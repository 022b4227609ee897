//! Local filesystem storage

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use crate::storage::{Storage, StorageError, StorageResult};

/// Stores files under a root directory, optionally below a prefix.
///
/// With a prefix of `uploads/cache` and a directory of `public`, the file
/// `abc.jpg` lives at `public/uploads/cache/abc.jpg` and is served from
/// `/uploads/cache/abc.jpg`.
pub struct FileSystemStorage {
    directory: PathBuf,
    prefix: Option<String>,
    name: String,
}

impl FileSystemStorage {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            prefix: None,
            name: "filesystem".to_string(),
        }
    }

    pub fn with_prefix(directory: impl AsRef<Path>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self {
            directory: directory.as_ref().to_path_buf(),
            prefix: (!prefix.is_empty()).then_some(prefix),
            name: "filesystem".to_string(),
        }
    }

    /// Directory files are written to (root joined with the prefix)
    pub fn root(&self) -> PathBuf {
        match &self.prefix {
            Some(prefix) => self.directory.join(prefix),
            None => self.directory.clone(),
        }
    }

    /// Resolve an id to a full path
    fn resolve_path(&self, id: &str) -> StorageResult<PathBuf> {
        if id.is_empty()
            || id.contains("..")
            || id.starts_with('/')
            || id.starts_with('\\')
        {
            return Err(StorageError::InvalidPath(id.to_string()));
        }

        Ok(self.root().join(id))
    }

    fn not_found(id: &str, err: std::io::Error) -> StorageError {
        if err.kind() == ErrorKind::NotFound {
            StorageError::NotFound(id.to_string())
        } else {
            StorageError::IoError(err)
        }
    }

    /// Remove directories left empty by a delete, stopping at the root
    async fn clean_parents(&self, path: &Path) {
        let root = self.root();
        let mut current = path.parent();

        while let Some(dir) = current {
            if dir == root || !dir.starts_with(&root) {
                break;
            }
            // fails (and stops) on the first non-empty directory
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }

    /// Delete files last modified longer than `age` ago.
    ///
    /// Used to expire the temporary storage. Returns the number of files
    /// removed.
    #[instrument(skip(self), fields(storage = "filesystem"))]
    pub async fn clear_older_than(&self, age: Duration) -> StorageResult<usize> {
        let age = chrono::Duration::from_std(age)
            .map_err(|e| StorageError::BackendError(e.to_string()))?;
        let cutoff = Utc::now() - age;

        let root = self.root();
        if !fs::try_exists(&root).await? {
            return Ok(0);
        }

        let mut removed = 0;
        let mut pending = vec![root];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let is_dir = match entry.file_type().await {
                    Ok(file_type) => file_type.is_dir(),
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                if is_dir {
                    pending.push(entry.path());
                } else if self.expire_file(&entry.path(), cutoff).await? {
                    removed += 1;
                }
            }
        }

        info!(removed = removed, "Expired files cleared");
        Ok(removed)
    }

    /// Remove `path` if it was last modified at or before `cutoff`. A file
    /// that is already gone counts as not removed.
    async fn expire_file(&self, path: &Path, cutoff: DateTime<Utc>) -> StorageResult<bool> {
        let meta = match fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let modified: DateTime<Utc> = meta.modified()?.into();
        if modified > cutoff {
            return Ok(false);
        }

        match fs::remove_file(path).await {
            Ok(()) => {
                self.clean_parents(path).await;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Storage for FileSystemStorage {
    #[instrument(skip(self, data), fields(storage = "filesystem"))]
    async fn upload(&self, id: &str, data: Bytes) -> StorageResult<()> {
        let path = self.resolve_path(id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;

        debug!(path = ?path, size = data.len(), "File stored");
        Ok(())
    }

    #[instrument(skip(self), fields(storage = "filesystem"))]
    async fn open(&self, id: &str) -> StorageResult<Bytes> {
        let path = self.resolve_path(id)?;
        let data = fs::read(&path)
            .await
            .map_err(|e| Self::not_found(id, e))?;
        Ok(Bytes::from(data))
    }

    async fn exists(&self, id: &str) -> StorageResult<bool> {
        let path = self.resolve_path(id)?;
        Ok(fs::try_exists(&path).await?)
    }

    #[instrument(skip(self), fields(storage = "filesystem"))]
    async fn delete(&self, id: &str) -> StorageResult<()> {
        let path = self.resolve_path(id)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| Self::not_found(id, e))?;
        self.clean_parents(&path).await;

        debug!(path = ?path, "File deleted");
        Ok(())
    }

    fn url(&self, id: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("/{}/{}", prefix, id),
            None => self.root().join(id).to_string_lossy().into_owned(),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_open_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSystemStorage::new(dir.path());

        storage
            .upload("nested/dir/file.txt", Bytes::from("content"))
            .await
            .unwrap();
        assert!(storage.exists("nested/dir/file.txt").await.unwrap());
        assert_eq!(
            storage.open("nested/dir/file.txt").await.unwrap(),
            Bytes::from("content")
        );

        storage.delete("nested/dir/file.txt").await.unwrap();
        assert!(!storage.exists("nested/dir/file.txt").await.unwrap());
        // emptied parents are removed, the root stays
        assert!(!dir.path().join("nested").exists());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSystemStorage::new(dir.path());

        assert!(storage.open("missing").await.unwrap_err().is_not_found());
        assert!(storage.delete("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSystemStorage::new(dir.path());

        let result = storage.open("../../../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidPath(_))));

        let result = storage.upload("/absolute", Bytes::new()).await;
        assert!(matches!(result, Err(StorageError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_prefix_and_url() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSystemStorage::with_prefix(dir.path(), "/uploads/cache/");

        storage.upload("abc.jpg", Bytes::from("img")).await.unwrap();
        assert!(dir.path().join("uploads/cache/abc.jpg").exists());
        assert_eq!(storage.url("abc.jpg"), "/uploads/cache/abc.jpg");
    }

    #[tokio::test]
    async fn test_clear_older_than() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSystemStorage::new(dir.path());

        storage.upload("a/one.txt", Bytes::from("1")).await.unwrap();
        storage.upload("two.txt", Bytes::from("2")).await.unwrap();

        // nothing is a day old yet
        let removed = storage
            .clear_older_than(Duration::from_secs(86_400))
            .await
            .unwrap();
        assert_eq!(removed, 0);

        let removed = storage.clear_older_than(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 2);
        assert!(!storage.exists("two.txt").await.unwrap());
        assert!(!dir.path().join("a").exists());
    }

    #[tokio::test]
    async fn test_expire_file_already_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSystemStorage::new(dir.path());
        storage.upload("gone.txt", Bytes::from("x")).await.unwrap();
        let path = storage.resolve_path("gone.txt").unwrap();
        storage.delete("gone.txt").await.unwrap();

        let removed = storage.expire_file(&path, Utc::now()).await.unwrap();
        assert!(!removed);
    }

    #[tokio::test]
    async fn test_clear_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSystemStorage::with_prefix(dir.path(), "never-created");

        assert_eq!(storage.clear_older_than(Duration::ZERO).await.unwrap(), 0);
    }
}
