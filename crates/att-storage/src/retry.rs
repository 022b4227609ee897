//! Retrying storage decorator

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use crate::storage::{Storage, StorageError, StorageResult};

/// Retries uploads on the wrapped storage a fixed number of times.
///
/// The last error is returned once attempts run out. `NotFound` and
/// `InvalidPath` are never retried.
pub struct RetryStorage {
    inner: Arc<dyn Storage>,
    attempts: u32,
    delay: Duration,
}

impl RetryStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self {
            inner,
            attempts: 3,
            delay: Duration::from_millis(100),
        }
    }

    /// Total attempts per upload (at least 1)
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn retryable(err: &StorageError) -> bool {
        !matches!(err, StorageError::NotFound(_) | StorageError::InvalidPath(_))
    }
}

#[async_trait]
impl Storage for RetryStorage {
    async fn upload(&self, id: &str, data: Bytes) -> StorageResult<()> {
        let mut remaining = self.attempts;
        loop {
            remaining -= 1;
            match self.inner.upload(id, data.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if remaining > 0 && Self::retryable(&e) => {
                    warn!(id = %id, error = %e, remaining = remaining, "Upload failed, retrying");
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn open(&self, id: &str) -> StorageResult<Bytes> {
        self.inner.open(id).await
    }

    async fn exists(&self, id: &str) -> StorageResult<bool> {
        self.inner.exists(id).await
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        self.inner.delete(id).await
    }

    fn url(&self, id: &str) -> String {
        self.inner.url(id)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use std::sync::atomic::{AtomicU32, Ordering};

    mock! {
        pub Backend {}

        #[async_trait]
        impl Storage for Backend {
            async fn upload(&self, id: &str, data: Bytes) -> StorageResult<()>;
            async fn open(&self, id: &str) -> StorageResult<Bytes>;
            async fn exists(&self, id: &str) -> StorageResult<bool>;
            async fn delete(&self, id: &str) -> StorageResult<()>;
            fn url(&self, id: &str) -> String;
            fn name(&self) -> &str;
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut backend = MockBackend::new();
        backend.expect_upload().times(3).returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StorageError::BackendError("timeout".into()))
            } else {
                Ok(())
            }
        });

        let storage = RetryStorage::new(Arc::new(backend))
            .attempts(3)
            .delay(Duration::ZERO);
        storage.upload("a.txt", Bytes::from("a")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let mut backend = MockBackend::new();
        backend
            .expect_upload()
            .times(2)
            .returning(|_, _| Err(StorageError::BackendError("down".into())));

        let storage = RetryStorage::new(Arc::new(backend))
            .attempts(2)
            .delay(Duration::ZERO);
        let err = storage.upload("a.txt", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::BackendError(msg) if msg == "down"));
    }

    #[tokio::test]
    async fn test_invalid_path_not_retried() {
        let mut backend = MockBackend::new();
        backend
            .expect_upload()
            .times(1)
            .returning(|id, _| Err(StorageError::InvalidPath(id.to_string())));

        let storage = RetryStorage::new(Arc::new(backend)).delay(Duration::ZERO);
        assert!(storage.upload("../x", Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_delegates_reads() {
        let mut backend = MockBackend::new();
        backend
            .expect_open()
            .returning(|_| Ok(Bytes::from_static(b"data")));
        backend.expect_exists().returning(|_| Ok(true));

        let storage = RetryStorage::new(Arc::new(backend));
        assert_eq!(storage.open("x").await.unwrap(), Bytes::from_static(b"data"));
        assert!(storage.exists("x").await.unwrap());
    }
}
