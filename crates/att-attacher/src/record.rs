//! Persistence capability for attachment columns
//!
//! A `RecordStore` reads and writes the serialized attachment column of a
//! host record. Atomic promotion uses `reload` to obtain a `RecordGuard`: a
//! fresh view of the column that stays consistent until it is written or
//! released, for as long as the chosen strategy can guarantee it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use att_core::RecordKey;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// Persistence errors
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Record not found: {0}")]
    RecordNotFound(RecordKey),
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("Persistence backend error: {0}")]
    Backend(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// How the persisted column is re-read before comparing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadStrategy {
    /// Exclusive row lock held from read until write
    Lock,
    /// Unlocked re-read; a write landing between read and write is lost
    Refetch,
    /// No re-read; the attacher's own view is trusted
    Skip,
}

impl std::str::FromStr for ReloadStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lock" => Ok(ReloadStrategy::Lock),
            "refetch" => Ok(ReloadStrategy::Refetch),
            "skip" => Ok(ReloadStrategy::Skip),
            other => Err(format!("unknown reload strategy: {}", other)),
        }
    }
}

/// How the new column value is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStrategy {
    /// Write durably as part of the atomic operation
    Save,
    /// Only update the attacher; the caller saves the record later
    Skip,
}

/// Options of the atomic operations. Callers pick one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicOptions {
    pub reload: ReloadStrategy,
    pub persist: PersistStrategy,
}

impl AtomicOptions {
    pub fn new(reload: ReloadStrategy, persist: PersistStrategy) -> Self {
        Self { reload, persist }
    }

    /// Row lock + save. Safe against concurrent writers.
    pub fn locked() -> Self {
        Self::new(ReloadStrategy::Lock, PersistStrategy::Save)
    }

    /// Unlocked re-read + save. Detects changes made before the re-read
    /// only.
    pub fn optimistic() -> Self {
        Self::new(ReloadStrategy::Refetch, PersistStrategy::Save)
    }

    /// No re-read + save. Not race safe.
    pub fn unchecked() -> Self {
        Self::new(ReloadStrategy::Skip, PersistStrategy::Save)
    }

    pub fn without_persist(mut self) -> Self {
        self.persist = PersistStrategy::Skip;
        self
    }
}

/// A fresh view of one attachment column
#[async_trait]
pub trait RecordGuard: Send {
    /// Whether the record still exists
    fn exists(&self) -> bool;

    /// Column value at reload time
    fn data(&self) -> Option<&str>;

    /// Write `data` into the column and end the guard
    async fn write(self: Box<Self>, data: Option<String>) -> PersistenceResult<()>;

    /// End the guard without writing
    async fn release(self: Box<Self>) -> PersistenceResult<()>;
}

/// Storage of host records' attachment columns
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read a column. `None` means the record does not exist.
    async fn fetch(&self, key: &RecordKey, column: &str) -> PersistenceResult<Option<Option<String>>>;

    /// Write a column without any check
    async fn save(&self, key: &RecordKey, column: &str, data: Option<String>) -> PersistenceResult<()>;

    /// Re-read a column for compare-and-write. With `locked`, concurrent
    /// writers of the record block until the guard ends.
    async fn reload(
        &self,
        key: &RecordKey,
        column: &str,
        locked: bool,
    ) -> PersistenceResult<Box<dyn RecordGuard>>;
}

#[derive(Debug, Default)]
struct Row {
    deleted: bool,
    columns: HashMap<String, Option<String>>,
}

type SharedRow = Arc<AsyncMutex<Row>>;

/// In-memory record store.
///
/// Each row has its own async mutex; `Lock` reloads hold it across compare
/// and write.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    rows: Mutex<HashMap<RecordKey, SharedRow>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn row(&self, key: &RecordKey) -> PersistenceResult<Option<SharedRow>> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| PersistenceError::Backend("Lock poisoned".into()))?;
        Ok(rows.get(key).cloned())
    }

    /// Create an empty record (no-op when it exists)
    pub fn insert(&self, key: RecordKey) -> PersistenceResult<()> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| PersistenceError::Backend("Lock poisoned".into()))?;
        rows.entry(key).or_default();
        Ok(())
    }

    /// Delete a record, waiting for any guard holding its lock
    pub async fn delete(&self, key: &RecordKey) -> PersistenceResult<()> {
        let Some(row) = self.row(key)? else {
            return Err(PersistenceError::RecordNotFound(key.clone()));
        };

        let mut row = row.lock().await;
        row.deleted = true;
        row.columns.clear();
        drop(row);

        self.rows
            .lock()
            .map_err(|_| PersistenceError::Backend("Lock poisoned".into()))?
            .remove(key);
        debug!(record = %key, "Record deleted");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn fetch(&self, key: &RecordKey, column: &str) -> PersistenceResult<Option<Option<String>>> {
        let Some(row) = self.row(key)? else {
            return Ok(None);
        };
        let row = row.lock().await;
        if row.deleted {
            return Ok(None);
        }
        Ok(Some(row.columns.get(column).cloned().flatten()))
    }

    async fn save(&self, key: &RecordKey, column: &str, data: Option<String>) -> PersistenceResult<()> {
        let row = self
            .row(key)?
            .ok_or_else(|| PersistenceError::RecordNotFound(key.clone()))?;
        let mut row = row.lock().await;
        if row.deleted {
            return Err(PersistenceError::RecordNotFound(key.clone()));
        }
        row.columns.insert(column.to_string(), data);
        Ok(())
    }

    async fn reload(
        &self,
        key: &RecordKey,
        column: &str,
        locked: bool,
    ) -> PersistenceResult<Box<dyn RecordGuard>> {
        let Some(row) = self.row(key)? else {
            return Ok(Box::new(MissingGuard));
        };

        if locked {
            let guard = row.lock_owned().await;
            let data = guard.columns.get(column).cloned().flatten();
            return Ok(Box::new(LockedGuard {
                row: guard,
                key: key.clone(),
                column: column.to_string(),
                data,
            }));
        }

        let (exists, data) = {
            let current = row.lock().await;
            (!current.deleted, current.columns.get(column).cloned().flatten())
        };
        Ok(Box::new(SnapshotGuard {
            row,
            key: key.clone(),
            column: column.to_string(),
            exists,
            data,
        }))
    }
}

/// Guard of a record that does not exist
struct MissingGuard;

#[async_trait]
impl RecordGuard for MissingGuard {
    fn exists(&self) -> bool {
        false
    }

    fn data(&self) -> Option<&str> {
        None
    }

    async fn write(self: Box<Self>, _data: Option<String>) -> PersistenceResult<()> {
        Err(PersistenceError::Backend("record is missing".into()))
    }

    async fn release(self: Box<Self>) -> PersistenceResult<()> {
        Ok(())
    }
}

struct LockedGuard {
    row: OwnedMutexGuard<Row>,
    key: RecordKey,
    column: String,
    data: Option<String>,
}

#[async_trait]
impl RecordGuard for LockedGuard {
    fn exists(&self) -> bool {
        !self.row.deleted
    }

    fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    async fn write(mut self: Box<Self>, data: Option<String>) -> PersistenceResult<()> {
        if self.row.deleted {
            return Err(PersistenceError::RecordNotFound(self.key.clone()));
        }
        let column = std::mem::take(&mut self.column);
        self.row.columns.insert(column, data);
        Ok(())
    }

    async fn release(self: Box<Self>) -> PersistenceResult<()> {
        Ok(())
    }
}

struct SnapshotGuard {
    row: SharedRow,
    key: RecordKey,
    column: String,
    exists: bool,
    data: Option<String>,
}

#[async_trait]
impl RecordGuard for SnapshotGuard {
    fn exists(&self) -> bool {
        self.exists
    }

    fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    async fn write(self: Box<Self>, data: Option<String>) -> PersistenceResult<()> {
        let mut row = self.row.lock().await;
        if row.deleted {
            return Err(PersistenceError::RecordNotFound(self.key.clone()));
        }
        row.columns.insert(self.column.clone(), data);
        Ok(())
    }

    async fn release(self: Box<Self>) -> PersistenceResult<()> {
        Ok(())
    }
}
