//! # att-storage
//!
//! Storage backends for Attache.
//!
//! ## Features
//!
//! - `Storage` trait: upload, open, exists, delete, url
//! - In-memory storage for tests and development
//! - Local filesystem storage with cache expiry
//! - Retrying decorator for flaky backends
//! - Registry mapping role names (`cache`, `store`) to backends
//!
//! ## Example
//!
//! ```rust,ignore
//! use att_storage::{MemoryStorage, StorageRegistry};
//! use std::sync::Arc;
//!
//! let storages = StorageRegistry::new()
//!     .with("cache", Arc::new(MemoryStorage::new()))
//!     .with("store", Arc::new(MemoryStorage::new()));
//!
//! storages.get("cache")?.upload("abc.jpg", bytes::Bytes::from_static(b"...")).await?;
//! ```

pub mod filesystem;
pub mod location;
pub mod memory;
pub mod registry;
pub mod retry;
pub mod storage;

pub use filesystem::FileSystemStorage;
pub use location::{generate_location, LocationContext};
pub use memory::MemoryStorage;
pub use registry::StorageRegistry;
pub use retry::RetryStorage;
pub use storage::{Storage, StorageError, StorageResult};
