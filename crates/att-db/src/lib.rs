//! # att-db
//!
//! PostgreSQL persistence for Attache.
//!
//! - Connection pool management
//! - `PgRecordStore`: attachment columns of host tables, with row locking
//!   for atomic promotion
//!
//! ## Example
//!
//! ```ignore
//! use att_db::{Database, PgRecordStore};
//!
//! let db = Database::connect(&config.database).await?;
//! let records = PgRecordStore::new(db.pool().clone()).table("Photo", "photos")?;
//! ```

pub mod error;
pub mod pool;
pub mod record_store;

pub use error::{DbError, DbResult};
pub use pool::Database;
pub use record_store::{tableize, validate_identifier, PgRecordStore};
