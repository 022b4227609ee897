//! Attachment columns stored in PostgreSQL tables
//!
//! Every record class maps to a table with a bigint `id` primary key. The
//! attachment column holds the serialized file as text.

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use att_attacher::{PersistenceError, PersistenceResult, RecordGuard, RecordStore};
use att_core::RecordKey;
use regex::Regex;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use crate::error::{DbError, DbResult};

static IDENTIFIER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Accept only plain SQL identifiers; they are interpolated into queries
pub fn validate_identifier(name: &str) -> DbResult<&str> {
    if IDENTIFIER_PATTERN.is_match(name) && name.len() <= 63 {
        Ok(name)
    } else {
        Err(DbError::InvalidIdentifier(name.to_string()))
    }
}

/// Default table of a record class: `BlogPost` -> `blog_posts`
pub fn tableize(record_class: &str) -> String {
    let mut table = String::with_capacity(record_class.len() + 4);
    for (i, c) in record_class.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                table.push('_');
            }
            table.push(c.to_ascii_lowercase());
        } else {
            table.push(c);
        }
    }
    table.push('s');
    table
}

fn select_sql(table: &str, column: &str, lock: bool) -> String {
    let mut sql = format!(r#"SELECT "{}" FROM "{}" WHERE id = $1"#, column, table);
    if lock {
        sql.push_str(" FOR UPDATE");
    }
    sql
}

fn update_sql(table: &str, column: &str) -> String {
    format!(r#"UPDATE "{}" SET "{}" = $2 WHERE id = $1"#, table, column)
}

/// `RecordStore` on a PostgreSQL pool
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
    tables: HashMap<String, String>,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tables: HashMap::new(),
        }
    }

    /// Map a record class to a table other than its default
    pub fn table(mut self, record_class: impl Into<String>, table: &str) -> DbResult<Self> {
        let table = validate_identifier(table)?.to_string();
        self.tables.insert(record_class.into(), table);
        Ok(self)
    }

    pub fn table_for(&self, record_class: &str) -> DbResult<String> {
        match self.tables.get(record_class) {
            Some(table) => Ok(table.clone()),
            None => {
                let table = tableize(record_class);
                validate_identifier(&table)?;
                Ok(table)
            }
        }
    }

    fn statements(&self, key: &RecordKey, column: &str) -> DbResult<(String, String)> {
        let table = self.table_for(&key.record_class)?;
        let column = validate_identifier(column)?;
        Ok((table, column.to_string()))
    }
}

fn backend(err: sqlx::Error) -> PersistenceError {
    DbError::from(err).into()
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn fetch(&self, key: &RecordKey, column: &str) -> PersistenceResult<Option<Option<String>>> {
        let (table, column) = self.statements(key, column)?;
        let row = sqlx::query_as::<_, (Option<String>,)>(&select_sql(&table, &column, false))
            .bind(key.record_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(|(data,)| data))
    }

    async fn save(&self, key: &RecordKey, column: &str, data: Option<String>) -> PersistenceResult<()> {
        let (table, column) = self.statements(key, column)?;
        let result = sqlx::query(&update_sql(&table, &column))
            .bind(key.record_id)
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::RecordNotFound(key.clone()));
        }
        Ok(())
    }

    async fn reload(
        &self,
        key: &RecordKey,
        column: &str,
        locked: bool,
    ) -> PersistenceResult<Box<dyn RecordGuard>> {
        let (table, column) = self.statements(key, column)?;
        let select = select_sql(&table, &column, locked);
        let update = update_sql(&table, &column);

        if !locked {
            let row = sqlx::query_as::<_, (Option<String>,)>(&select)
                .bind(key.record_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
            return Ok(Box::new(SnapshotRow {
                pool: self.pool.clone(),
                key: key.clone(),
                update,
                exists: row.is_some(),
                data: row.and_then(|(data,)| data),
            }));
        }

        let mut tx = self.pool.begin().await.map_err(backend)?;
        let row = sqlx::query_as::<_, (Option<String>,)>(&select)
            .bind(key.record_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        debug!(record = %key, column = %column, "Row locked");

        Ok(Box::new(LockedRow {
            tx,
            key: key.clone(),
            update,
            exists: row.is_some(),
            data: row.and_then(|(data,)| data),
        }))
    }
}

/// Row read `FOR UPDATE` inside an open transaction
struct LockedRow {
    tx: Transaction<'static, Postgres>,
    key: RecordKey,
    update: String,
    exists: bool,
    data: Option<String>,
}

#[async_trait]
impl RecordGuard for LockedRow {
    fn exists(&self) -> bool {
        self.exists
    }

    fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    async fn write(self: Box<Self>, data: Option<String>) -> PersistenceResult<()> {
        let LockedRow {
            mut tx, key, update, ..
        } = *self;

        let result = sqlx::query(&update)
            .bind(key.record_id)
            .bind(data)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(backend)?;
            return Err(PersistenceError::RecordNotFound(key));
        }

        tx.commit().await.map_err(backend)?;
        debug!(record = %key, "Row updated and unlocked");
        Ok(())
    }

    async fn release(self: Box<Self>) -> PersistenceResult<()> {
        let row = *self;
        row.tx.rollback().await.map_err(backend)
    }
}

/// Row read without a lock
struct SnapshotRow {
    pool: PgPool,
    key: RecordKey,
    update: String,
    exists: bool,
    data: Option<String>,
}

#[async_trait]
impl RecordGuard for SnapshotRow {
    fn exists(&self) -> bool {
        self.exists
    }

    fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    async fn write(self: Box<Self>, data: Option<String>) -> PersistenceResult<()> {
        let result = sqlx::query(&self.update)
            .bind(self.key.record_id)
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::RecordNotFound(self.key.clone()));
        }
        Ok(())
    }

    async fn release(self: Box<Self>) -> PersistenceResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        for name in ["photos", "image_data", "_private", "Avatar2"] {
            assert!(validate_identifier(name).is_ok(), "rejected {}", name);
        }
        for name in ["", "1photos", "photos; DROP TABLE users", "a\"b", "img-data", "x.y"] {
            assert!(
                matches!(validate_identifier(name), Err(DbError::InvalidIdentifier(_))),
                "accepted {}",
                name
            );
        }
        assert!(validate_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_tableize() {
        assert_eq!(tableize("Photo"), "photos");
        assert_eq!(tableize("BlogPost"), "blog_posts");
        assert_eq!(tableize("user_profile"), "user_profiles");
    }

    #[test]
    fn test_sql() {
        assert_eq!(
            select_sql("photos", "image_data", true),
            r#"SELECT "image_data" FROM "photos" WHERE id = $1 FOR UPDATE"#
        );
        assert_eq!(
            select_sql("photos", "image_data", false),
            r#"SELECT "image_data" FROM "photos" WHERE id = $1"#
        );
        assert_eq!(
            update_sql("photos", "image_data"),
            r#"UPDATE "photos" SET "image_data" = $2 WHERE id = $1"#
        );
    }

    #[tokio::test]
    async fn test_table_mapping() {
        let pool = PgPool::connect_lazy("postgres://localhost/attache_test").unwrap();
        let store = PgRecordStore::new(pool).table("Photo", "gallery_photos").unwrap();

        assert_eq!(store.table_for("Photo").unwrap(), "gallery_photos");
        assert_eq!(store.table_for("Document").unwrap(), "documents");
        assert!(store.table_for("Bad Class").is_err());
        assert!(store.clone().table("Photo", "photos; --").is_err());
    }

    #[tokio::test]
    async fn test_rejects_invalid_column_before_querying() {
        let pool = PgPool::connect_lazy("postgres://localhost/attache_test").unwrap();
        let store = PgRecordStore::new(pool);

        let result = store
            .fetch(&RecordKey::new("Photo", 1), "image_data\"; --")
            .await;
        assert!(matches!(result, Err(PersistenceError::InvalidIdentifier(_))));
    }
}
