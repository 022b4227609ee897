//! Database error types

use att_attacher::PersistenceError;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}

pub type DbResult<T> = Result<T, DbError>;

impl From<DbError> for PersistenceError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::InvalidIdentifier(name) => PersistenceError::InvalidIdentifier(name),
            DbError::Database(e) => PersistenceError::Backend(e.to_string()),
        }
    }
}
