//! Identifiers shared across crates

use serde::{Deserialize, Serialize};

/// Primary key type of host records
pub type Id = i64;

/// Identifies one row of the host application.
///
/// `record_class` is the logical model name (mapped to a table by the
/// database layer), `record_id` its primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub record_class: String,
    pub record_id: Id,
}

impl RecordKey {
    pub fn new(record_class: impl Into<String>, record_id: Id) -> Self {
        Self {
            record_class: record_class.into(),
            record_id,
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.record_class, self.record_id)
    }
}
