//! Location (id) generation for uploaded files

use att_core::RecordKey;
use uuid::Uuid;

/// Record context used to build readable locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationContext {
    pub record: RecordKey,
    pub name: String,
}

impl LocationContext {
    pub fn new(record: RecordKey, name: impl Into<String>) -> Self {
        Self {
            record,
            name: name.into(),
        }
    }
}

/// Generate a unique storage location.
///
/// Without a context the location is `<32 hex chars>[.<ext>]`. With one it
/// is nested as `<record_class>/<record_id>/<name>/<hex>[.<ext>]`, with the
/// class lowercased.
pub fn generate_location(extension: Option<&str>, context: Option<&LocationContext>) -> String {
    let basename = match extension.map(|e| e.trim_start_matches('.')) {
        Some(ext) if !ext.is_empty() => {
            format!("{}.{}", Uuid::new_v4().simple(), ext.to_ascii_lowercase())
        }
        _ => Uuid::new_v4().simple().to_string(),
    };

    match context {
        Some(ctx) => format!(
            "{}/{}/{}/{}",
            ctx.record.record_class.to_ascii_lowercase(),
            ctx.record.record_id,
            ctx.name,
            basename
        ),
        None => basename,
    }
}
