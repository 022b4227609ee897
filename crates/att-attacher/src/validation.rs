//! Validation rules over uploaded file metadata
//!
//! Rules only look at metadata captured at upload time; validating never
//! touches a storage. Every rule runs, so the result lists all failures in
//! rule order.

use std::sync::Arc;

use crate::file::UploadedFile;

type Check = Arc<dyn Fn(&UploadedFile) -> Option<String> + Send + Sync>;

#[derive(Clone)]
struct Rule {
    name: String,
    check: Check,
}

/// Ordered list of validation rules
#[derive(Clone, Default)]
pub struct Validator {
    rules: Vec<Rule>,
}

const FILESIZE_UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

/// Human readable size with decimal units, e.g. `1.0 KB` for 1000 bytes
pub fn pretty_filesize(bytes: u64) -> String {
    let mut exp = 0;
    let mut scaled = bytes;
    while scaled >= 1000 && exp < FILESIZE_UNITS.len() - 1 {
        scaled /= 1000;
        exp += 1;
    }
    let mut value = bytes as f64 / 1000f64.powi(exp as i32);
    // 999_999 bytes rounds to 1000.0 KB; show 1.0 MB instead
    if (value * 10.0).round() >= 10_000.0 && exp < FILESIZE_UNITS.len() - 1 {
        value /= 1000.0;
        exp += 1;
    }
    format!("{:.1} {}", value, FILESIZE_UNITS[exp])
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a custom rule; returning `Some(message)` marks a failure
    pub fn rule<F>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&UploadedFile) -> Option<String> + Send + Sync + 'static,
    {
        self.rules.push(Rule {
            name: name.into(),
            check: Arc::new(check),
        });
        self
    }

    pub fn max_size(self, max: u64) -> Self {
        self.rule("max_size", move |file| {
            file.size()
                .filter(|size| *size > max)
                .map(|_| format!("size must not be greater than {}", pretty_filesize(max)))
        })
    }

    pub fn min_size(self, min: u64) -> Self {
        self.rule("min_size", move |file| {
            file.size()
                .filter(|size| *size < min)
                .map(|_| format!("size must not be less than {}", pretty_filesize(min)))
        })
    }

    pub fn max_width(self, max: u64) -> Self {
        self.rule("max_width", move |file| {
            file.width()
                .filter(|w| *w > max)
                .map(|_| format!("width must not be greater than {}px", max))
        })
    }

    pub fn min_width(self, min: u64) -> Self {
        self.rule("min_width", move |file| {
            file.width()
                .filter(|w| *w < min)
                .map(|_| format!("width must not be less than {}px", min))
        })
    }

    pub fn max_height(self, max: u64) -> Self {
        self.rule("max_height", move |file| {
            file.height()
                .filter(|h| *h > max)
                .map(|_| format!("height must not be greater than {}px", max))
        })
    }

    pub fn min_height(self, min: u64) -> Self {
        self.rule("min_height", move |file| {
            file.height()
                .filter(|h| *h < min)
                .map(|_| format!("height must not be less than {}px", min))
        })
    }

    pub fn max_dimensions(self, width: u64, height: u64) -> Self {
        self.rule("max_dimensions", move |file| match (file.width(), file.height()) {
            (Some(w), Some(h)) if w > width || h > height => Some(format!(
                "dimensions must not be greater than {}x{}",
                width, height
            )),
            _ => None,
        })
    }

    pub fn mime_type_inclusion(self, types: &[&str]) -> Self {
        let types: Vec<String> = types.iter().map(|t| t.to_string()).collect();
        self.rule("mime_type_inclusion", move |file| match file.mime_type() {
            Some(mime) if !types.iter().any(|t| t == mime) => {
                Some(format!("type must be one of: {}", types.join(", ")))
            }
            _ => None,
        })
    }

    pub fn mime_type_exclusion(self, types: &[&str]) -> Self {
        let types: Vec<String> = types.iter().map(|t| t.to_string()).collect();
        self.rule("mime_type_exclusion", move |file| match file.mime_type() {
            Some(mime) if types.iter().any(|t| t == mime) => {
                Some(format!("type must not be one of: {}", types.join(", ")))
            }
            _ => None,
        })
    }

    pub fn extension_inclusion(self, extensions: &[&str]) -> Self {
        let extensions: Vec<String> = extensions.iter().map(|e| e.to_ascii_lowercase()).collect();
        self.rule("extension_inclusion", move |file| match file.extension() {
            Some(ext) if !extensions.contains(&ext) => {
                Some(format!("extension must be one of: {}", extensions.join(", ")))
            }
            _ => None,
        })
    }

    pub fn extension_exclusion(self, extensions: &[&str]) -> Self {
        let extensions: Vec<String> = extensions.iter().map(|e| e.to_ascii_lowercase()).collect();
        self.rule("extension_exclusion", move |file| match file.extension() {
            Some(ext) if extensions.contains(&ext) => {
                Some(format!("extension must not be one of: {}", extensions.join(", ")))
            }
            _ => None,
        })
    }

    /// Run every rule against `file`
    pub fn validate(&self, file: &UploadedFile) -> Vec<String> {
        self.rules
            .iter()
            .filter_map(|rule| (rule.check)(file))
            .collect()
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("rules", &self.rule_names())
            .finish()
    }
}
