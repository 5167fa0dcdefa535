//! Label set construction.
//!
//! Label sets are carried as Loki's canonical selector string,
//! `{k1="v1",k2="v2"}`, so that identical sets compare equal as plain strings
//! when entries are grouped into streams. Values are inserted verbatim: a
//! value containing `"` produces a label set the backend will reject.

use crate::record::LogRecord;

/// Merges the configured base label set with per-record fields.
#[derive(Debug, Clone)]
pub struct LabelBuilder {
    /// Base labels without the closing brace, e.g. `{k1="v1"`.
    prefix: String,
    /// Whether the base set already holds at least one label.
    has_base: bool,
    add_fields: Vec<String>,
}

impl LabelBuilder {
    /// Creates a builder from a `{...}` base label string and the ordered
    /// list of record fields to promote.
    ///
    /// The base string is expected to have passed
    /// [`ClientConfig::validate`](crate::config::ClientConfig::validate).
    pub fn new(base: &str, add_fields: &[String]) -> Self {
        let prefix = base.trim().strip_suffix('}').unwrap_or(base).to_string();
        let has_base = !prefix.trim_start_matches('{').trim().is_empty();
        Self {
            prefix,
            has_base,
            add_fields: add_fields.to_vec(),
        }
    }

    /// Returns the label set for `record`.
    ///
    /// Fields missing from the record are skipped.
    pub fn new_labels(&self, record: &LogRecord) -> String {
        let mut labels = self.prefix.clone();
        let mut first = !self.has_base;

        for name in &self.add_fields {
            if let Some(value) = record.get(name) {
                if !first {
                    labels.push(',');
                }
                first = false;
                labels.push_str(name);
                labels.push_str("=\"");
                labels.push_str(value);
                labels.push('"');
            }
        }

        labels.push('}');
        labels
    }
}
