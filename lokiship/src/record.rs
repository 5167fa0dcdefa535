//! The parsed log record handed to the client by its caller.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One pre-parsed access-log record.
///
/// `Date`, `Time` and `Filename` are always present; anything else the
/// upstream parser produced lives in `fields`. The JSON form is a flat object
/// using the same key names, which is also the line payload sent by
/// [`Client::push_logs`](crate::client::Client::push_logs).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Request date, `YYYY-MM-DD`.
    #[serde(rename = "Date")]
    pub date: String,
    /// Request time, `HH:MM:SS` (UTC).
    #[serde(rename = "Time")]
    pub time: String,
    /// Name of the log file the record was read from.
    #[serde(rename = "Filename")]
    pub filename: String,
    /// Remaining named fields.
    #[serde(flatten)]
    pub fields: BTreeMap<String, String>,
}

impl LogRecord {
    /// Creates a record without additional fields.
    pub fn new(
        date: impl Into<String>,
        time: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            date: date.into(),
            time: time.into(),
            filename: filename.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Adds an additional named field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Looks up a field by the name used in label configuration.
    pub fn get(&self, name: &str) -> Option<&str> {
        match name {
            "Date" => Some(&self.date),
            "Time" => Some(&self.time),
            "Filename" => Some(&self.filename),
            other => self.fields.get(other).map(String::as_str),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_known_and_extra_fields() {
        let record = LogRecord::new("2021-01-08", "11:50:00", "testfilename")
            .with_field("EdgeResultType", "Hit");

        assert_eq!(record.get("Date"), Some("2021-01-08"));
        assert_eq!(record.get("Time"), Some("11:50:00"));
        assert_eq!(record.get("Filename"), Some("testfilename"));
        assert_eq!(record.get("EdgeResultType"), Some("Hit"));
        assert_eq!(record.get("Missing"), None);
    }

    #[test]
    fn test_json_shape() {
        let record = LogRecord::new("2021-01-08", "11:50:00", "f1").with_field("Status", "200");
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"Date":"2021-01-08","Time":"11:50:00","Filename":"f1","Status":"200"}"#
        );

        let back: LogRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
