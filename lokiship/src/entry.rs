//! Entry construction from parsed records.

use chrono::{DateTime, Utc};

use crate::error::EncodeError;
use crate::labels::LabelBuilder;
use crate::record::LogRecord;

/// A single timestamped log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// When the logged request happened.
    pub timestamp: DateTime<Utc>,
    /// The already serialized line, usually JSON.
    pub line: String,
}

/// An [`Entry`] together with the label set of the stream it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledEntry {
    /// The entry itself.
    pub entry: Entry,
    /// Canonical label set string.
    pub labels: String,
}

/// Turns records into [`LabeledEntry`] values.
#[derive(Debug, Clone)]
pub struct EntryEncoder {
    labels: LabelBuilder,
}

impl EntryEncoder {
    /// Creates an encoder using `labels` to compute each entry's label set.
    pub fn new(labels: LabelBuilder) -> Self {
        Self { labels }
    }

    /// Builds the labeled entry for `record` carrying `payload` as its line.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::TimestampParse`] if the record's date and time
    /// do not form an RFC 3339 timestamp.
    pub fn encode(&self, record: &LogRecord, payload: String) -> Result<LabeledEntry, EncodeError> {
        let timestamp = parse_timestamp(&record.date, &record.time)?;
        Ok(LabeledEntry {
            entry: Entry {
                timestamp,
                line: payload,
            },
            labels: self.labels.new_labels(record),
        })
    }
}

/// Parses a `YYYY-MM-DD` date and `HH:MM:SS` time as a UTC timestamp.
///
/// The two are joined as `{date}T{time}Z` and parsed as RFC 3339, so
/// fractional seconds in `time` are accepted.
///
/// # Errors
///
/// Returns [`EncodeError::TimestampParse`] if the joined string does not parse.
pub fn parse_timestamp(date: &str, time: &str) -> Result<DateTime<Utc>, EncodeError> {
    let value = format!("{date}T{time}Z");
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|source| EncodeError::TimestampParse { value, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn encoder() -> EntryEncoder {
        EntryEncoder::new(LabelBuilder::new(
            r#"{job="test"}"#,
            &["Filename".to_string()],
        ))
    }

    #[test]
    fn test_parse_timestamp() {
        let ts = parse_timestamp("2021-01-08", "11:50:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2021, 1, 8, 11, 50, 0).unwrap());
    }

    #[test]
    fn test_parse_timestamp_fractional() {
        let ts = parse_timestamp("2021-01-08", "11:50:00.250").unwrap();
        assert_eq!(ts.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_parse_timestamp_invalid() {
        let err = parse_timestamp("2021-13-08", "11:50:00").unwrap_err();
        match err {
            EncodeError::TimestampParse { value, .. } => {
                assert_eq!(value, "2021-13-08T11:50:00Z");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(parse_timestamp("", "").is_err());
        assert!(parse_timestamp("2021-01-08", "noon").is_err());
    }

    #[test]
    fn test_encode() {
        let record = LogRecord::new("2021-01-08", "11:50:00", "testfilename");
        let labeled = encoder()
            .encode(&record, r#"{"key":"value"}"#.to_string())
            .unwrap();

        assert_eq!(labeled.labels, r#"{job="test",Filename="testfilename"}"#);
        assert_eq!(labeled.entry.line, r#"{"key":"value"}"#);
        assert_eq!(
            labeled.entry.timestamp,
            Utc.with_ymd_and_hms(2021, 1, 8, 11, 50, 0).unwrap()
        );
    }

    #[test]
    fn test_encode_bad_timestamp() {
        let record = LogRecord::new("yesterday", "11:50:00", "f");
        assert!(encoder().encode(&record, String::new()).is_err());
    }
}
