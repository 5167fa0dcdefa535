//! Resume queries against Loki's query API.
//!
//! Loki is the system of record for what has been shipped: before a run the
//! caller asks whether a log file is already there, or which file was shipped
//! last, and skips accordingly. Both queries are read-only GETs against
//! `/loki/api/v1/query_range`.
//!
//! Selectors and line filters are built by plain string concatenation, the
//! same way label sets are, so identifiers containing `"` produce an invalid
//! query.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{PayloadFormatError, QueryError, Result};

/// Field of the embedded JSON payload holding the source file name.
const FILENAME_FIELD: &str = "Filename";

/// Top-level query API response.
///
/// Everything defaults, so a body of `{}` decodes to an empty result.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QueryResponse {
    data: Option<QueryData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QueryData {
    result: Vec<StreamResult>,
    stats: QueryStats,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StreamResult {
    /// `[timestamp_ns, line]` pairs.
    values: Vec<(String, String)>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QueryStats {
    ingester: IngesterStats,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct IngesterStats {
    total_chunks_matched: u64,
}

/// Read-only queries used to resume shipping without duplicates.
#[derive(Debug, Clone)]
pub struct ResumeQuery {
    http: reqwest::Client,
    url: String,
    selector: String,
    lookback: Duration,
}

impl ResumeQuery {
    /// Creates a query client for the backend in `config`.
    ///
    /// The configured base label set doubles as the stream selector for
    /// [`is_log_in_loki`](Self::is_log_in_loki).
    pub fn new(http: reqwest::Client, config: &ClientConfig) -> Self {
        Self {
            http,
            url: config.query_url(),
            selector: config.labels.clone(),
            lookback: config.query_lookback,
        }
    }

    /// Returns `true` if any ingested line mentions `identifier`.
    ///
    /// Runs `{base labels} |= "identifier"` over the lookback window and
    /// checks the ingester's matched-chunk counter.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] on transport failure, a non-2xx status or an
    /// undecodable body.
    pub async fn is_log_in_loki(&self, identifier: &str) -> Result<bool> {
        let query = format!("{} |= \"{identifier}\"", self.selector);
        let response = self.query(&query, "forward").await?;

        let matched = response
            .data
            .map_or(0, |data| data.stats.ingester.total_chunks_matched);
        debug!(identifier, chunks = matched, "Checked for ingested log");
        Ok(matched > 0)
    }

    /// Returns the `Filename` recorded in the newest line matching `selector`.
    ///
    /// Returns an empty string when nothing matches.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] on transport failure, a non-2xx status or an
    /// undecodable body, and [`PayloadFormatError`] if the newest line carries
    /// no JSON object with a string `Filename`.
    pub async fn get_latest_log(&self, selector: &str) -> Result<String> {
        let response = self.query(selector, "backward").await?;

        let Some(line) = response.data.as_ref().and_then(latest_line) else {
            debug!(selector, "No previously ingested log found");
            return Ok(String::new());
        };

        let filename = extract_field(line, FILENAME_FIELD)?;
        debug!(selector, filename = %filename, "Found latest ingested log");
        Ok(filename)
    }

    async fn query(
        &self,
        query: &str,
        direction: &str,
    ) -> std::result::Result<QueryResponse, QueryError> {
        let start = lookback_start(Utc::now(), self.lookback).to_rfc3339();
        let resp = self
            .http
            .get(&self.url)
            .query(&[
                ("query", query),
                ("limit", "1"),
                ("direction", direction),
                ("start", start.as_str()),
            ])
            .send()
            .await
            .map_err(|source| {
                if source.is_builder() {
                    QueryError::InvalidUrl {
                        url: self.url.clone(),
                        source,
                    }
                } else {
                    QueryError::Transport { source }
                }
            })?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|source| QueryError::Transport { source })?;
        if !status.is_success() {
            return Err(QueryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|source| QueryError::Decode { source })
    }
}

fn lookback_start(now: DateTime<Utc>, lookback: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(lookback)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// The line with the greatest timestamp across all streams.
///
/// On equal timestamps the one returned last by the backend wins.
fn latest_line(data: &QueryData) -> Option<&str> {
    data.result
        .iter()
        .flat_map(|stream| stream.values.iter())
        .max_by(|a, b| compare_timestamps(&a.0, &b.0))
        .map(|(_, line)| line.as_str())
}

/// Compares nanosecond timestamps numerically, falling back to text order.
fn compare_timestamps(a: &str, b: &str) -> Ordering {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Pulls a string field out of the first JSON object embedded in `line`.
///
/// Anything before the first `{` (a log level prefix, say) and after the
/// object is ignored.
fn extract_field(line: &str, field: &'static str) -> std::result::Result<String, PayloadFormatError> {
    let fail = |reason: String| PayloadFormatError {
        field,
        line: line.to_string(),
        reason,
    };

    let start = line
        .find('{')
        .ok_or_else(|| fail("no JSON object found".to_string()))?;

    let value = serde_json::Deserializer::from_str(&line[start..])
        .into_iter::<serde_json::Value>()
        .next()
        .ok_or_else(|| fail("no JSON object found".to_string()))?
        .map_err(|e| fail(e.to_string()))?;

    value
        .get(field)
        .and_then(serde_json::Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| fail("field missing or not a string".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_field_with_prefix() {
        let line = r#"Info: { "Filename": "bogus-testfile"}"#;
        assert_eq!(extract_field(line, "Filename").unwrap(), "bogus-testfile");
    }

    #[test]
    fn test_extract_field_trailing_text() {
        let line = r#"{"Filename":"f1","Status":"200"} trailing"#;
        assert_eq!(extract_field(line, "Filename").unwrap(), "f1");
    }

    #[test]
    fn test_extract_field_errors() {
        assert!(extract_field("plain text", "Filename").is_err());
        assert!(extract_field("{ not json", "Filename").is_err());
        assert!(extract_field(r#"{"Other":"x"}"#, "Filename").is_err());
        assert!(extract_field(r#"{"Filename":7}"#, "Filename").is_err());
    }

    #[test]
    fn test_latest_line_picks_newest_across_streams() {
        let data: QueryData = serde_json::from_str(
            r#"{"result":[
                {"values":[["1000","old"],["900","older"]]},
                {"values":[["2000","newest"]]},
                {"values":[["1500","middle"]]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(latest_line(&data), Some("newest"));
    }

    #[test]
    fn test_latest_line_numeric_not_lexical() {
        let data: QueryData =
            serde_json::from_str(r#"{"result":[{"values":[["999","a"],["1000","b"]]}]}"#).unwrap();
        assert_eq!(latest_line(&data), Some("b"));
    }

    #[test]
    fn test_latest_line_empty() {
        assert_eq!(latest_line(&QueryData::default()), None);
    }

    #[test]
    fn test_decode_empty_body() {
        let response: QueryResponse = serde_json::from_str("{}").unwrap();
        assert!(response.data.is_none());
    }

    #[test]
    fn test_decode_stats() {
        let response: QueryResponse = serde_json::from_str(
            r#"{"data":{"stats": {"ingester":{"totalChunksMatched":3}}}}"#,
        )
        .unwrap();
        assert_eq!(response.data.unwrap().stats.ingester.total_chunks_matched, 3);
    }

    #[test]
    fn test_lookback_start() {
        let now = DateTime::parse_from_rfc3339("2021-01-08T11:50:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let start = lookback_start(now, Duration::from_secs(3600));
        assert_eq!(start.to_rfc3339(), "2021-01-08T10:50:00+00:00");

        assert_eq!(
            lookback_start(now, Duration::from_secs(u64::MAX)),
            DateTime::<Utc>::UNIX_EPOCH
        );
    }
}
