//! Error types for the lokiship ingestion client.

use std::time::Duration;

use thiserror::Error;

/// The main error type for all lokiship operations.
///
/// Each stage of the pipeline has its own error enum; this type wraps them so
/// callers that do not care about the stage can use a single `Result`.
#[derive(Error, Debug)]
pub enum LokiError {
    /// The client configuration is invalid.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// A record could not be turned into an entry.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// A batch could not be delivered to the push endpoint.
    #[error("push error: {0}")]
    Push(#[from] PushError),

    /// A query against the backend failed.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// A query result was found but its payload could not be interpreted.
    #[error("payload format error: {0}")]
    PayloadFormat(#[from] PayloadFormatError),

    /// The client is no longer accepting work.
    #[error("client error: {0}")]
    Client(#[from] ClientError),
}

/// Errors raised while validating a [`ClientConfig`](crate::config::ClientConfig).
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// No backend address was given.
    #[error("backend address must not be empty")]
    EmptyAddress,

    /// Batch size must be at least one entry.
    #[error("invalid batch_size: {size} (must be > 0)")]
    InvalidBatchSize {
        /// The rejected batch size.
        size: usize,
    },

    /// A duration setting is zero.
    #[error("{field} must be greater than zero")]
    ZeroDuration {
        /// Name of the offending field.
        field: &'static str,
    },

    /// The base label set is not a `{...}` delimited string.
    #[error("invalid base label set '{labels}': must be enclosed in braces")]
    InvalidLabels {
        /// The rejected label string.
        labels: String,
    },

    /// An additional field name is empty.
    #[error("additional field names must not be empty")]
    EmptyFieldName,

    /// The queue cannot hold a full batch.
    #[error("queue_capacity {capacity} is smaller than batch_size {batch_size}")]
    QueueTooSmall {
        /// Configured queue capacity.
        capacity: usize,
        /// Configured batch size.
        batch_size: usize,
    },

    /// The queue capacity is beyond what the channel can allocate.
    #[error("queue_capacity {capacity} exceeds the maximum of {max}")]
    QueueTooLarge {
        /// Configured queue capacity.
        capacity: usize,
        /// Largest accepted capacity.
        max: usize,
    },

    /// The flush interval cannot be scheduled from the current instant.
    #[error("batch_wait {batch_wait:?} is too long to schedule")]
    BatchWaitTooLong {
        /// Configured flush interval.
        batch_wait: Duration,
    },

    /// The initial retry backoff exceeds the backoff cap.
    #[error("retry_backoff must not exceed max_backoff")]
    BackoffExceedsCap,
}

/// Errors that can occur while building an entry from a record.
#[derive(Error, Debug)]
pub enum EncodeError {
    /// The record's date and time do not form a valid timestamp.
    #[error("failed to parse timestamp '{value}': {source}")]
    TimestampParse {
        /// The combined date/time string that failed to parse.
        value: String,
        /// The underlying chrono error.
        #[source]
        source: chrono::ParseError,
    },

    /// The record could not be serialized into a JSON payload.
    #[error("failed to serialize record payload: {source}")]
    Payload {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors that can occur while pushing a batch to Loki.
#[derive(Error, Debug)]
pub enum PushError {
    /// Failed to serialize the `PushRequest` to protobuf.
    #[error("failed to serialize push request: {source}")]
    Serialization {
        /// The protobuf encoding error.
        #[source]
        source: prost::EncodeError,
    },

    /// Failed to compress data with Snappy.
    #[error("failed to compress data: {source}")]
    Compression {
        /// The snappy compression error.
        #[source]
        source: snap::Error,
    },

    /// Failed to create HTTP client.
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The request never got a response (connection refused, timeout, ...).
    #[error("HTTP request failed: {source}")]
    Transport {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// Server returned a non-2xx status.
    #[error("push rejected with status {status}: {body}")]
    Rejected {
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },
}

impl PushError {
    /// Returns `true` if sending the same batch again could succeed.
    ///
    /// Transport failures, `429 Too Many Requests` and server errors are
    /// transient. Any other rejection means the batch itself is unacceptable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
            Self::Serialization { .. } | Self::Compression { .. } | Self::ClientCreate { .. } => {
                false
            }
        }
    }
}

/// Errors that can occur when querying the backend.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The query URL could not be built from the configured address.
    #[error("invalid query URL '{url}': {source}")]
    InvalidUrl {
        /// The URL that failed to parse.
        url: String,
        /// The underlying parse error.
        #[source]
        source: reqwest::Error,
    },

    /// The request never got a response.
    #[error("query request failed: {source}")]
    Transport {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// Server returned a non-2xx status.
    #[error("query returned status {status}: {body}")]
    Status {
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },

    /// The response body is not the JSON document we expect.
    #[error("failed to decode query response: {source}")]
    Decode {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// A query result exists but the log line does not carry the expected field.
#[derive(Error, Debug)]
#[error("cannot extract '{field}' from log line '{line}': {reason}")]
pub struct PayloadFormatError {
    /// The field we were looking for.
    pub field: &'static str,
    /// The log line as returned by the backend.
    pub line: String,
    /// What went wrong.
    pub reason: String,
}

/// Errors raised by the client handle itself.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The flush task has stopped; no more entries are accepted.
    #[error("client is shut down")]
    Closed,

    /// Some records in a bulk push were skipped because they failed to encode.
    #[error("{skipped} of {total} records skipped; first failure: {first}")]
    RecordsSkipped {
        /// Number of records that were not enqueued.
        skipped: usize,
        /// Number of records in the call.
        total: usize,
        /// The first encode failure.
        #[source]
        first: EncodeError,
    },
}

/// Type alias for `Result<T, LokiError>`.
pub type Result<T> = std::result::Result<T, LokiError>;
