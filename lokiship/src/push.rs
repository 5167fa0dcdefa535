//! Loki push client.
//!
//! Serializes label-grouped streams to the Loki push protobuf format and
//! posts them to `/loki/api/v1/push` with snappy compression and bounded
//! exponential backoff retry.
//!
//! # Example
//!
//! ```rust,no_run
//! use lokiship::batch::Stream;
//! use lokiship::config::ClientConfig;
//! use lokiship::push::Sender;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::new("localhost:3100");
//! let sender = Sender::new(reqwest::Client::new(), &config);
//!
//! let streams: Vec<Stream> = Vec::new();
//! sender.send(&streams).await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use prost::Message;
use tracing::{debug, warn};

use crate::batch::{Stream, entry_count};
use crate::config::ClientConfig;
use crate::entry::Entry;
use crate::error::PushError;

/// Loki push protobuf types.
///
/// Hand-written types matching `pkg/logproto/logproto.proto` and
/// `google/protobuf/timestamp.proto`. Using prost derives avoids the need
/// for protoc and proto file management.
pub mod proto {
    /// A push request containing one or more streams.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PushRequest {
        /// The streams to push.
        #[prost(message, repeated, tag = "1")]
        pub streams: Vec<StreamAdapter>,
    }

    /// A single stream: a label set and its entries.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StreamAdapter {
        /// Label set in `{k="v",...}` form.
        #[prost(string, tag = "1")]
        pub labels: String,
        /// Entries, non-decreasing in timestamp.
        #[prost(message, repeated, tag = "2")]
        pub entries: Vec<EntryAdapter>,
    }

    /// One log line.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct EntryAdapter {
        /// When the line was logged.
        #[prost(message, optional, tag = "1")]
        pub timestamp: Option<Timestamp>,
        /// The line itself.
        #[prost(string, tag = "2")]
        pub line: String,
    }

    /// `google.protobuf.Timestamp`.
    #[derive(Clone, Copy, PartialEq, Eq, prost::Message)]
    pub struct Timestamp {
        /// Seconds since the Unix epoch.
        #[prost(int64, tag = "1")]
        pub seconds: i64,
        /// Sub-second nanoseconds, `0..1_000_000_000`.
        #[prost(int32, tag = "2")]
        pub nanos: i32,
    }
}

/// Something that delivers a batch of streams to the backend.
///
/// [`Sender`] is the HTTP implementation; the flush scheduler is generic over
/// this trait so it can be driven without a network.
pub trait Push: Send + Sync + 'static {
    /// Delivers `streams` as one unit.
    fn push(&self, streams: &[Stream]) -> impl Future<Output = Result<(), PushError>> + Send;
}

/// Retry settings for the push endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first one.
    pub max_retries: u32,
    /// Backoff before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for the backoff.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Extracts the retry settings from a client config.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: config.retry_backoff,
            max_backoff: config.max_backoff,
        }
    }

    /// Backoff following `current`: doubled, capped at `max_backoff`.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff)
    }
}

/// HTTP sender for the Loki push endpoint.
#[derive(Debug, Clone)]
pub struct Sender {
    http: reqwest::Client,
    endpoint: String,
    retry: RetryPolicy,
}

impl Sender {
    /// Creates a sender posting to the push URL of `config`.
    ///
    /// `http` is shared with other users and should carry the request timeout.
    pub fn new(http: reqwest::Client, config: &ClientConfig) -> Self {
        Self {
            http,
            endpoint: config.push_url(),
            retry: RetryPolicy::from_config(config),
        }
    }

    /// The URL this sender posts to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Encodes `streams` and posts them, retrying transient failures.
    ///
    /// An empty slice succeeds without a request.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Rejected`] for a non-2xx response and
    /// [`PushError::Transport`] when no response arrived, in both cases after
    /// retries were exhausted or the failure was found to be permanent.
    pub async fn send(&self, streams: &[Stream]) -> Result<(), PushError> {
        if streams.is_empty() {
            return Ok(());
        }

        let body = encode(streams)?;
        debug!(
            streams = streams.len(),
            entries = entry_count(streams),
            bytes = body.len(),
            "Pushing batch"
        );
        self.send_with_retry(&body).await
    }

    /// Posts the compressed body with exponential backoff retry.
    async fn send_with_retry(&self, body: &[u8]) -> Result<(), PushError> {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 0;

        loop {
            let err = match self.post(body).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= self.retry.max_retries {
                return Err(err);
            }

            attempt += 1;
            warn!(
                attempt,
                max_retries = self.retry.max_retries,
                "Push failed, retrying in {backoff:?}: {err}"
            );
            tokio::time::sleep(backoff).await;
            backoff = self.retry.next_backoff(backoff);
        }
    }

    /// One POST attempt.
    async fn post(&self, body: &[u8]) -> Result<(), PushError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/x-protobuf")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|source| PushError::Transport { source })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(PushError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

impl Push for Sender {
    async fn push(&self, streams: &[Stream]) -> Result<(), PushError> {
        self.send(streams).await
    }
}

/// Encodes streams as a Loki push protobuf payload.
///
/// Returns the snappy-compressed protobuf bytes suitable for HTTP POST.
///
/// # Errors
///
/// Returns an error if serialization or compression fails.
pub fn encode(streams: &[Stream]) -> Result<Vec<u8>, PushError> {
    let request = build_push_request(streams);
    let proto_bytes = serialize_push_request(&request)?;
    compress_snappy(&proto_bytes)
}

/// Converts streams to a Loki `PushRequest`.
pub fn build_push_request(streams: &[Stream]) -> proto::PushRequest {
    proto::PushRequest {
        streams: streams
            .iter()
            .map(|stream| proto::StreamAdapter {
                labels: stream.labels.clone(),
                entries: stream.entries.iter().map(build_entry).collect(),
            })
            .collect(),
    }
}

#[allow(clippy::cast_possible_wrap)] // subsecond nanos are below 10^9
fn build_entry(entry: &Entry) -> proto::EntryAdapter {
    proto::EntryAdapter {
        timestamp: Some(proto::Timestamp {
            seconds: entry.timestamp.timestamp(),
            nanos: entry.timestamp.timestamp_subsec_nanos() as i32,
        }),
        line: entry.line.clone(),
    }
}

/// Serializes a `PushRequest` to protobuf bytes.
fn serialize_push_request(request: &proto::PushRequest) -> Result<Vec<u8>, PushError> {
    let mut buf = Vec::with_capacity(request.encoded_len());
    request
        .encode(&mut buf)
        .map_err(|e| PushError::Serialization { source: e })?;
    Ok(buf)
}

/// Compresses bytes using Snappy block format, as Loki expects for protobuf pushes.
fn compress_snappy(data: &[u8]) -> Result<Vec<u8>, PushError> {
    let mut encoder = snap::raw::Encoder::new();
    encoder
        .compress_vec(data)
        .map_err(|e| PushError::Compression { source: e })
}
