//! Client configuration.
//!
//! Every setting has a documented default so a client can be created from
//! just a backend address. Settings are validated once, when the client
//! starts, and are immutable afterwards.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::error::ConfigError;

/// Default number of entries that triggers a flush.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default interval after which a non-empty buffer is flushed.
pub const DEFAULT_BATCH_WAIT: Duration = Duration::from_secs(5);

/// Default base label set attached to every stream.
pub const DEFAULT_LABELS: &str = r#"{source="cloudfront",job="cloudfront2loki"}"#;

/// Default number of entries the queue holds before producers wait.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Largest queue capacity the bounded channel can be created with.
pub const MAX_QUEUE_CAPACITY: usize = Semaphore::MAX_PERMITS;

/// Configuration for a [`Client`](crate::client::Client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend address, either `host:port` or a full `http(s)://` URL.
    pub address: String,
    /// Number of buffered entries that triggers a flush.
    pub batch_size: usize,
    /// Maximum time an entry waits in the buffer before being flushed.
    pub batch_wait: Duration,
    /// Base label set in `{k="v",...}` form, shared by every entry.
    pub labels: String,
    /// Record fields promoted to labels, in the order they are appended.
    pub add_fields: Vec<String>,
    /// Capacity of the queue between producers and the flush task.
    pub queue_capacity: usize,
    /// Timeout applied to every HTTP request.
    pub timeout: Duration,
    /// Maximum number of retry attempts for a failed push.
    pub max_retries: u32,
    /// Initial backoff duration between retries (doubles each attempt).
    pub retry_backoff: Duration,
    /// Upper bound for the retry backoff.
    pub max_backoff: Duration,
    /// How far back resume queries look for already ingested files.
    pub query_lookback: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_wait: DEFAULT_BATCH_WAIT,
            labels: DEFAULT_LABELS.to_string(),
            add_fields: Vec::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            query_lookback: Duration::from_secs(720 * 3600),
        }
    }
}

impl ClientConfig {
    /// Creates a new config for `address` with defaults for everything else.
    ///
    /// Defaults: batches of 100 entries or 5s, 30s timeout, 3 retries starting
    /// at 100ms capped at 10s, 30 day query lookback.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Sets the flush size threshold.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the flush interval.
    #[must_use]
    pub fn with_batch_wait(mut self, batch_wait: Duration) -> Self {
        self.batch_wait = batch_wait;
        self
    }

    /// Sets the base label set.
    #[must_use]
    pub fn with_labels(mut self, labels: impl Into<String>) -> Self {
        self.labels = labels.into();
        self
    }

    /// Sets the record fields promoted to labels.
    #[must_use]
    pub fn with_add_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the HTTP timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the initial retry backoff.
    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Sets the upper bound for the retry backoff.
    #[must_use]
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Sets the resume query lookback window.
    #[must_use]
    pub fn with_query_lookback(mut self, lookback: Duration) -> Self {
        self.query_lookback = lookback;
        self
    }

    /// Checks every setting.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::EmptyAddress);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize {
                size: self.batch_size,
            });
        }
        for (field, value) in [
            ("batch_wait", self.batch_wait),
            ("timeout", self.timeout),
            ("query_lookback", self.query_lookback),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { field });
            }
        }
        if !(self.labels.starts_with('{') && self.labels.ends_with('}')) {
            return Err(ConfigError::InvalidLabels {
                labels: self.labels.clone(),
            });
        }
        if self.add_fields.iter().any(|f| f.trim().is_empty()) {
            return Err(ConfigError::EmptyFieldName);
        }
        if self.queue_capacity < self.batch_size {
            return Err(ConfigError::QueueTooSmall {
                capacity: self.queue_capacity,
                batch_size: self.batch_size,
            });
        }
        if self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::QueueTooLarge {
                capacity: self.queue_capacity,
                max: MAX_QUEUE_CAPACITY,
            });
        }
        if Instant::now().checked_add(self.batch_wait).is_none() {
            return Err(ConfigError::BatchWaitTooLong {
                batch_wait: self.batch_wait,
            });
        }
        if self.retry_backoff > self.max_backoff {
            return Err(ConfigError::BackoffExceedsCap);
        }
        Ok(())
    }

    /// Base URL of the backend, without a trailing slash.
    pub fn base_url(&self) -> String {
        let address = self.address.trim().trim_end_matches('/');
        if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        }
    }

    /// URL of the push endpoint.
    pub fn push_url(&self) -> String {
        format!("{}/loki/api/v1/push", self.base_url())
    }

    /// URL of the range query endpoint.
    pub fn query_url(&self) -> String {
        format!("{}/loki/api/v1/query_range", self.base_url())
    }
}
