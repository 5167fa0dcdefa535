//! # lokiship
//!
//! Batching ingestion client for Grafana Loki with idempotent resume.
//!
//! lokiship takes pre-parsed access-log records (CloudFront, typically),
//! labels them, batches them in memory and pushes them to Loki's protobuf
//! push endpoint. Before and after a run, callers can ask Loki itself which
//! log files were already shipped, so a restarted process picks up where the
//! previous one stopped without sending duplicates.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - One background flush task per client, flushing on size or time
//! - Entry order within a stream is preserved end to end
//! - Bounded exponential backoff retry; batches that still fail are dropped
//!   and reported, never silently lost
//! - No local state on disk; Loki is the system of record
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lokiship::{Client, ClientConfig, LogRecord};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::new("localhost:3100")
//!     .with_batch_size(500)
//!     .with_batch_wait(Duration::from_secs(5))
//!     .with_labels(r#"{source="cloudfront",job="cloudfront2loki"}"#)
//!     .with_add_fields(["Filename"]);
//! let client = Client::start(config)?;
//!
//! let last = client
//!     .get_latest_log(r#"{source="cloudfront",job="cloudfront2loki"}"#)
//!     .await?;
//! println!("last shipped file: {last:?}");
//!
//! let record = LogRecord::new("2021-01-08", "11:50:00", "E2ABCDEF.2021-01-08-11.gz")
//!     .with_field("EdgeResultType", "Hit");
//! client.push_logs(&[record]).await?;
//!
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Client`]: Top-level handle; owns the flush task and HTTP transport
//! - [`ClientConfig`]: Backend address, batching, labels, retry settings
//! - [`LogRecord`]: The pre-parsed input record
//! - [`FlushStats`]: Counters reported when the client stops
//!
//! ## Modules
//!
//! - [`client`]: Client lifecycle, push, flush, resume queries
//! - [`config`]: Configuration and validation
//! - [`record`]: Input record type
//! - [`labels`]: Label set construction
//! - [`entry`]: Timestamp parsing and labeled entries
//! - [`batch`]: Grouping entries into streams
//! - [`flush`]: Batch queue and flush scheduler
//! - [`push`]: Loki push protobuf encoding and HTTP sender
//! - [`query`]: Resume queries
//! - [`error`]: Error types

pub mod batch;
pub mod client;
pub mod config;
pub mod entry;
pub mod error;
pub mod flush;
pub mod labels;
pub mod push;
pub mod query;
pub mod record;

// Re-export primary API types at crate root for convenience.
pub use client::Client;
pub use config::ClientConfig;
pub use entry::{Entry, LabeledEntry};
pub use error::{LokiError, Result};
pub use flush::FlushStats;
pub use record::LogRecord;
