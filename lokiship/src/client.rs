//! The process-wide ingestion client.
//!
//! A [`Client`] owns the flush task, the producer end of its queue and the
//! shared HTTP transport. Create it once with [`Client::start`], feed it
//! records from any number of tasks, and stop it with [`Client::shutdown`],
//! which drains the queue before returning.
//!
//! # Example
//!
//! ```rust,no_run
//! use lokiship::{Client, ClientConfig, LogRecord};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::new("localhost:3100").with_add_fields(["Filename"]);
//! let client = Client::start(config)?;
//!
//! if !client.is_log_in_loki("E2ABCDEF.2021-01-08-11.abcd1234.gz").await? {
//!     let record = LogRecord::new("2021-01-08", "11:50:00", "E2ABCDEF.2021-01-08-11.abcd1234.gz");
//!     client.push_logs(&[record]).await?;
//! }
//!
//! let stats = client.shutdown().await?;
//! println!("sent {} entries", stats.entries_sent);
//! # Ok(())
//! # }
//! ```

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::entry::EntryEncoder;
use crate::error::{ClientError, EncodeError, PushError, Result};
use crate::flush::{FlushHandle, FlushScheduler, FlushStats};
use crate::labels::LabelBuilder;
use crate::push::Sender;
use crate::query::ResumeQuery;
use crate::record::LogRecord;

/// Handle to a running ingestion pipeline.
///
/// All methods take `&self`; share the client behind an `Arc` to feed it from
/// several tasks.
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    encoder: EntryEncoder,
    handle: FlushHandle,
    query: ResumeQuery,
    task: JoinHandle<FlushStats>,
}

impl Client {
    /// Validates `config` and starts the flush task.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn start(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|source| PushError::ClientCreate { source })?;

        let encoder = EntryEncoder::new(LabelBuilder::new(&config.labels, &config.add_fields));
        let query = ResumeQuery::new(http.clone(), &config);
        let sender = Sender::new(http, &config);
        info!(endpoint = sender.endpoint(), "Starting Loki client");

        let (scheduler, handle) = FlushScheduler::new(
            sender,
            config.batch_size,
            config.batch_wait,
            config.queue_capacity,
        );
        let task = tokio::spawn(scheduler.run());

        Ok(Self {
            config,
            encoder,
            handle,
            query,
            task,
        })
    }

    /// The configuration the client was started with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Encodes one record with `payload` as its line and enqueues it.
    ///
    /// Waits for queue capacity when the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::TimestampParse`] if the record's date and time
    /// do not parse, or [`ClientError::Closed`] after shutdown.
    pub async fn push_entry(&self, record: &LogRecord, payload: String) -> Result<()> {
        let entry = self.encoder.encode(record, payload)?;
        self.handle.enqueue(entry).await?;
        Ok(())
    }

    /// Enqueues every record, using its JSON form as the line.
    ///
    /// Records that fail to encode are skipped and logged; the rest are still
    /// enqueued. Returns the number of records enqueued.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::RecordsSkipped`] if any record was skipped, and
    /// [`ClientError::Closed`] immediately if the client has shut down.
    pub async fn push_logs(&self, records: &[LogRecord]) -> Result<usize> {
        let mut enqueued = 0;
        let mut skipped = 0;
        let mut first_failure = None;

        for record in records {
            let encoded = serde_json::to_string(record)
                .map_err(|source| EncodeError::Payload { source })
                .and_then(|payload| self.encoder.encode(record, payload));

            match encoded {
                Ok(entry) => {
                    self.handle.enqueue(entry).await?;
                    enqueued += 1;
                }
                Err(err) => {
                    warn!(filename = %record.filename, "Skipping record: {err}");
                    skipped += 1;
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            }
        }

        if let Some(first) = first_failure {
            return Err(ClientError::RecordsSkipped {
                skipped,
                total: records.len(),
                first,
            }
            .into());
        }
        Ok(enqueued)
    }

    /// Sends everything enqueued so far and waits for the result.
    ///
    /// # Errors
    ///
    /// Returns the push error if the batch could not be delivered; the batch
    /// is dropped either way.
    pub async fn flush(&self) -> Result<()> {
        self.handle.flush().await
    }

    /// Returns `true` if any ingested line mentions `identifier`.
    ///
    /// # Errors
    ///
    /// See [`ResumeQuery::is_log_in_loki`].
    pub async fn is_log_in_loki(&self, identifier: &str) -> Result<bool> {
        self.query.is_log_in_loki(identifier).await
    }

    /// Returns the file name of the newest line matching `selector`, or an
    /// empty string if there is none.
    ///
    /// # Errors
    ///
    /// See [`ResumeQuery::get_latest_log`].
    pub async fn get_latest_log(&self, selector: &str) -> Result<String> {
        self.query.get_latest_log(selector).await
    }

    /// Drains the queue, flushes, and stops the flush task.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] if the flush task had already stopped.
    pub async fn shutdown(self) -> Result<FlushStats> {
        let stats = self.handle.shutdown().await?;
        if let Err(err) = self.task.await {
            warn!("Flush task did not exit cleanly: {err}");
        }
        info!(
            entries_sent = stats.entries_sent,
            entries_dropped = stats.entries_dropped,
            "Loki client stopped"
        );
        Ok(stats)
    }
}
