//! CLI for the lokiship Loki ingestion client.
//!
//! Pushes pre-parsed records (JSON lines on stdin) to Loki and answers the
//! resume questions: was this file shipped, and which file was shipped last.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use lokiship::error::{ClientError, LokiError};
use lokiship::{Client, ClientConfig, LogRecord};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// lokiship: batching Loki ingestion client CLI.
#[derive(Parser)]
#[command(name = "lokiship", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Read JSON-lines records from stdin and push them to Loki.
    Push {
        #[command(flatten)]
        backend: BackendArgs,
    },

    /// Report whether any ingested line mentions IDENTIFIER.
    Check {
        #[command(flatten)]
        backend: BackendArgs,

        /// Log file name (or any other string) to look for.
        identifier: String,
    },

    /// Print the file name of the most recently ingested record.
    Latest {
        #[command(flatten)]
        backend: BackendArgs,

        /// Stream selector; defaults to the configured base labels.
        selector: Option<String>,
    },
}

/// Backend and batching settings shared by every command.
#[derive(Args)]
struct BackendArgs {
    /// JSON file with a full client configuration; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Loki address, `host:port` or a full URL.
    #[arg(long, env = "LOKI_ADDRESS")]
    address: Option<String>,

    /// Base label set, e.g. `{source="cloudfront",job="cloudfront2loki"}`.
    #[arg(long)]
    labels: Option<String>,

    /// Record field to promote to a label (repeatable, order is kept).
    #[arg(long = "add-field")]
    add_fields: Vec<String>,

    /// Number of entries that triggers a flush.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Maximum time in milliseconds an entry waits before being flushed.
    #[arg(long)]
    batch_wait_ms: Option<u64>,

    /// HTTP timeout in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Maximum number of push retries.
    #[arg(long)]
    max_retries: Option<u32>,
}

impl BackendArgs {
    /// Builds the client config: file (if any), then flags on top.
    fn to_config(&self) -> Result<ClientConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ClientConfig::default(),
        };

        if let Some(address) = &self.address {
            config.address.clone_from(address);
        }
        if let Some(labels) = &self.labels {
            config.labels.clone_from(labels);
        }
        if !self.add_fields.is_empty() {
            config.add_fields.clone_from(&self.add_fields);
        }
        if let Some(size) = self.batch_size {
            config.batch_size = size;
        }
        if let Some(ms) = self.batch_wait_ms {
            config.batch_wait = Duration::from_millis(ms);
        }
        if let Some(secs) = self.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }

        Ok(config)
    }
}

fn load_config(path: &Path) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read config '{}': {e}", path.display()))?;
    let config = serde_json::from_str(&data)
        .map_err(|e| format!("invalid config '{}': {e}", path.display()))?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Push { backend } => cmd_push(&backend).await,
        Commands::Check {
            backend,
            identifier,
        } => cmd_check(&backend, &identifier).await,
        Commands::Latest { backend, selector } => cmd_latest(&backend, selector.as_deref()).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `lokiship push`.
async fn cmd_push(backend: &BackendArgs) -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::start(backend.to_config()?)?;
    let chunk_size = client.config().batch_size;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut chunk: Vec<LogRecord> = Vec::with_capacity(chunk_size);
    let mut line_no = 0u64;
    let mut invalid = 0u64;
    let mut skipped = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(&line) {
            Ok(record) => chunk.push(record),
            Err(e) => {
                tracing::warn!(line = line_no, "Ignoring invalid record: {e}");
                invalid += 1;
            }
        }
        if chunk.len() >= chunk_size {
            skipped += push_chunk(&client, &chunk).await?;
            chunk.clear();
        }
    }
    skipped += push_chunk(&client, &chunk).await?;

    let stats = client.shutdown().await?;
    println!("Lines read:        {line_no}");
    println!("Invalid JSON:      {invalid}");
    println!("Bad timestamps:    {skipped}");
    println!("Flushes:           {}", stats.flushes);
    println!("Entries sent:      {}", stats.entries_sent);
    println!("Entries dropped:   {}", stats.entries_dropped);

    if stats.entries_dropped > 0 {
        return Err(format!("{} entries could not be delivered", stats.entries_dropped).into());
    }
    Ok(())
}

/// Pushes one chunk, returning the number of records skipped for bad timestamps.
async fn push_chunk(client: &Client, chunk: &[LogRecord]) -> Result<usize, LokiError> {
    if chunk.is_empty() {
        return Ok(0);
    }
    match client.push_logs(chunk).await {
        Ok(_) => Ok(0),
        Err(LokiError::Client(ClientError::RecordsSkipped { skipped, .. })) => Ok(skipped),
        Err(e) => Err(e),
    }
}

/// Implements `lokiship check <identifier>`.
async fn cmd_check(
    backend: &BackendArgs,
    identifier: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::start(backend.to_config()?)?;
    let exists = client.is_log_in_loki(identifier).await;
    client.shutdown().await?;
    println!("{}", exists?);
    Ok(())
}

/// Implements `lokiship latest [selector]`.
async fn cmd_latest(
    backend: &BackendArgs,
    selector: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::start(backend.to_config()?)?;
    let selector = selector.map_or_else(|| client.config().labels.clone(), ToString::to_string);
    let latest = client.get_latest_log(&selector).await;
    client.shutdown().await?;
    println!("{}", latest?);
    Ok(())
}
