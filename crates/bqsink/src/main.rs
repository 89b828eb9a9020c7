//! bqsink - Main entry point
//!
//! Minimal host: reads newline-delimited JSON records, buffers them into
//! chunks, and drives `format_batch` / `deliver` with retries. A chunk that
//! still fails is logged and dropped; reading continues.

use anyhow::{Context, Result};
use bqsink::config::SinkConfig;
use bqsink::{DeliveryOutcome, Event, Sink};
use bqsink_common::logging::{init_logging, LogConfig, LogLevel};
use chrono::Utc;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{error, info, warn};

/// Stream JSON records into remote tables
#[derive(Parser, Debug)]
#[command(name = "bqsink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "BQSINK_CONFIG", default_value = "bqsink.toml", global = true)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read records and deliver them
    Run {
        /// Input file; stdin when omitted
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Tag attached to every chunk
        #[arg(short, long, default_value = "bqsink")]
        tag: String,
    },

    /// Print the effective schema as table descriptors
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { LogLevel::Debug } else { LogLevel::Info };
    let log_config = LogConfig::builder()
        .level(level)
        .log_file_prefix("bqsink")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    let config = SinkConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Commands::Run { input, tag } => {
            let sink = Sink::start(&config).await.context("failed to start sink")?;
            match input {
                Some(path) => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("failed to open {}", path.display()))?;
                    run(&sink, &config, &tag, file).await
                },
                None => run(&sink, &config, &tag, tokio::io::stdin()).await,
            }
        },
        Commands::Schema => {
            let schema = config.build_schema()?;
            println!("{}", serde_json::to_string_pretty(&schema.to_descriptors())?);
            Ok(())
        },
    }
}

/// Rows delivered and rows given up on during one run
#[derive(Debug, Default, PartialEq, Eq)]
struct RunSummary {
    delivered: usize,
    failed: usize,
}

async fn run<R>(sink: &Sink, config: &SinkConfig, tag: &str, input: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let summary = process(sink, config, tag, input).await?;
    info!(rows = summary.delivered, failed = summary.failed, "Input exhausted");
    if summary.failed > 0 {
        warn!(records = summary.failed, "Some records were not delivered");
    }
    Ok(())
}

/// Read every record and deliver it chunk by chunk. A chunk that cannot be
/// formatted or delivered is logged and counted; reading continues.
async fn process<R>(sink: &Sink, config: &SinkConfig, tag: &str, input: R) -> Result<RunSummary>
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(input, LinesCodec::new());
    let mut chunk = Vec::with_capacity(config.buffer_chunk_records_limit);
    let mut summary = RunSummary::default();

    while let Some(line) = lines.next().await {
        let line = line.context("failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(Value::Object(record)) => chunk.push(Event::new(Utc::now(), record)),
            Ok(_) => warn!("Skipping non-object record"),
            Err(e) => warn!(error = %e, "Skipping unparseable record"),
        }

        if chunk.len() >= config.buffer_chunk_records_limit {
            flush(sink, config, tag, std::mem::take(&mut chunk), &mut summary).await;
        }
    }

    if !chunk.is_empty() {
        flush(sink, config, tag, chunk, &mut summary).await;
    }

    Ok(summary)
}

/// Format one chunk and deliver it, retrying with exponential backoff
async fn flush(sink: &Sink, config: &SinkConfig, tag: &str, events: Vec<Event>, summary: &mut RunSummary) {
    let count = events.len();
    let buffer = match sink.format_batch(tag, events) {
        Ok(buffer) => buffer,
        Err(e) => {
            error!(error = %e, records = count, "Dropping chunk that failed to format");
            summary.failed += count;
            return;
        },
    };
    let mut wait = Duration::from_secs(config.retry_wait_secs);

    for attempt in 0..=config.max_retries {
        match sink.deliver(&buffer).await {
            DeliveryOutcome::Success => {
                summary.delivered += count;
                return;
            },
            DeliveryOutcome::RecoverableFailure { table, reason } => {
                info!(table = %table, reason = %reason, attempt, "Retrying chunk later");
            },
            DeliveryOutcome::FatalFailure(e) => {
                error!(error = %e, attempt, "Chunk delivery failed");
            },
        }
        if attempt < config.max_retries {
            tokio::time::sleep(wait).await;
            wait *= 2;
        }
    }

    error!(records = count, retries = config.max_retries, "Giving up on chunk");
    summary.failed += count;
}
