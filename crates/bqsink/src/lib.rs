//! bqsink
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Streaming sink that turns loosely-shaped log records into typed rows and
//! inserts them into date-partitioned tables of a remote tabular store.
//!
//! # Overview
//!
//! - **Schema**: a typed field tree that coerces records ([`schema`])
//! - **Formatting**: key rewriting, time injection, row framing
//!   ([`rewrite`], [`formatter`], [`row`])
//! - **Routing**: date-boundary splitting and round-robin destination
//!   templates ([`splitter`], [`router`])
//! - **Delivery**: insert, auto-create, error classification ([`delivery`])
//! - **Host entry points**: `format_batch` and `deliver` on [`sink::Sink`]
//!
//! # Example
//!
//! ```no_run
//! use bqsink::config::SinkConfig;
//! use bqsink::sink::Sink;
//!
//! # async fn run() -> bqsink::Result<()> {
//! let config = SinkConfig::load("bqsink.toml")?;
//! let sink = Sink::start(&config).await?;
//! let buffer = sink.format_batch("app.access", Vec::new())?;
//! let outcome = sink.deliver(&buffer).await;
//! assert!(outcome.is_success());
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod formatter;
pub mod path;
pub mod rewrite;
pub mod router;
pub mod row;
pub mod schema;
pub mod sink;
pub mod splitter;
pub mod time;

// Re-export commonly used types
pub use delivery::{DeliveryOutcome, DeliveryState};
pub use error::{Result, SinkError};
pub use sink::{Event, Sink};
