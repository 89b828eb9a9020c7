//! Host-facing entry points
//!
//! The host calls [`Sink::format_batch`] when it buffers events and
//! [`Sink::deliver`] when it flushes a persisted chunk. The two calls only
//! share the framed row buffer, so a chunk can be delivered by a different
//! process than the one that formatted it.

use crate::auth::credentials_from_config;
use crate::client::{BigQueryClient, TableStore};
use crate::config::SinkConfig;
use crate::delivery::{DeliveryOutcome, DeliveryPipeline};
use crate::error::Result;
use crate::formatter::RecordFormatter;
use crate::path::FieldPath;
use crate::router::TableRouter;
use crate::row::{decode_rows, RowWriter};
use crate::schema::FieldSchema;
use crate::splitter::TimeFieldSplitter;
use crate::time::expand_template;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// One buffered event: its time and its record
#[derive(Debug, Clone)]
pub struct Event {
    pub time: DateTime<Utc>,
    pub record: Map<String, Value>,
}

impl Event {
    pub fn new(time: DateTime<Utc>, record: Map<String, Value>) -> Self {
        Self { time, record }
    }
}

pub struct Sink {
    formatter: RecordFormatter,
    splitter: TimeFieldSplitter,
    pipeline: DeliveryPipeline,
}

impl Sink {
    /// Build against the real API with credentials from `config`
    pub async fn start(config: &SinkConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let credentials = credentials_from_config(config, http.clone())?;
        let client = BigQueryClient::with_client(
            http,
            config.api_base_url.clone(),
            config.project.clone(),
            config.dataset.clone(),
            credentials,
        );
        Self::with_store(config, Arc::new(client)).await
    }

    /// Build against any [`TableStore`].
    ///
    /// With `fetch_schema` on, the remote schema of the first destination
    /// is merged before any delivery; manually declared fields win.
    pub async fn with_store(config: &SinkConfig, store: Arc<dyn TableStore>) -> Result<Self> {
        config.validate()?;

        let mut schema = config.build_schema()?;
        let router = TableRouter::new(config.table_templates())?;
        let time_format_field = config
            .time_format_field
            .as_deref()
            .map(FieldPath::parse)
            .transpose()?;
        let localtime = config.localtime.unwrap_or(false);

        let mut pipeline = DeliveryPipeline::new(
            store,
            router,
            Arc::new(FieldSchema::root()),
            config.project.clone(),
            config.dataset.clone(),
        )
        .with_auto_create(config.auto_create_table)
        .with_localtime(localtime);
        if let Some(field) = time_format_field.clone() {
            pipeline = pipeline.with_time_format_field(field);
        }

        if config.fetch_schema {
            let table_id = expand_template(pipeline.router().first(), Utc::now(), localtime);
            let fields = pipeline.fetch_remote_schema(&table_id).await?;
            info!(table = %table_id, fields = fields.len(), "Merging remote schema");
            schema.load_schema(&fields, false)?;
        }

        // frozen from here on
        let schema = Arc::new(schema);
        pipeline.set_schema(Arc::clone(&schema));

        let mut formatter = RecordFormatter::new(schema);
        if let Some(rewriter) = config.key_rewriter()? {
            formatter = formatter.with_rewriter(rewriter);
        }
        if let Some(field) = &config.time_field {
            formatter = formatter.with_time_field(FieldPath::parse(field)?, config.time_formatter()?);
        }
        if let Some(field) = &config.insert_id_field {
            formatter = formatter.with_insert_id_field(FieldPath::parse(field)?);
        }

        Ok(Self {
            formatter,
            splitter: TimeFieldSplitter::new(time_format_field),
            pipeline,
        })
    }

    pub fn schema(&self) -> &FieldSchema {
        self.formatter.schema()
    }

    /// Format events into one framed row buffer.
    ///
    /// Any row that fails to format fails the whole call. Rows that format
    /// to nothing are skipped.
    pub fn format_batch<I>(&self, tag: &str, events: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = Event>,
    {
        let mut writer = RowWriter::new();
        let mut dropped = 0usize;

        for event in events {
            match self.formatter.format(event.record, event.time)? {
                Some(row) => writer.push(&row)?,
                None => dropped += 1,
            }
        }

        debug!(tag = %tag, rows = writer.len(), dropped, "Formatted batch");
        Ok(writer.into_bytes())
    }

    /// Deliver a framed buffer produced by [`Sink::format_batch`].
    ///
    /// Date-split sub-batches go out in order; the first one that does not
    /// succeed decides the outcome for the whole buffer.
    pub async fn deliver(&self, buffer: &[u8]) -> DeliveryOutcome {
        let rows = match decode_rows(buffer) {
            Ok(rows) => rows,
            Err(e) => return DeliveryOutcome::FatalFailure(e),
        };

        for batch in self.splitter.split(rows) {
            let table_id = self.pipeline.resolve_table_id(&batch, Utc::now());
            let outcome = self.pipeline.send(&batch, &table_id).await;
            if !outcome.is_success() {
                return outcome;
            }
        }

        DeliveryOutcome::Success
    }
}
