//! Raw record to insert row
//!
//! Per event: optional key rewrite, optional event-time injection, schema
//! coercion, optional idempotency token lookup. A row that coerces to an
//! empty object carries nothing and is dropped.

use crate::error::Result;
use crate::path::FieldPath;
use crate::rewrite::KeyRewriter;
use crate::schema::FieldSchema;
use crate::time::TimeFormatter;
use bqsink_common::types::InsertRow;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RecordFormatter {
    schema: Arc<FieldSchema>,
    rewriter: Option<KeyRewriter>,
    time_field: Option<FieldPath>,
    time_formatter: TimeFormatter,
    insert_id_field: Option<FieldPath>,
}

impl RecordFormatter {
    pub fn new(schema: Arc<FieldSchema>) -> Self {
        Self {
            schema,
            rewriter: None,
            time_field: None,
            time_formatter: TimeFormatter::default(),
            insert_id_field: None,
        }
    }

    pub fn with_rewriter(mut self, rewriter: KeyRewriter) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    /// Inject the event time, rendered by `formatter`, at `path`
    pub fn with_time_field(mut self, path: FieldPath, formatter: TimeFormatter) -> Self {
        self.time_field = Some(path);
        self.time_formatter = formatter;
        self
    }

    pub fn with_insert_id_field(mut self, path: FieldPath) -> Self {
        self.insert_id_field = Some(path);
        self
    }

    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    /// Format one event; `Ok(None)` when the row would be empty.
    pub fn format(&self, record: Map<String, Value>, time: DateTime<Utc>) -> Result<Option<InsertRow>> {
        let mut record = match &self.rewriter {
            Some(rewriter) => rewriter.rewrite(record),
            None => record,
        };

        if let Some(path) = &self.time_field {
            path.set(&mut record, Value::String(self.time_formatter.format(time)))?;
        }

        let json = self.schema.format_record(&record)?;
        if json.is_empty() {
            return Ok(None);
        }

        // looked up on the uncoerced record, so unschema'd fields can carry it
        let insert_id = self
            .insert_id_field
            .as_ref()
            .and_then(|path| path.get(&record))
            .and_then(insert_id_string);

        Ok(Some(InsertRow { json, insert_id }))
    }
}

fn insert_id_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
