//! Date-boundary batch splitting
//!
//! Destination ids may embed the row's date (one table per day), so rows
//! from different calendar dates must never share an insert call. The
//! splitter cuts the ordered row stream into contiguous runs whose date,
//! read from a designated row field, does not change.

use crate::path::FieldPath;
use crate::time::parse_row_time;
use bqsink_common::types::InsertRow;
use chrono::NaiveDate;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct TimeFieldSplitter {
    field: Option<FieldPath>,
}

impl TimeFieldSplitter {
    /// `None` keeps every input as a single batch
    pub fn new(field: Option<FieldPath>) -> Self {
        Self { field }
    }

    /// Date of a row according to the designated field
    pub fn row_date(&self, row: &InsertRow) -> Option<NaiveDate> {
        let field = self.field.as_ref()?;
        field
            .get(&row.json)
            .and_then(parse_row_time)
            .map(|t| t.date_naive())
    }

    /// Split `rows` into runs of equal date, preserving order.
    ///
    /// A row whose date cannot be read joins the current run.
    pub fn split(&self, rows: Vec<InsertRow>) -> Vec<Vec<InsertRow>> {
        if rows.is_empty() {
            return Vec::new();
        }
        let Some(field) = &self.field else {
            return vec![rows];
        };

        let mut batches = Vec::new();
        let mut current: Vec<InsertRow> = Vec::new();
        let mut current_date: Option<NaiveDate> = None;

        for row in rows {
            match self.row_date(&row) {
                Some(date) => {
                    if current_date.is_some_and(|d| d != date) && !current.is_empty() {
                        batches.push(std::mem::take(&mut current));
                    }
                    current_date = Some(date);
                },
                None => warn!(field = %field.dotted(), "Row time field missing or unparseable"),
            }
            current.push(row);
        }

        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }
}
