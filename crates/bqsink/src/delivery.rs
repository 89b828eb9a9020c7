//! Batch delivery and response classification
//!
//! One delivery attempt moves through
//! `Idle -> Sending -> {Success, RecoverableFailure, FatalFailure}`.
//!
//! - A missing destination with auto-create enabled creates the table and
//!   ends in `RecoverableFailure`: the batch is kept for the next scheduled
//!   delivery, since a fresh table is not immediately writable.
//! - Any other non-success response, or a transport error, ends in
//!   `FatalFailure`.
//!
//! Cached credentials are dropped on every non-success response.

use crate::client::{RemoteResponse, TableStore};
use crate::error::{Result, SinkError};
use crate::path::FieldPath;
use crate::router::TableRouter;
use crate::schema::FieldSchema;
use crate::time::{expand_template, parse_row_time};
use bqsink_common::types::{ErrorResponse, FieldDescriptor, InsertAllResponse, InsertRow, TableResource};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::{debug, error, info, warn};

#[allow(clippy::expect_used)]
static TABLE_NOT_FOUND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Not Found: Table").expect("valid table-not-found pattern"));

#[allow(clippy::expect_used)]
static ALREADY_EXISTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Already Exists:").expect("valid already-exists pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    Sending,
    Success,
    RecoverableFailure,
    FatalFailure,
}

/// Terminal result of one delivery attempt
#[derive(Debug)]
pub enum DeliveryOutcome {
    Success,
    /// Keep the batch and retry on the next scheduled delivery
    RecoverableFailure { table: String, reason: String },
    /// Surface to the host; credentials were already invalidated
    FatalFailure(SinkError),
}

impl DeliveryOutcome {
    pub fn state(&self) -> DeliveryState {
        match self {
            DeliveryOutcome::Success => DeliveryState::Success,
            DeliveryOutcome::RecoverableFailure { .. } => DeliveryState::RecoverableFailure,
            DeliveryOutcome::FatalFailure(_) => DeliveryState::FatalFailure,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success)
    }
}

/// Message of a remote error body.
///
/// Structured bodies yield `error.message`; anything else, including a body
/// that fails to parse, yields the raw text.
pub fn extract_error_message(body: &str) -> String {
    if !body.trim_start().starts_with('{') {
        return body.to_string();
    }
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(response) => response.error.message.unwrap_or_else(|| body.to_string()),
        Err(e) => {
            warn!(error = %e, body = %body, "Failed to parse error response");
            body.to_string()
        },
    }
}

/// Tracks one attempt's state for logging
struct Attempt<'a> {
    table: &'a str,
    state: DeliveryState,
}

impl<'a> Attempt<'a> {
    fn new(table: &'a str) -> Self {
        Self {
            table,
            state: DeliveryState::Idle,
        }
    }

    fn enter(&mut self, next: DeliveryState) {
        debug!(table = %self.table, from = ?self.state, to = ?next, "Delivery state");
        self.state = next;
    }
}

pub struct DeliveryPipeline {
    store: Arc<dyn TableStore>,
    router: TableRouter,
    schema: Arc<FieldSchema>,
    project: String,
    dataset: String,
    auto_create_table: bool,
    time_format_field: Option<FieldPath>,
    localtime: bool,
}

impl DeliveryPipeline {
    pub fn new(
        store: Arc<dyn TableStore>,
        router: TableRouter,
        schema: Arc<FieldSchema>,
        project: impl Into<String>,
        dataset: impl Into<String>,
    ) -> Self {
        Self {
            store,
            router,
            schema,
            project: project.into(),
            dataset: dataset.into(),
            auto_create_table: false,
            time_format_field: None,
            localtime: false,
        }
    }

    pub fn with_auto_create(mut self, enabled: bool) -> Self {
        self.auto_create_table = enabled;
        self
    }

    /// Expand templates against this row field instead of the clock
    pub fn with_time_format_field(mut self, field: FieldPath) -> Self {
        self.time_format_field = Some(field);
        self
    }

    pub fn with_localtime(mut self, localtime: bool) -> Self {
        self.localtime = localtime;
        self
    }

    /// Replace the schema used for auto-created tables
    pub fn set_schema(&mut self, schema: Arc<FieldSchema>) {
        self.schema = schema;
    }

    pub fn router(&self) -> &TableRouter {
        &self.router
    }

    /// Destination id for a batch: the next template, expanded against the
    /// first row's time field when configured, otherwise against `now`.
    pub fn resolve_table_id(&self, rows: &[InsertRow], now: DateTime<Utc>) -> String {
        let template = self.router.next();

        let row_time = self.time_format_field.as_ref().and_then(|field| {
            rows.first()
                .and_then(|row| field.get(&row.json))
                .and_then(parse_row_time)
        });

        match row_time {
            // the producer's offset decides the calendar date
            Some(time) => time.format(&template).to_string(),
            None => expand_template(&template, now, self.localtime),
        }
    }

    /// Send one batch to `table_id` and classify the result
    pub async fn send(&self, rows: &[InsertRow], table_id: &str) -> DeliveryOutcome {
        let mut attempt = Attempt::new(table_id);
        attempt.enter(DeliveryState::Sending);

        let outcome = match self.store.insert_all(table_id, rows).await {
            Ok(response) if response.is_success() => {
                self.report_insert_errors(table_id, &response);
                DeliveryOutcome::Success
            },
            Ok(response) => self.classify_failure(table_id, response).await,
            Err(e) => {
                self.store.invalidate_credentials().await;
                self.fatal(table_id, e)
            },
        };

        attempt.enter(outcome.state());
        outcome
    }

    async fn classify_failure(&self, table_id: &str, response: RemoteResponse) -> DeliveryOutcome {
        // every failure response drops the token, recoverable ones included
        self.store.invalidate_credentials().await;
        let message = extract_error_message(&response.body);

        if self.auto_create_table && response.status == 404 && TABLE_NOT_FOUND.is_match(&message) {
            info!(
                project = %self.project,
                dataset = %self.dataset,
                table = %table_id,
                "Destination table missing, creating it"
            );
            return match self.create_table(table_id).await {
                Ok(()) => DeliveryOutcome::RecoverableFailure {
                    table: table_id.to_string(),
                    reason: "table created, rows will be sent on the next delivery".to_string(),
                },
                Err(e) => self.fatal(table_id, e),
            };
        }

        self.fatal(table_id, SinkError::remote("insertAll", response.status, message))
    }

    /// Log and wrap a fatal error; credentials are already invalidated
    fn fatal(&self, table_id: &str, err: SinkError) -> DeliveryOutcome {
        match &err {
            SinkError::Remote { code, message, .. } => error!(
                project = %self.project,
                dataset = %self.dataset,
                table = %table_id,
                code = code,
                message = %message,
                "Delivery failed"
            ),
            other => error!(
                project = %self.project,
                dataset = %self.dataset,
                table = %table_id,
                error = %other,
                "Delivery failed"
            ),
        }
        DeliveryOutcome::FatalFailure(err)
    }

    fn report_insert_errors(&self, table_id: &str, response: &RemoteResponse) {
        if response.body.trim().is_empty() {
            return;
        }
        match serde_json::from_str::<InsertAllResponse>(&response.body) {
            Ok(parsed) if !parsed.insert_errors.is_empty() => warn!(
                table = %table_id,
                errors = parsed.insert_errors.len(),
                "insertAll reported row errors"
            ),
            Ok(_) => {},
            Err(e) => warn!(table = %table_id, error = %e, "Unreadable insertAll response"),
        }
    }

    /// Create `table_id` from the local schema. An existing table counts as
    /// created.
    pub async fn create_table(&self, table_id: &str) -> Result<()> {
        let response = self
            .store
            .create_table(table_id, self.schema.to_descriptors())
            .await?;
        if response.is_success() {
            info!(table = %table_id, "Table created");
            return Ok(());
        }

        let message = extract_error_message(&response.body);
        if response.status == 409 && ALREADY_EXISTS.is_match(&message) {
            info!(table = %table_id, "Table already exists");
            return Ok(());
        }

        Err(SinkError::remote("tables.insert", response.status, message))
    }

    /// Schema fields of a remote table
    pub async fn fetch_remote_schema(&self, table_id: &str) -> Result<Vec<FieldDescriptor>> {
        let response = match self.store.get_table(table_id).await {
            Ok(response) => response,
            Err(e) => {
                self.store.invalidate_credentials().await;
                return Err(e);
            },
        };

        if !response.is_success() {
            self.store.invalidate_credentials().await;
            let message = extract_error_message(&response.body);
            error!(
                project = %self.project,
                dataset = %self.dataset,
                table = %table_id,
                code = response.status,
                message = %message,
                "Schema fetch failed"
            );
            return Err(SinkError::remote("tables.get", response.status, message));
        }

        let table: TableResource = serde_json::from_str(&response.body)?;
        Ok(table.schema.map(|s| s.fields).unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bqsink_common::types::FieldType;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays canned responses and counts calls
    #[derive(Default)]
    struct FakeStore {
        insert_responses: Mutex<Vec<RemoteResponse>>,
        create_response: Mutex<Option<RemoteResponse>>,
        inserts: AtomicUsize,
        creates: AtomicUsize,
        invalidations: AtomicUsize,
        created_tables: Mutex<Vec<String>>,
    }

    impl FakeStore {
        fn inserting(responses: Vec<RemoteResponse>) -> Self {
            let store = Self::default();
            *store.insert_responses.lock().unwrap() = responses;
            store
        }

        fn creating(self, response: RemoteResponse) -> Self {
            *self.create_response.lock().unwrap() = Some(response);
            self
        }
    }

    #[async_trait]
    impl TableStore for FakeStore {
        async fn insert_all(&self, _table_id: &str, _rows: &[InsertRow]) -> Result<RemoteResponse> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            Ok(self.insert_responses.lock().unwrap().remove(0))
        }

        async fn create_table(&self, table_id: &str, _fields: Vec<FieldDescriptor>) -> Result<RemoteResponse> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.created_tables.lock().unwrap().push(table_id.to_string());
            Ok(self
                .create_response
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| RemoteResponse::new(200, "{}")))
        }

        async fn get_table(&self, _table_id: &str) -> Result<RemoteResponse> {
            Ok(self.insert_responses.lock().unwrap().remove(0))
        }

        async fn invalidate_credentials(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn not_found() -> RemoteResponse {
        RemoteResponse::new(
            404,
            json!({"error": {"code": 404, "message": "Not found: Table proj:logs.access"}}).to_string(),
        )
    }

    fn pipeline(store: Arc<FakeStore>, templates: &[&str]) -> DeliveryPipeline {
        let mut schema = FieldSchema::root();
        schema.register_field("status", FieldType::Integer).unwrap();
        DeliveryPipeline::new(
            store,
            TableRouter::new(templates.iter().map(|t| t.to_string()).collect()).unwrap(),
            Arc::new(schema),
            "proj",
            "logs",
        )
    }

    fn rows() -> Vec<InsertRow> {
        vec![InsertRow {
            json: json!({"status": 200}).as_object().cloned().unwrap(),
            insert_id: None,
        }]
    }

    #[tokio::test]
    async fn test_success() {
        let store = Arc::new(FakeStore::inserting(vec![RemoteResponse::new(200, "{}")]));
        let outcome = pipeline(Arc::clone(&store), &["access"]).send(&rows(), "access").await;
        assert_eq!(outcome.state(), DeliveryState::Success);
        assert_eq!(store.invalidations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_partial_insert_errors_still_succeed() {
        let body = json!({"insertErrors": [{"index": 0, "errors": [{"reason": "invalid"}]}]});
        let store = Arc::new(FakeStore::inserting(vec![RemoteResponse::new(200, body.to_string())]));
        let outcome = pipeline(store, &["access"]).send(&rows(), "access").await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_missing_table_with_auto_create_is_recoverable() {
        let store = Arc::new(FakeStore::inserting(vec![not_found()]));
        let outcome = pipeline(Arc::clone(&store), &["access"])
            .with_auto_create(true)
            .send(&rows(), "access")
            .await;

        assert!(matches!(outcome, DeliveryOutcome::RecoverableFailure { ref table, .. } if table == "access"));
        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
        assert_eq!(store.created_tables.lock().unwrap().as_slice(), ["access"]);
        assert_eq!(store.invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_conflict_counts_as_created() {
        let conflict = RemoteResponse::new(
            409,
            json!({"error": {"code": 409, "message": "Already Exists: Table proj:logs.access"}}).to_string(),
        );
        let store = Arc::new(FakeStore::inserting(vec![not_found()]).creating(conflict));
        let outcome = pipeline(Arc::clone(&store), &["access"])
            .with_auto_create(true)
            .send(&rows(), "access")
            .await;

        assert_eq!(outcome.state(), DeliveryState::RecoverableFailure);
        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
        assert_eq!(store.invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_failure_is_fatal() {
        let denied = RemoteResponse::new(403, "{\"error\": {\"message\": \"Access Denied\"}}");
        let store = Arc::new(FakeStore::inserting(vec![not_found()]).creating(denied));
        let outcome = pipeline(Arc::clone(&store), &["access"])
            .with_auto_create(true)
            .send(&rows(), "access")
            .await;

        assert!(matches!(
            outcome,
            DeliveryOutcome::FatalFailure(SinkError::Remote { operation: "tables.insert", code: 403, .. })
        ));
        assert_eq!(store.invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_table_without_auto_create_is_fatal() {
        let store = Arc::new(FakeStore::inserting(vec![not_found()]));
        let outcome = pipeline(Arc::clone(&store), &["access"]).send(&rows(), "access").await;

        assert_eq!(outcome.state(), DeliveryState::FatalFailure);
        assert_eq!(store.creates.load(Ordering::SeqCst), 0);
        assert_eq!(store.invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_errors_are_fatal_and_invalidate_credentials() {
        let store = Arc::new(FakeStore::inserting(vec![RemoteResponse::new(500, "backend error")]));
        let outcome = pipeline(Arc::clone(&store), &["access"])
            .with_auto_create(true)
            .send(&rows(), "access")
            .await;

        match outcome {
            DeliveryOutcome::FatalFailure(SinkError::Remote { code, message, .. }) => {
                assert_eq!(code, 500);
                assert_eq!(message, "backend error");
            },
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(store.invalidations.load(Ordering::SeqCst), 1);
        assert_eq!(store.creates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_extract_error_message() {
        assert_eq!(
            extract_error_message(r#"{"error": {"code": 400, "message": "bad row"}}"#),
            "bad row"
        );
        assert_eq!(extract_error_message("<html>502</html>"), "<html>502</html>");
        assert_eq!(extract_error_message("{not json"), "{not json");
        assert_eq!(extract_error_message(r#"{"other": 1}"#), r#"{"other": 1}"#);
        assert_eq!(extract_error_message(""), "");
    }

    #[test]
    fn test_resolve_table_id_from_row_or_clock() {
        let store = Arc::new(FakeStore::default());
        let now = DateTime::parse_from_rfc3339("2024-05-06T12:00:00Z").unwrap().with_timezone(&Utc);

        let by_clock = pipeline(Arc::clone(&store), &["access_%Y%m%d"]);
        assert_eq!(by_clock.resolve_table_id(&rows(), now), "access_20240506");

        let by_row = pipeline(store, &["a_%Y%m%d", "b_%Y%m%d"])
            .with_time_format_field(FieldPath::parse("time").unwrap());
        let dated = vec![InsertRow {
            json: json!({"time": "2023-12-31 23:30:00 -0500"}).as_object().cloned().unwrap(),
            insert_id: None,
        }];
        assert_eq!(by_row.resolve_table_id(&dated, now), "a_20231231");
        // no time value in the row: fall back to the clock, rotation continues
        assert_eq!(by_row.resolve_table_id(&rows(), now), "b_20240506");
    }

    #[tokio::test]
    async fn test_fetch_remote_schema() {
        let table = json!({
            "tableReference": {"projectId": "proj", "datasetId": "logs", "tableId": "access"},
            "schema": {"fields": [{"name": "host", "type": "STRING", "mode": "NULLABLE"}]}
        });
        let store = Arc::new(FakeStore::inserting(vec![
            RemoteResponse::new(200, table.to_string()),
            RemoteResponse::new(403, "forbidden"),
        ]));
        let pipeline = pipeline(Arc::clone(&store), &["access"]);

        let fields = pipeline.fetch_remote_schema("access").await.unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "host");

        assert!(pipeline.fetch_remote_schema("access").await.is_err());
        assert_eq!(store.invalidations.load(Ordering::SeqCst), 1);
    }
}
