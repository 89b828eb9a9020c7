//! Remote table API
//!
//! [`TableStore`] is the seam between the delivery logic and the network.
//! Calls return the raw status and body: deciding what a status means is
//! the caller's job, only transport failures surface as errors here.

use crate::auth::CredentialProvider;
use crate::error::Result;
use async_trait::async_trait;
use bqsink_common::types::{FieldDescriptor, InsertAllRequest, InsertRow, TableResource};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Status and body of a remote call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: String,
}

impl RemoteResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait TableStore: Send + Sync {
    /// Stream `rows` into `table_id`
    async fn insert_all(&self, table_id: &str, rows: &[InsertRow]) -> Result<RemoteResponse>;

    /// Create `table_id` with the given top-level fields
    async fn create_table(&self, table_id: &str, fields: Vec<FieldDescriptor>) -> Result<RemoteResponse>;

    /// Fetch the table resource, including its schema
    async fn get_table(&self, table_id: &str) -> Result<RemoteResponse>;

    /// Drop cached credentials; the next call re-authenticates
    async fn invalidate_credentials(&self);
}

/// [`TableStore`] over the REST API
pub struct BigQueryClient {
    client: Client,
    base_url: String,
    project: String,
    dataset: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl BigQueryClient {
    pub fn new(
        base_url: impl Into<String>,
        project: impl Into<String>,
        dataset: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url, project, dataset, credentials))
    }

    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        project: impl Into<String>,
        dataset: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project: project.into(),
            dataset: dataset.into(),
            credentials,
        }
    }

    fn tables_url(&self) -> String {
        format!(
            "{}/projects/{}/datasets/{}/tables",
            self.base_url, self.project, self.dataset
        )
    }

    fn table_url(&self, table_id: &str) -> String {
        format!("{}/{}", self.tables_url(), table_id)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<RemoteResponse> {
        let token = self.credentials.access_token().await?;
        let response = request.bearer_auth(token).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(RemoteResponse { status, body })
    }
}

#[async_trait]
impl TableStore for BigQueryClient {
    async fn insert_all(&self, table_id: &str, rows: &[InsertRow]) -> Result<RemoteResponse> {
        let url = format!("{}/insertAll", self.table_url(table_id));
        debug!(table = %table_id, rows = rows.len(), "insertAll");

        let body = InsertAllRequest {
            rows: rows.to_vec(),
        };
        self.send(self.client.post(&url).json(&body)).await
    }

    async fn create_table(&self, table_id: &str, fields: Vec<FieldDescriptor>) -> Result<RemoteResponse> {
        debug!(table = %table_id, fields = fields.len(), "Creating table");

        let body = TableResource::for_create(table_id, fields);
        self.send(self.client.post(self.tables_url()).json(&body)).await
    }

    async fn get_table(&self, table_id: &str) -> Result<RemoteResponse> {
        self.send(self.client.get(self.table_url(table_id))).await
    }

    async fn invalidate_credentials(&self) {
        self.credentials.invalidate().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use bqsink_common::types::{FieldMode, FieldType};
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> BigQueryClient {
        BigQueryClient::new(
            format!("{}/bigquery/v2/", server.uri()),
            "proj",
            "logs",
            Arc::new(StaticToken::new("secret")),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_all_posts_rows_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bigquery/v2/projects/proj/datasets/logs/tables/access/insertAll"))
            .and(header("Authorization", "Bearer secret"))
            .and(body_json(json!({
                "rows": [{"json": {"a": 1}, "insertId": "r1"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let rows = vec![InsertRow {
            json: json!({"a": 1}).as_object().cloned().unwrap(),
            insert_id: Some("r1".to_string()),
        }];
        let response = client(&server).await.insert_all("access", &rows).await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.body, "{}");
    }

    #[tokio::test]
    async fn test_create_table_sends_reference_and_schema() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bigquery/v2/projects/proj/datasets/logs/tables"))
            .and(body_json(json!({
                "tableReference": {"tableId": "access_20240101"},
                "schema": {"fields": [{"name": "status", "type": "INTEGER", "mode": "NULLABLE"}]}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let fields = vec![FieldDescriptor::leaf("status", FieldType::Integer, FieldMode::Nullable)];
        let response = client(&server)
            .await
            .create_table("access_20240101", fields)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_non_success_status_is_returned_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bigquery/v2/projects/proj/datasets/logs/tables/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("{\"error\":{\"message\":\"Not found: Table\"}}"))
            .mount(&server)
            .await;

        let response = client(&server).await.get_table("missing").await.unwrap();
        assert_eq!(response.status, 404);
        assert!(!response.is_success());
        assert!(response.body.contains("Not found"));
    }
}
