//! Platform bulk-operation API seam.
//!
//! [`BulkOperationApi`] is what the orchestrator talks to; the gateway-
//! backed implementation speaks the platform's GraphQL admin API through
//! the circuit breaker and connection scheduler. Tests substitute a
//! scripted implementation.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use futures::TryStreamExt;

use storebridge_core::{Destination, Priority};
use storebridge_gateway::{GatewayError, GatewayResult, PlatformClient};

/// Remote status values the platform reports for a bulk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Created,
    Running,
    Completed,
    Failed,
    Canceled,
    Unknown,
}

impl RemoteStatus {
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Self::Created,
            "RUNNING" => Self::Running,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            "CANCELED" | "CANCELLED" => Self::Canceled,
            _ => Self::Unknown,
        }
    }
}

/// Snapshot of a bulk operation as the platform reports it.
#[derive(Debug, Clone)]
pub struct RemoteOperation {
    pub id: String,
    pub status: RemoteStatus,
    pub error_code: Option<String>,
    pub status_message: Option<String>,
    pub object_count: u64,
    /// The platform's estimate of total root objects, used for progress.
    pub root_object_count: u64,
    pub file_size: Option<u64>,
    pub url: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Byte stream of a result file.
pub type ResultByteStream = Pin<Box<dyn Stream<Item = GatewayResult<Bytes>> + Send>>;

/// Outbound operations the orchestrator needs from the platform.
#[async_trait]
pub trait BulkOperationApi: Send + Sync {
    /// Submit an export query. Returns the acknowledged operation.
    async fn submit(
        &self,
        destination: &Destination,
        query: &str,
        correlation: &str,
    ) -> GatewayResult<RemoteOperation>;

    /// Fetch the current state of an operation.
    async fn fetch(
        &self,
        destination: &Destination,
        operation_id: &str,
        correlation: &str,
    ) -> GatewayResult<RemoteOperation>;

    /// Request cancellation. Returns whether the platform accepted it.
    async fn request_cancel(
        &self,
        destination: &Destination,
        operation_id: &str,
        correlation: &str,
    ) -> GatewayResult<bool>;

    /// Open the result file at `url` as a byte stream.
    async fn download(
        &self,
        destination: &Destination,
        url: &str,
        correlation: &str,
    ) -> GatewayResult<ResultByteStream>;
}

/// Supplies the bearer token for a destination.
///
/// Token acquisition and storage live outside this crate; deployments
/// plug their token store in here.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self, destination: &Destination) -> Option<String>;
}

const SUBMIT_BULK_OPERATION: &str = r#"
mutation bulkOperationRunQuery($query: String!) {
  bulkOperationRunQuery(query: $query) {
    bulkOperation {
      id
      status
      errorCode
      createdAt
      completedAt
      objectCount
      rootObjectCount
      fileSize
      url
    }
    userErrors {
      field
      message
    }
  }
}
"#;

const GET_BULK_OPERATION: &str = r#"
query bulkOperation($id: ID!) {
  node(id: $id) {
    ... on BulkOperation {
      id
      status
      errorCode
      statusMessage
      createdAt
      completedAt
      objectCount
      rootObjectCount
      fileSize
      url
      partialDataUrl
    }
  }
}
"#;

const CANCEL_BULK_OPERATION: &str = r#"
mutation bulkOperationCancel($id: ID!) {
  bulkOperationCancel(id: $id) {
    bulkOperation {
      id
      status
    }
    userErrors {
      field
      message
    }
  }
}
"#;

/// Gateway-backed implementation speaking the platform's GraphQL API.
pub struct GatewayBulkApi {
    client: PlatformClient,
    tokens: Arc<dyn TokenProvider>,
}

impl GatewayBulkApi {
    #[must_use]
    pub fn new(client: PlatformClient, tokens: Arc<dyn TokenProvider>) -> Self {
        Self { client, tokens }
    }

    async fn token(&self, destination: &Destination, correlation: &str) -> GatewayResult<String> {
        self.tokens
            .access_token(destination)
            .await
            .ok_or_else(|| GatewayError::Configuration(format!(
                "no access token for {destination} [{correlation}]"
            )))
    }
}

/// Map a GraphQL operation node onto [`RemoteOperation`].
fn parse_operation(node: &serde_json::Value) -> Option<RemoteOperation> {
    let id = node.get("id")?.as_str()?.to_string();
    let status = RemoteStatus::parse(node.get("status").and_then(|v| v.as_str()).unwrap_or(""));
    Some(RemoteOperation {
        id,
        status,
        error_code: node
            .get("errorCode")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        status_message: node
            .get("statusMessage")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        object_count: parse_count(node.get("objectCount")),
        root_object_count: parse_count(node.get("rootObjectCount")),
        file_size: node.get("fileSize").map(parse_count_value).filter(|n| *n > 0),
        url: node.get("url").and_then(|v| v.as_str()).map(str::to_string),
        completed_at: node
            .get("completedAt")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)),
    })
}

// The platform serializes counts as JSON strings in some API versions
// and numbers in others.
fn parse_count(value: Option<&serde_json::Value>) -> u64 {
    value.map(parse_count_value).unwrap_or(0)
}

fn parse_count_value(value: &serde_json::Value) -> u64 {
    match value {
        serde_json::Value::Number(n) => n.as_u64().unwrap_or(0),
        serde_json::Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Surface mutation `userErrors` as a permanent failure.
fn check_user_errors(
    destination: &Destination,
    correlation: &str,
    payload: &serde_json::Value,
) -> GatewayResult<()> {
    let errors = payload.get("userErrors").and_then(|v| v.as_array());
    if let Some(errors) = errors {
        if !errors.is_empty() {
            let message = errors[0]
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown user error");
            return Err(GatewayError::Permanent {
                destination: destination.clone(),
                correlation: correlation.to_string(),
                status: 200,
                message: message.to_string(),
            });
        }
    }
    Ok(())
}

#[async_trait]
impl BulkOperationApi for GatewayBulkApi {
    async fn submit(
        &self,
        destination: &Destination,
        query: &str,
        correlation: &str,
    ) -> GatewayResult<RemoteOperation> {
        let token = self.token(destination, correlation).await?;
        let data = self
            .client
            .graphql(
                destination,
                &token,
                SUBMIT_BULK_OPERATION,
                Some(serde_json::json!({ "query": query })),
                Priority::Background,
                correlation,
            )
            .await?;

        let payload = data
            .get("bulkOperationRunQuery")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        check_user_errors(destination, correlation, &payload)?;

        payload
            .get("bulkOperation")
            .and_then(parse_operation)
            .ok_or_else(|| GatewayError::Transient {
                destination: destination.clone(),
                correlation: correlation.to_string(),
                message: "submission acknowledged without an operation".to_string(),
            })
    }

    async fn fetch(
        &self,
        destination: &Destination,
        operation_id: &str,
        correlation: &str,
    ) -> GatewayResult<RemoteOperation> {
        let token = self.token(destination, correlation).await?;
        let data = self
            .client
            .graphql(
                destination,
                &token,
                GET_BULK_OPERATION,
                Some(serde_json::json!({ "id": operation_id })),
                Priority::Background,
                correlation,
            )
            .await?;

        data.get("node")
            .and_then(parse_operation)
            .ok_or_else(|| GatewayError::Permanent {
                destination: destination.clone(),
                correlation: correlation.to_string(),
                status: 200,
                message: format!("bulk operation {operation_id} not found"),
            })
    }

    async fn request_cancel(
        &self,
        destination: &Destination,
        operation_id: &str,
        correlation: &str,
    ) -> GatewayResult<bool> {
        let token = self.token(destination, correlation).await?;
        let data = self
            .client
            .graphql(
                destination,
                &token,
                CANCEL_BULK_OPERATION,
                Some(serde_json::json!({ "id": operation_id })),
                Priority::Background,
                correlation,
            )
            .await?;

        let payload = data
            .get("bulkOperationCancel")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        match check_user_errors(destination, correlation, &payload) {
            Ok(()) => Ok(true),
            Err(err) => {
                tracing::warn!(
                    target: "bulk_api",
                    destination = %destination,
                    correlation,
                    error = %err,
                    "Platform rejected cancellation"
                );
                Ok(false)
            }
        }
    }

    async fn download(
        &self,
        destination: &Destination,
        url: &str,
        correlation: &str,
    ) -> GatewayResult<ResultByteStream> {
        let destination_owned = destination.clone();
        let correlation_owned = correlation.to_string();
        let response = self.client.download(destination, url, correlation).await?;
        let stream = response.bytes_stream().map_err(move |e| GatewayError::Transient {
            destination: destination_owned.clone(),
            correlation: correlation_owned.clone(),
            message: format!("result stream error: {e}"),
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_status_parse() {
        assert_eq!(RemoteStatus::parse("COMPLETED"), RemoteStatus::Completed);
        assert_eq!(RemoteStatus::parse("running"), RemoteStatus::Running);
        assert_eq!(RemoteStatus::parse("CANCELLED"), RemoteStatus::Canceled);
        assert_eq!(RemoteStatus::parse("EXPLODED"), RemoteStatus::Unknown);
    }

    #[test]
    fn test_parse_operation_with_string_counts() {
        let node = serde_json::json!({
            "id": "gid://bulk/op/1",
            "status": "COMPLETED",
            "objectCount": "100",
            "rootObjectCount": 40,
            "fileSize": "4096",
            "url": "https://cdn.example/result.jsonl",
            "completedAt": "2026-08-01T12:00:00Z",
        });

        let op = parse_operation(&node).unwrap();
        assert_eq!(op.id, "gid://bulk/op/1");
        assert_eq!(op.status, RemoteStatus::Completed);
        assert_eq!(op.object_count, 100);
        assert_eq!(op.root_object_count, 40);
        assert_eq!(op.file_size, Some(4096));
        assert_eq!(op.url.as_deref(), Some("https://cdn.example/result.jsonl"));
        assert!(op.completed_at.is_some());
    }

    #[test]
    fn test_parse_operation_missing_id_is_none() {
        assert!(parse_operation(&serde_json::json!({"status": "RUNNING"})).is_none());
        assert!(parse_operation(&serde_json::Value::Null).is_none());
    }

    #[test]
    fn test_check_user_errors_surfaces_first_message() {
        let payload = serde_json::json!({
            "userErrors": [{"field": ["query"], "message": "query is invalid"}],
        });
        let err = check_user_errors(
            &Destination::new("shop.example.com"),
            "job-1",
            &payload,
        )
        .unwrap_err();
        assert!(err.to_string().contains("query is invalid"));
    }

    #[test]
    fn test_check_user_errors_empty_is_ok() {
        let payload = serde_json::json!({"userErrors": []});
        assert!(check_user_errors(
            &Destination::new("shop.example.com"),
            "job-1",
            &payload
        )
        .is_ok());
    }
}
