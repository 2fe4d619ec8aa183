//! HTTP client for the upstream catalog API.
//!
//! One request per call. Admission control and retries happen in the
//! coalescing owner, so this client only classifies responses:
//! - 429 → `RateLimited` (with `Retry-After` when present)
//! - 404 → `None` for single-entity reads
//! - 5xx, timeouts, connect failures → `Unavailable`
//! - other 4xx → `Rejected`

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client as ReqwestClient, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::domain::models::{
    ApiSurface, EntityType, UpstreamConfig, UpstreamPage, UpstreamRecord, VersionSource,
};
use crate::domain::ports::{UpstreamClient, UpstreamError};

pub struct HttpUpstreamClient {
    /// Reusable HTTP client with connection pooling
    http_client: ReqwestClient,
    base_url: String,
    access_token: Option<String>,
    token_header: String,
    surface: ApiSurface,
    id_field: String,
    version_source: VersionSource,
}

impl HttpUpstreamClient {
    pub fn new(config: &UpstreamConfig, version_source: VersionSource) -> Result<Self> {
        let http_client = ReqwestClient::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .pool_max_idle_per_host(10)
            .tcp_nodelay(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
            token_header: config.token_header.clone(),
            surface: config.surface,
            id_field: config.id_field.clone(),
            version_source,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(header::ACCEPT, "application/json");
        match &self.access_token {
            Some(token) => request.header(self.token_header.as_str(), token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, UpstreamError> {
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Unavailable(format!("request timed out: {e}"))
            } else {
                UpstreamError::Unavailable(e.to_string())
            }
        })
    }

    fn decode_record(&self, body: Value) -> Result<UpstreamRecord, UpstreamError> {
        UpstreamRecord::decode(body, &self.id_field, self.version_source)
            .map_err(|e| UpstreamError::Decode(e.to_string()))
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Map a non-success response to an error.
async fn classify(response: Response) -> UpstreamError {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = retry_after(&response);
        warn!(?retry_after, "upstream signalled rate limit");
        return UpstreamError::RateLimited { retry_after };
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error response".to_string());
    if status.is_server_error() {
        UpstreamError::Unavailable(format!("{status}: {message}"))
    } else {
        UpstreamError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

/// Unwrap `{"data": {...}}` envelopes.
fn unwrap_envelope(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.len() == 1 && map.get("data").is_some_and(Value::is_object) => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Next-page cursor from either `next_cursor` or a `page_info` block.
fn next_cursor(body: &Value) -> Option<String> {
    if let Some(cursor) = body.get("next_cursor").and_then(Value::as_str) {
        return Some(cursor.to_string()).filter(|c| !c.is_empty());
    }
    let info = body.get("page_info").or_else(|| body.get("pageInfo"))?;
    let has_next = info
        .get("has_next_page")
        .or_else(|| info.get("hasNextPage"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !has_next {
        return None;
    }
    info.get("end_cursor")
        .or_else(|| info.get("endCursor"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    fn surface(&self) -> ApiSurface {
        self.surface
    }

    #[instrument(skip(self), fields(surface = %self.surface))]
    async fn fetch_entity(
        &self,
        entity_type: &EntityType,
        external_id: &str,
    ) -> Result<Option<UpstreamRecord>, UpstreamError> {
        let url = format!("{}/{}/{}", self.base_url, entity_type, external_id);
        let response = self.send(self.authorized(self.http_client.get(&url))).await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("upstream reports entity missing");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(classify(response).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;
        self.decode_record(unwrap_envelope(body)).map(Some)
    }

    #[instrument(skip(self), fields(surface = %self.surface))]
    async fn list_page(
        &self,
        entity_type: &EntityType,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<UpstreamPage, UpstreamError> {
        let url = format!("{}/{}", self.base_url, entity_type);
        let mut request = self.http_client.get(&url).query(&[("limit", limit.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        let response = self.send(self.authorized(request)).await?;
        if !response.status().is_success() {
            return Err(classify(response).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;

        let items = body
            .get("items")
            .or_else(|| body.get(entity_type.as_str()))
            .and_then(Value::as_array)
            .ok_or_else(|| UpstreamError::Decode(format!("listing has no '{entity_type}' or 'items' array")))?;

        let records = items
            .iter()
            .cloned()
            .map(|item| self.decode_record(item))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(UpstreamPage {
            records,
            next_cursor: next_cursor(&body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn client(base_url: String) -> HttpUpstreamClient {
        let config = UpstreamConfig {
            base_url,
            access_token: Some("secret-token".to_string()),
            timeout_ms: 2_000,
            ..Default::default()
        };
        HttpUpstreamClient::new(&config, VersionSource::Sequence).unwrap()
    }

    fn products() -> EntityType {
        EntityType::new("products").unwrap()
    }

    #[tokio::test]
    async fn test_fetch_entity_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/products/42")
            .match_header("x-upstream-access-token", "secret-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"id": 42, "version": 7, "title": "Kora Session"}).to_string())
            .create_async()
            .await;

        let record = client(server.url()).fetch_entity(&products(), "42").await.unwrap().unwrap();
        assert_eq!(record.external_id, "42");
        assert_eq!(record.version, 7);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_entity_unwraps_data_envelope() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/products/7")
            .with_status(200)
            .with_body(json!({"data": {"id": "7", "version": 1}}).to_string())
            .create_async()
            .await;

        let record = client(server.url()).fetch_entity(&products(), "7").await.unwrap().unwrap();
        assert_eq!(record.external_id, "7");
    }

    #[tokio::test]
    async fn test_status_classification() {
        let mut server = Server::new_async().await;
        server.mock("GET", "/products/missing").with_status(404).create_async().await;
        server
            .mock("GET", "/products/busy")
            .with_status(429)
            .with_header("retry-after", "2")
            .create_async()
            .await;
        server.mock("GET", "/products/down").with_status(503).create_async().await;
        server.mock("GET", "/products/bad").with_status(403).with_body("forbidden").create_async().await;

        let client = client(server.url());
        assert!(client.fetch_entity(&products(), "missing").await.unwrap().is_none());
        assert_eq!(
            client.fetch_entity(&products(), "busy").await.unwrap_err(),
            UpstreamError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );
        let down = client.fetch_entity(&products(), "down").await.unwrap_err();
        assert!(matches!(down, UpstreamError::Unavailable(_)));
        assert!(down.is_transient());
        let bad = client.fetch_entity(&products(), "bad").await.unwrap_err();
        assert!(matches!(bad, UpstreamError::Rejected { status: 403, .. }));
        assert!(!bad.is_transient());
    }

    #[tokio::test]
    async fn test_list_page_with_page_info() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/products")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("limit".into(), "2".into()),
                Matcher::UrlEncoded("cursor".into(), "abc".into()),
            ]))
            .with_status(200)
            .with_body(
                json!({
                    "products": [{"id": 1, "version": 3}, {"id": 2, "version": 4}],
                    "pageInfo": {"hasNextPage": true, "endCursor": "def"}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let page = client(server.url()).list_page(&products(), Some("abc"), 2).await.unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[1].version, 4);
        assert_eq!(page.next_cursor.as_deref(), Some("def"));
    }

    #[tokio::test]
    async fn test_list_last_page_has_no_cursor() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/products")
            .match_query(Matcher::UrlEncoded("limit".into(), "50".into()))
            .with_status(200)
            .with_body(json!({"items": [], "next_cursor": null}).to_string())
            .create_async()
            .await;

        let page = client(server.url()).list_page(&products(), None, 50).await.unwrap();
        assert!(page.records.is_empty());
        assert!(page.next_cursor.is_none());
    }
}
