//! Thin JSON-over-HTTP client shared by the REST connectors

use crate::backend::BackendType;
use crate::connector::HTTP_TIMEOUT;
use crate::error::{ConnectorError, Result};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// HTTP handle of one REST connector
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    backend: BackendType,
}

impl RestClient {
    pub fn new(backend: BackendType, base_url: impl Into<String>) -> Result<Self> {
        Self::with_headers(backend, base_url, HeaderMap::new(), Duration::from_secs(10))
    }

    /// Client sending `headers` on every request
    pub fn with_headers(
        backend: BackendType,
        base_url: impl Into<String>,
        headers: HeaderMap,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(connect_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| {
                ConnectorError::connection(
                    backend.display_name(),
                    format!("Failed to create HTTP client: {}", e),
                )
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            backend,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn http(&self) -> &Client {
        &self.client
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        debug!("{} API request: {} {}", self.backend.display_name(), method, path);
        self.client.request(method, self.url(path))
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.request(Method::POST, path)
    }

    /// Send and decode a JSON body. Empty bodies decode to `null`.
    pub async fn send(&self, request: RequestBuilder) -> Result<Value> {
        let text = self.send_text(request).await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            ConnectorError::query(format!(
                "Failed to parse {} response: {} - Body: {}",
                self.backend.display_name(),
                e,
                truncate(&text, 512)
            ))
        })
    }

    /// Send and return the raw body of a successful response
    pub async fn send_text(&self, request: RequestBuilder) -> Result<String> {
        let response = request.send().await.map_err(|e| {
            ConnectorError::query(format!(
                "{} API request failed: {}",
                self.backend.display_name(),
                e
            ))
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            ConnectorError::query(format!(
                "Failed to read {} response: {}",
                self.backend.display_name(),
                e
            ))
        })?;

        if !status.is_success() {
            return Err(ConnectorError::query(format!(
                "{} API returned status {}: {}",
                self.backend.display_name(),
                status,
                truncate(&body, 1024)
            )));
        }

        Ok(body)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_url_joining() {
        let client = RestClient::new(BackendType::Supabase, "https://x.supabase.co/").unwrap();
        assert_eq!(client.url("/rest/v1/t"), "https://x.supabase.co/rest/v1/t");
        assert_eq!(client.url("rest/v1/t"), "https://x.supabase.co/rest/v1/t");
        assert_eq!(client.url("http://other/x"), "http://other/x");
    }

    #[tokio::test]
    async fn test_send_decodes_json_and_reports_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .and(header("X-Test", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"a": 1})))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such index"))
            .mount(&mock_server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&mock_server)
            .await;

        let client = RestClient::new(BackendType::Elasticsearch, mock_server.uri()).unwrap();

        let value = client
            .send(client.get("/ok").header("X-Test", "1"))
            .await
            .unwrap();
        assert_eq!(value, json!({"a": 1}));

        let err = client.send(client.get("/missing")).await.unwrap_err();
        assert!(err.to_string().contains("404"));
        assert!(err.to_string().contains("no such index"));

        let value = client
            .send(client.request(Method::DELETE, "/empty"))
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
    }
}
