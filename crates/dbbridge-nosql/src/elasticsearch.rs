//! Elasticsearch connector over the REST API
//!
//! Responses are returned as Elasticsearch sends them.

use async_trait::async_trait;
use dbbridge_core::operation::require_non_empty;
use dbbridge_core::{
    decode_operation, BackendType, Connectable, ConnectorContext, ConnectorError, CredentialSpec,
    FieldSpec, OperationSet, Queryable, RestClient, Result, SchemaIntrospectable, UrlSpec,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

const ELASTICSEARCH_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::Elasticsearch,
    url: Some(UrlSpec::field("url", &["connection_string", "url"]).env("ELASTICSEARCH_URL")),
    fields: &[
        FieldSpec::optional("url"),
        FieldSpec::optional("host")
            .aliases(&["hostname"])
            .default_value("localhost"),
        FieldSpec::optional("port").default_value("9200"),
        FieldSpec::optional("username").aliases(&["user"]),
        FieldSpec::optional("password").secret(),
        FieldSpec::optional("api_key").secret(),
    ],
};

fn default_size() -> u64 {
    10
}

#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
enum EsOperation {
    Search {
        index: String,
        #[serde(default)]
        body: Option<Value>,
        #[serde(default = "default_size")]
        size: u64,
    },
    Count {
        index: String,
        #[serde(default)]
        body: Option<Value>,
    },
    Index {
        index: String,
        document: Value,
        #[serde(default)]
        id: Option<String>,
    },
    Update {
        index: String,
        #[serde(default)]
        id: String,
        document: Value,
    },
    Delete {
        index: String,
        #[serde(default)]
        id: String,
    },
}

impl OperationSet for EsOperation {
    const OPERATIONS: &'static [&'static str] = &["search", "count", "index", "update", "delete"];

    fn validate(&self) -> Result<()> {
        match self {
            EsOperation::Search { index, .. }
            | EsOperation::Count { index, .. }
            | EsOperation::Index { index, .. } => require_non_empty("index", index),
            EsOperation::Update { index, id, .. } => {
                require_non_empty("index", index)?;
                if id.trim().is_empty() {
                    return Err(ConnectorError::invalid_request(
                        "Update operation requires document ID",
                    ));
                }
                Ok(())
            }
            EsOperation::Delete { index, id } => {
                require_non_empty("index", index)?;
                if id.trim().is_empty() {
                    return Err(ConnectorError::invalid_request(
                        "Delete operation requires document ID",
                    ));
                }
                Ok(())
            }
        }
    }
}

struct EsClient {
    rest: RestClient,
    basic: Option<(String, String)>,
}

impl EsClient {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.rest.request(method, path);
        match &self.basic {
            Some((username, password)) => request.basic_auth(username, Some(password)),
            None => request,
        }
    }
}

pub struct ElasticsearchConnector {
    ctx: ConnectorContext,
    client: Option<EsClient>,
}

impl ElasticsearchConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx, client: None }
    }

    fn build_client(&self) -> Result<EsClient> {
        let params = self.ctx.resolve(&ELASTICSEARCH_SPEC)?;
        let base_url = match params.get("url") {
            Some(url) => url.to_string(),
            None => format!(
                "http://{}:{}",
                params.require("host")?,
                params.port("port", 9200)?
            ),
        };

        let mut headers = HeaderMap::new();
        let mut basic = None;
        if let Some(api_key) = params.get("api_key") {
            let value = HeaderValue::from_str(&format!("ApiKey {}", api_key))
                .map_err(|e| ConnectorError::connection("Elasticsearch", e))?;
            headers.insert(AUTHORIZATION, value);
        } else if let (Some(username), Some(password)) =
            (params.get("username"), params.get("password"))
        {
            basic = Some((username.to_string(), password.to_string()));
        }

        let rest = RestClient::with_headers(
            BackendType::Elasticsearch,
            base_url,
            headers,
            self.ctx.connect_timeout(),
        )?;
        Ok(EsClient { rest, basic })
    }

    fn client(&self) -> Result<&EsClient> {
        self.client
            .as_ref()
            .ok_or_else(|| ConnectorError::connection("Elasticsearch", "not connected"))
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let client = self.client()?;
        let mut request = client.request(method, path);
        if let Some(body) = body {
            request = request.json(&body);
        }
        client.rest.send(request).await
    }
}

#[async_trait]
impl Connectable for ElasticsearchConnector {
    fn backend(&self) -> BackendType {
        BackendType::Elasticsearch
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        let client = self.build_client()?;
        debug!("Connecting to Elasticsearch at {}", client.rest.base_url());

        client.rest.send(client.request(Method::GET, "/")).await?;

        self.client = Some(client);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

#[async_trait]
impl Queryable for ElasticsearchConnector {
    fn prepare(&self, query: &str) -> Result<()> {
        decode_operation::<EsOperation>(query).map(|_| ())
    }

    async fn run_query(&mut self, query: &str) -> Result<Value> {
        let operation: EsOperation = decode_operation(query)?;

        match operation {
            EsOperation::Search { index, body, size } => {
                let path = format!("/{}/_search?size={}", segment(&index), size);
                self.send(Method::POST, &path, Some(body.unwrap_or_else(|| json!({}))))
                    .await
            }
            EsOperation::Count { index, body } => {
                let path = format!("/{}/_count", segment(&index));
                self.send(Method::POST, &path, body).await
            }
            EsOperation::Index {
                index,
                document,
                id,
            } => match id.filter(|id| !id.trim().is_empty()) {
                Some(id) => {
                    let path = format!("/{}/_doc/{}", segment(&index), segment(&id));
                    self.send(Method::PUT, &path, Some(document)).await
                }
                None => {
                    let path = format!("/{}/_doc", segment(&index));
                    self.send(Method::POST, &path, Some(document)).await
                }
            },
            EsOperation::Update {
                index,
                id,
                document,
            } => {
                let path = format!("/{}/_update/{}", segment(&index), segment(&id));
                self.send(Method::POST, &path, Some(json!({ "doc": document })))
                    .await
            }
            EsOperation::Delete { index, id } => {
                let path = format!("/{}/_doc/{}", segment(&index), segment(&id));
                self.send(Method::DELETE, &path, None).await
            }
        }
    }
}

#[async_trait]
impl SchemaIntrospectable for ElasticsearchConnector {
    async fn fetch_schema(&mut self) -> Result<Value> {
        let mappings = self.send(Method::GET, "/_mapping", None).await?;
        let indices: Vec<Value> = mappings
            .as_object()
            .map(|indices| {
                indices
                    .iter()
                    .filter(|(name, _)| !name.starts_with('.'))
                    .map(|(name, data)| {
                        json!({
                            "name": name,
                            "mappings": data.get("mappings").cloned().unwrap_or_else(|| json!({})),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(json!({ "indices": indices }))
    }
}

fn segment(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbbridge_core::{normalize, Connector, Credentials, ErrorKind};
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn server() -> MockServer {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"version": {"number": "8.13.0"}})),
            )
            .mount(&mock_server)
            .await;
        mock_server
    }

    fn connector(url: &str) -> ElasticsearchConnector {
        let creds = Credentials::new().with("url", url);
        ElasticsearchConnector::new(ConnectorContext::new(creds))
    }

    #[tokio::test]
    async fn test_search_passes_size_and_body() {
        let mock_server = server().await;
        Mock::given(method("POST"))
            .and(path("/logs/_search"))
            .and(query_param("size", "5"))
            .and(body_json(json!({"query": {"match_all": {}}})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"hits": {"total": {"value": 0}, "hits": []}})),
            )
            .mount(&mock_server)
            .await;

        let mut es = connector(&mock_server.uri());
        let result = es
            .execute_query(
                r#"{"operation":"search","index":"logs","size":5,"body":{"query":{"match_all":{}}}}"#,
            )
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.data.unwrap()["hits"]["total"]["value"], json!(0));
    }

    #[tokio::test]
    async fn test_index_with_and_without_id() {
        let mock_server = server().await;
        Mock::given(method("PUT"))
            .and(path("/users/_doc/42"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"result": "created", "_id": "42"})))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/users/_doc"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"result": "created", "_id": "x1"})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut es = connector(&mock_server.uri());
        let with_id = es
            .execute_query(r#"{"operation":"index","index":"users","id":"42","document":{"a":1}}"#)
            .await;
        assert_eq!(with_id.data.unwrap()["_id"], json!("42"));
        let without_id = es
            .execute_query(r#"{"operation":"index","index":"users","document":{"a":1}}"#)
            .await;
        assert_eq!(without_id.data.unwrap()["_id"], json!("x1"));
    }

    #[tokio::test]
    async fn test_update_wraps_doc_and_api_key_header() {
        let mock_server = server().await;
        Mock::given(method("POST"))
            .and(path("/users/_update/7"))
            .and(header("authorization", "ApiKey abc"))
            .and(body_json(json!({"doc": {"name": "b"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "updated"})))
            .mount(&mock_server)
            .await;

        let creds = Credentials::new()
            .with("connection_string", mock_server.uri())
            .with("api_key", "abc");
        let mut es = ElasticsearchConnector::new(ConnectorContext::new(creds));
        let result = es
            .execute_query(r#"{"operation":"update","index":"users","id":"7","document":{"name":"b"}}"#)
            .await;
        assert_eq!(result.data, Some(json!({"result": "updated"})));
    }

    #[tokio::test]
    async fn test_delete_requires_id_without_request() {
        let mock_server = MockServer::start().await;
        let mut es = connector(&mock_server.uri());
        let result = es
            .execute_query(r#"{"operation":"delete","index":"users"}"#)
            .await;
        assert_eq!(result.kind, Some(ErrorKind::InvalidOperationRequest));
        assert_eq!(result.error.as_deref(), Some("Delete operation requires document ID"));
        assert!(mock_server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_api_error_keeps_status() {
        let mock_server = server().await;
        Mock::given(method("POST"))
            .and(path("/missing/_count"))
            .respond_with(ResponseTemplate::new(404).set_body_string("index_not_found_exception"))
            .mount(&mock_server)
            .await;

        let mut es = connector(&mock_server.uri());
        let result = es
            .execute_query(r#"{"operation":"count","index":"missing"}"#)
            .await;
        assert_eq!(result.kind, Some(ErrorKind::QueryExecution));
        assert!(result.error.unwrap().contains("index_not_found_exception"));
    }

    #[tokio::test]
    async fn test_schema_lists_visible_indices() {
        let mock_server = server().await;
        Mock::given(method("GET"))
            .and(path("/_mapping"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                ".kibana": {"mappings": {}},
                "users": {"mappings": {"properties": {
                    "name": {"type": "text"},
                    "age": {"type": "integer"}
                }}}
            })))
            .mount(&mock_server)
            .await;

        let mut es = connector(&mock_server.uri());
        let schema = es.get_schema().await;
        assert_eq!(schema["indices"].as_array().unwrap().len(), 1);

        let tree = normalize("elasticsearch", &schema);
        let users = tree.entity("users").unwrap();
        let age = users.fields.iter().find(|f| f.name == "age").unwrap();
        assert_eq!(age.field_type, "integer");
    }
}
