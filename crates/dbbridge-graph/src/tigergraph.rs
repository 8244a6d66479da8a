//! TigerGraph connector over REST++ and the GSQL server
//!
//! Plain text runs as an interpreted GSQL query. JSON requests select one of
//! `installed_query`, `interpret`, `vertex`, `edge` or `restpp`:
//!
//! ```json
//! {"operation": "edge", "type": "transfer", "source_type": "Account", "source_id": "a1"}
//! ```

use async_trait::async_trait;
use dbbridge_core::operation::require_non_empty;
use dbbridge_core::{
    decode_operation_value, BackendType, Connectable, ConnectorContext, ConnectorError,
    CredentialSpec, FieldSpec, OperationSet, QueryInput, Queryable, RestClient, Result,
    SchemaIntrospectable, UrlSpec,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error};

const TIGERGRAPH_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::TigerGraph,
    url: Some(UrlSpec::field("endpoint", &["connection_string", "url"])),
    fields: &[
        FieldSpec::optional("endpoint"),
        FieldSpec::optional("host")
            .aliases(&["hostname"])
            .env("TIGERGRAPH_HOST")
            .default_value("localhost"),
        FieldSpec::optional("port").default_value("9000"),
        FieldSpec::optional("graph")
            .aliases(&["graph_name"])
            .default_value("default"),
        FieldSpec::optional("token").aliases(&["api_token"]).secret(),
        FieldSpec::optional("username").aliases(&["user"]),
        FieldSpec::optional("password").secret(),
        FieldSpec::optional("secret").secret(),
    ],
};

/// Lifetime requested for tokens exchanged from a secret, in seconds
const TOKEN_LIFETIME: &str = "1000000";

#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
enum TigerGraphOperation {
    InstalledQuery {
        query_name: String,
        #[serde(default)]
        params: Map<String, Value>,
    },
    Interpret {
        gsql: String,
    },
    Vertex {
        #[serde(rename = "type")]
        vertex_type: String,
        #[serde(default)]
        id: Option<String>,
    },
    Edge {
        #[serde(rename = "type")]
        edge_type: String,
        source_type: String,
        source_id: String,
        #[serde(default)]
        target_type: Option<String>,
        #[serde(default)]
        target_id: Option<String>,
    },
    Restpp {
        endpoint: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        params: Map<String, Value>,
        #[serde(default)]
        body: Option<Value>,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

impl OperationSet for TigerGraphOperation {
    const OPERATIONS: &'static [&'static str] =
        &["installed_query", "interpret", "vertex", "edge", "restpp"];

    fn validate(&self) -> Result<()> {
        match self {
            TigerGraphOperation::InstalledQuery { query_name, .. } => {
                require_non_empty("query_name", query_name)
            }
            TigerGraphOperation::Interpret { gsql } => require_non_empty("gsql", gsql),
            TigerGraphOperation::Vertex { vertex_type, .. } => {
                require_non_empty("type", vertex_type)
            }
            TigerGraphOperation::Edge {
                edge_type,
                source_type,
                source_id,
                target_type,
                target_id,
            } => {
                require_non_empty("type", edge_type)?;
                require_non_empty("source_type", source_type)?;
                require_non_empty("source_id", source_id)?;
                if target_id.is_some() && target_type.is_none() {
                    return Err(ConnectorError::invalid_request(
                        "Field 'target_id' requires 'target_type'",
                    ));
                }
                Ok(())
            }
            TigerGraphOperation::Restpp { endpoint, method, .. } => {
                require_non_empty("endpoint", endpoint)?;
                Method::from_bytes(method.to_uppercase().as_bytes()).map_err(|_| {
                    ConnectorError::invalid_request(format!("Invalid HTTP method '{}'", method))
                })?;
                Ok(())
            }
        }
    }
}

enum Auth {
    None,
    Bearer,
    Basic { username: String, password: String },
}

struct TigerGraphClient {
    rest: RestClient,
    graph: String,
    auth: Auth,
}

impl TigerGraphClient {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.rest.request(method, path);
        match &self.auth {
            Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
            Auth::None | Auth::Bearer => request,
        }
    }

    /// REST++ wraps payloads as `{"error", "message", "results"}`
    async fn restpp(&self, request: RequestBuilder) -> Result<Value> {
        let response = self.rest.send(request).await?;
        if response.get("error").and_then(Value::as_bool) == Some(true) {
            let message = response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            return Err(ConnectorError::query(message));
        }
        Ok(match response {
            Value::Object(mut map) if map.contains_key("results") => {
                map.remove("results").unwrap_or(Value::Null)
            }
            other => other,
        })
    }

    async fn interpret(&self, gsql: &str) -> Result<Value> {
        let request = self
            .request(Method::POST, "/gsqlserver/interpreted_query")
            .query(&[("graph", self.graph.as_str())])
            .body(gsql.to_string());
        self.restpp(request).await
    }

    async fn run(&self, operation: TigerGraphOperation) -> Result<Value> {
        let graph = segment(&self.graph);
        match operation {
            TigerGraphOperation::InstalledQuery { query_name, params } => {
                let path = format!("/query/{}/{}", graph, segment(&query_name));
                let request = self.request(Method::GET, &path).query(&query_pairs(&params));
                self.restpp(request).await
            }
            TigerGraphOperation::Interpret { gsql } => self.interpret(&gsql).await,
            TigerGraphOperation::Vertex { vertex_type, id } => {
                let mut path = format!("/graph/{}/vertices/{}", graph, segment(&vertex_type));
                if let Some(id) = id {
                    path.push('/');
                    path.push_str(&segment(&id));
                }
                self.restpp(self.request(Method::GET, &path)).await
            }
            TigerGraphOperation::Edge {
                edge_type,
                source_type,
                source_id,
                target_type,
                target_id,
            } => {
                let mut path = format!(
                    "/graph/{}/edges/{}/{}/{}",
                    graph,
                    segment(&source_type),
                    segment(&source_id),
                    segment(&edge_type)
                );
                for part in [target_type, target_id].into_iter().flatten() {
                    path.push('/');
                    path.push_str(&segment(&part));
                }
                self.restpp(self.request(Method::GET, &path)).await
            }
            TigerGraphOperation::Restpp {
                endpoint,
                method,
                params,
                body,
            } => {
                let method = Method::from_bytes(method.to_uppercase().as_bytes())
                    .map_err(|_| ConnectorError::invalid_request("Invalid HTTP method"))?;
                let mut request = self.request(method, &endpoint).query(&query_pairs(&params));
                if let Some(body) = body {
                    request = request.json(&body);
                }
                self.restpp(request).await
            }
        }
    }
}

pub struct TigerGraphConnector {
    ctx: ConnectorContext,
    client: Option<TigerGraphClient>,
}

impl TigerGraphConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx, client: None }
    }

    fn client(&self) -> Result<&TigerGraphClient> {
        self.client
            .as_ref()
            .ok_or_else(|| ConnectorError::connection("TigerGraph", "not connected"))
    }

    async fn build_client(&self) -> Result<TigerGraphClient> {
        let params = self.ctx.resolve(&TIGERGRAPH_SPEC)?;
        let base_url = match params.get("endpoint") {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!(
                "http://{}:{}",
                params.require("host")?,
                params.port("port", 9000)?
            ),
        };
        let graph = params.require("graph")?.to_string();
        let timeout = self.ctx.connect_timeout();

        let token = match (params.get("token"), params.get("secret")) {
            (Some(token), _) => Some(token.to_string()),
            (None, Some(secret)) => {
                let exchange = RestClient::with_headers(
                    BackendType::TigerGraph,
                    base_url.as_str(),
                    HeaderMap::new(),
                    timeout,
                )?;
                Some(request_token(&exchange, secret).await?)
            }
            (None, None) => None,
        };

        let mut headers = HeaderMap::new();
        let auth = match token {
            Some(token) => {
                let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                    ConnectorError::connection("TigerGraph", "token contains invalid characters")
                })?;
                headers.insert(AUTHORIZATION, value);
                Auth::Bearer
            }
            None => match (params.get("username"), params.get("password")) {
                (Some(username), Some(password)) => Auth::Basic {
                    username: username.to_string(),
                    password: password.to_string(),
                },
                _ => Auth::None,
            },
        };

        let rest =
            RestClient::with_headers(BackendType::TigerGraph, base_url, headers, timeout)?;
        Ok(TigerGraphClient { rest, graph, auth })
    }
}

/// Exchange a graph secret for a REST++ bearer token
async fn request_token(exchange: &RestClient, secret: &str) -> Result<String> {
    debug!("Requesting TigerGraph token from secret");
    let request = exchange
        .get("/requesttoken")
        .query(&[("secret", secret), ("lifetime", TOKEN_LIFETIME)]);
    let response = exchange.send(request).await.map_err(|e| {
        error!("TigerGraph token exchange failed: {}", e);
        ConnectorError::connection("TigerGraph", format!("Authentication failed: {}", e))
    })?;

    // Newer servers nest the token under `results`
    response
        .get("token")
        .or_else(|| response.get("results").and_then(|r| r.get("token")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            ConnectorError::connection("TigerGraph", "Authentication failed: no token in response")
        })
}

#[async_trait]
impl Connectable for TigerGraphConnector {
    fn backend(&self) -> BackendType {
        BackendType::TigerGraph
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        let client = self.build_client().await?;
        debug!("Connecting to TigerGraph at {}", client.rest.base_url());
        client
            .rest
            .send(client.request(Method::GET, "/endpoints"))
            .await?;
        self.client = Some(client);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

#[async_trait]
impl Queryable for TigerGraphConnector {
    async fn run_query(&mut self, query: &str) -> Result<Value> {
        match QueryInput::parse(query) {
            QueryInput::Text(gsql) => {
                if gsql.is_empty() {
                    return Err(ConnectorError::invalid_request("Query is empty"));
                }
                self.client()?.interpret(&gsql).await
            }
            QueryInput::Json(value) => {
                let operation: TigerGraphOperation = decode_operation_value(value)?;
                self.client()?.run(operation).await
            }
        }
    }
}

#[async_trait]
impl SchemaIntrospectable for TigerGraphConnector {
    async fn fetch_schema(&mut self) -> Result<Value> {
        let client = self.client()?;
        let request = client
            .request(Method::GET, "/gsqlserver/gsql/schema")
            .query(&[("graph", client.graph.as_str())]);
        let schema = client.restpp(request).await?;
        Ok(graph_schema(&schema, &client.graph))
    }
}

/// Reduce a GSQL schema document to vertex and edge types with their attributes
fn graph_schema(schema: &Value, graph: &str) -> Value {
    let text = |obj: &Value, keys: &[&str]| -> String {
        keys.iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string()
    };
    let attributes = |obj: &Value| -> Vec<Value> {
        obj.get("Attributes")
            .or_else(|| obj.get("attributes"))
            .and_then(Value::as_array)
            .map(|attrs| {
                attrs
                    .iter()
                    .map(|attr| {
                        let attr_type = attr
                            .get("AttributeType")
                            .or_else(|| attr.get("attributeType"))
                            .map(|t| text(t, &["Name", "name"]))
                            .unwrap_or_default();
                        json!({
                            "name": text(attr, &["AttributeName", "attributeName"]),
                            "type": attr_type,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    };
    let types = |key: &str| -> Vec<&Value> {
        schema
            .get(key)
            .and_then(Value::as_array)
            .map(|items| items.iter().collect())
            .unwrap_or_default()
    };

    let vertex_types: Vec<Value> = types("VertexTypes")
        .into_iter()
        .map(|v| json!({ "name": text(v, &["Name", "name"]), "attributes": attributes(v) }))
        .collect();
    let edge_types: Vec<Value> = types("EdgeTypes")
        .into_iter()
        .map(|e| {
            json!({
                "name": text(e, &["Name", "name"]),
                "from": text(e, &["FromVertexTypeName", "fromVertexTypeName"]),
                "to": text(e, &["ToVertexTypeName", "toVertexTypeName"]),
                "attributes": attributes(e),
            })
        })
        .collect();

    json!({
        "vertex_types": vertex_types,
        "edge_types": edge_types,
        "graph_name": graph,
    })
}

fn segment(part: &str) -> String {
    urlencoding::encode(part).into_owned()
}

fn query_pairs(params: &Map<String, Value>) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbbridge_core::{normalize, Connector, Credentials, EntityKind, ErrorKind};
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector(url: &str, creds: Credentials) -> TigerGraphConnector {
        let creds = creds.with("endpoint", url).with("graph", "social");
        TigerGraphConnector::new(ConnectorContext::new(creds))
    }

    async fn mount_endpoints(mock_server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/endpoints"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(mock_server)
            .await;
    }

    #[tokio::test]
    async fn test_secret_is_exchanged_for_bearer_token() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/requesttoken"))
            .and(query_param("secret", "s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok-1"})))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/endpoints"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&mock_server)
            .await;

        let mut tg = connector(&mock_server.uri(), Credentials::new().with("secret", "s3cret"));
        let (ok, message) = tg.test_connection().await;
        assert!(ok, "{}", message);
    }

    #[tokio::test]
    async fn test_vertex_and_edge_paths() {
        let mock_server = MockServer::start().await;
        mount_endpoints(&mock_server).await;
        Mock::given(method("GET"))
            .and(path("/graph/social/vertices/Person/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": false, "message": "",
                "results": [{"v_id": "p1", "v_type": "Person", "attributes": {"name": "Ada"}}]
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/graph/social/edges/Person/p1/follows"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": false, "results": [{"from_id": "p1", "to_id": "p2"}]
            })))
            .mount(&mock_server)
            .await;

        let mut tg = connector(&mock_server.uri(), Credentials::new());
        let result = tg
            .execute_query(r#"{"operation": "vertex", "type": "Person", "id": "p1"}"#)
            .await;
        assert_eq!(result.data.unwrap()[0]["attributes"]["name"], "Ada");

        let result = tg
            .execute_query(
                r#"{"operation": "edge", "type": "follows", "source_type": "Person", "source_id": "p1"}"#,
            )
            .await;
        assert_eq!(result.data, Some(json!([{"from_id": "p1", "to_id": "p2"}])));
    }

    #[tokio::test]
    async fn test_text_runs_interpreted_gsql() {
        let mock_server = MockServer::start().await;
        mount_endpoints(&mock_server).await;
        Mock::given(method("POST"))
            .and(path("/gsqlserver/interpreted_query"))
            .and(query_param("graph", "social"))
            .and(body_string("INTERPRET QUERY () FOR GRAPH social { PRINT 1; }"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": false, "results": [{"1": 1}]
            })))
            .mount(&mock_server)
            .await;

        let mut tg = connector(&mock_server.uri(), Credentials::new());
        let result = tg
            .execute_query("INTERPRET QUERY () FOR GRAPH social { PRINT 1; }")
            .await;
        assert_eq!(result.data, Some(json!([{"1": 1}])));
    }

    #[tokio::test]
    async fn test_restpp_error_flag_fails_query() {
        let mock_server = MockServer::start().await;
        mount_endpoints(&mock_server).await;
        Mock::given(method("GET"))
            .and(path("/query/social/missing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": true, "message": "Endpoint is not found", "code": "REST-1000"
            })))
            .mount(&mock_server)
            .await;

        let mut tg = connector(&mock_server.uri(), Credentials::new());
        let result = tg
            .execute_query(r#"{"operation": "installed_query", "query_name": "missing"}"#)
            .await;
        assert_eq!(result.kind, Some(ErrorKind::QueryExecution));
        assert!(result.error.unwrap().contains("Endpoint is not found"));
    }

    #[test]
    fn test_operation_validation() {
        let decode = |q: &str| decode_operation_value::<TigerGraphOperation>(serde_json::from_str(q).unwrap());

        let err = decode(r#"{"operation": "drop_graph"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);

        let err = decode(r#"{"operation": "edge", "type": "follows", "source_type": "Person", "source_id": ""}"#)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperationRequest);

        let err = decode(r#"{"operation": "edge", "type": "follows", "source_type": "Person", "source_id": "p1", "target_id": "p2"}"#)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperationRequest);

        let err = decode(r#"{"operation": "restpp", "endpoint": "/echo", "method": "GE T"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperationRequest);

        assert!(decode(r#"{"operation": "restpp", "endpoint": "/echo"}"#).is_ok());
    }

    #[test]
    fn test_schema_normalizes_vertices_and_edges() {
        let raw = json!({
            "VertexTypes": [
                {"Name": "Person", "Attributes": [
                    {"AttributeName": "name", "AttributeType": {"Name": "STRING"}}
                ]}
            ],
            "EdgeTypes": [
                {"Name": "follows", "FromVertexTypeName": "Person", "ToVertexTypeName": "Person", "Attributes": []}
            ]
        });
        let schema = graph_schema(&raw, "social");
        assert_eq!(schema["edge_types"][0]["from"], "Person");
        assert_eq!(schema["graph_name"], "social");

        let tree = normalize("tigergraph", &schema);
        let person = tree.entity("Person").unwrap();
        assert_eq!(person.kind, EntityKind::Node);
        assert_eq!(person.fields[0].field_type, "STRING");
        assert_eq!(tree.entity("follows").unwrap().kind, EntityKind::Relationship);
    }
}
