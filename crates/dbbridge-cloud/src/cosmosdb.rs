//! Azure Cosmos DB (NoSQL API) connector over the REST API
//!
//! Every request carries a master-key signature over the verb, resource type,
//! resource link and date. Operations:
//!
//! ```json
//! {"operation": "query", "database": "shop", "container": "orders",
//!  "query_text": "SELECT * FROM c WHERE c.status = @s",
//!  "parameters": [{"name": "@s", "value": "open"}]}
//! ```

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use dbbridge_core::operation::require_non_empty;
use dbbridge_core::{
    decode_operation, BackendType, Connectable, ConnectorContext, ConnectorError, CredentialSpec,
    FieldSpec, OperationSet, Queryable, RestClient, Result, SchemaIntrospectable,
};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, error};

type HmacSha256 = Hmac<Sha256>;

const COSMOS_API_VERSION: &str = "2018-12-31";

const COSMOS_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::CosmosDb,
    url: None,
    fields: &[
        FieldSpec::required("account_uri")
            .aliases(&["endpoint", "uri"])
            .env("COSMOS_ENDPOINT"),
        FieldSpec::required("primary_key")
            .aliases(&["key", "master_key"])
            .env("COSMOS_KEY")
            .secret(),
        FieldSpec::optional("database").aliases(&["database_name"]),
        FieldSpec::optional("container").aliases(&["container_name"]),
    ],
};

#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
enum CosmosOperation {
    Query {
        #[serde(flatten)]
        target: Target,
        query_text: String,
        #[serde(default)]
        parameters: Vec<Value>,
    },
    Get {
        #[serde(flatten)]
        target: Target,
        id: String,
        #[serde(default)]
        partition_key: Option<Value>,
    },
    Create {
        #[serde(flatten)]
        target: Target,
        body: Value,
        #[serde(default)]
        partition_key: Option<Value>,
    },
    Replace {
        #[serde(flatten)]
        target: Target,
        id: String,
        body: Value,
        #[serde(default)]
        partition_key: Option<Value>,
    },
    Delete {
        #[serde(flatten)]
        target: Target,
        #[serde(default)]
        id: String,
        #[serde(default)]
        partition_key: Option<Value>,
    },
}

#[derive(Debug, Deserialize)]
struct Target {
    database: String,
    container: String,
}

impl Target {
    fn link(&self) -> String {
        format!("dbs/{}/colls/{}", self.database, self.container)
    }
}

impl OperationSet for CosmosOperation {
    const OPERATIONS: &'static [&'static str] = &["query", "get", "create", "replace", "delete"];

    fn validate(&self) -> Result<()> {
        let target = match self {
            CosmosOperation::Query {
                target, query_text, ..
            } => {
                require_non_empty("query_text", query_text)?;
                target
            }
            CosmosOperation::Get { target, id, .. } => {
                require_non_empty("id", id)?;
                target
            }
            CosmosOperation::Create { target, body, .. } => {
                require_object("body", body)?;
                target
            }
            CosmosOperation::Replace {
                target, id, body, ..
            } => {
                require_non_empty("id", id)?;
                require_object("body", body)?;
                target
            }
            CosmosOperation::Delete { target, id, .. } => {
                if id.trim().is_empty() {
                    return Err(ConnectorError::invalid_request(
                        dbbridge_core::DELETE_REQUIRES_FILTERS,
                    ));
                }
                target
            }
        };
        require_non_empty("database", &target.database)?;
        require_non_empty("container", &target.container)
    }
}

fn require_object(field: &str, value: &Value) -> Result<()> {
    match value {
        Value::Object(map) if !map.is_empty() => Ok(()),
        _ => Err(ConnectorError::invalid_request(format!(
            "Field '{}' must be a non-empty object",
            field
        ))),
    }
}

/// `type=master&ver=1.0&sig=<base64 hmac>` URL-encoded, as the service expects
fn master_key_signature(
    key: &[u8],
    verb: &Method,
    resource_type: &str,
    resource_link: &str,
    date: &str,
) -> Result<String> {
    let payload = format!(
        "{}\n{}\n{}\n{}\n\n",
        verb.as_str().to_lowercase(),
        resource_type.to_lowercase(),
        resource_link,
        date.to_lowercase()
    );
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ConnectorError::connection(BackendType::CosmosDb.display_name(), format!("Invalid key: {}", e)))?;
    mac.update(payload.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());
    Ok(urlencoding::encode(&format!("type=master&ver=1.0&sig={}", signature)).into_owned())
}

fn partition_header(value: &Value) -> Result<HeaderValue> {
    HeaderValue::from_str(&json!([value]).to_string())
        .map_err(|_| ConnectorError::invalid_request("Invalid partition key"))
}

struct CosmosClient {
    rest: RestClient,
    key: Vec<u8>,
    database: Option<String>,
    container: Option<String>,
}

/// One signed call
struct CosmosRequest<'a> {
    method: Method,
    resource_type: &'a str,
    resource_link: String,
    headers: HeaderMap,
    body: Option<Value>,
}

impl<'a> CosmosRequest<'a> {
    fn new(method: Method, resource_type: &'a str, resource_link: impl Into<String>) -> Self {
        Self {
            method,
            resource_type,
            resource_link: resource_link.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Request path: the link itself for a resource, link plus type for a feed
    fn path(&self) -> String {
        let depth = self.resource_link.split('/').filter(|s| !s.is_empty()).count();
        if self.resource_link.is_empty() {
            format!("/{}", self.resource_type)
        } else if depth % 2 == 0 {
            format!("/{}", self.resource_link)
        } else {
            format!("/{}/{}", self.resource_link, self.resource_type)
        }
    }
}

impl CosmosClient {
    async fn send(&self, request: CosmosRequest<'_>) -> Result<Value> {
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let signature = master_key_signature(
            &self.key,
            &request.method,
            request.resource_type,
            &request.resource_link,
            &date,
        )?;

        let path = request.path();
        let mut builder = self
            .rest
            .request(request.method, &path)
            .headers(request.headers)
            .header("x-ms-date", date)
            .header("x-ms-version", COSMOS_API_VERSION)
            .header(AUTHORIZATION, signature);
        if let Some(body) = request.body {
            builder = builder.body(body.to_string());
        }
        self.rest.send(builder).await
    }

    /// Collect every page of a query feed
    async fn query(&self, target: &Target, query_text: &str, parameters: &[Value]) -> Result<Value> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/query+json"));
        headers.insert("x-ms-documentdb-isquery", HeaderValue::from_static("True"));
        headers.insert(
            "x-ms-documentdb-query-enablecrosspartition",
            HeaderValue::from_static("True"),
        );
        let mut request = CosmosRequest::new(Method::POST, "docs", target.link());
        request.headers = headers;
        request.body = Some(json!({ "query": query_text, "parameters": parameters }));

        let response = self.send(request).await?;
        Ok(response
            .get("Documents")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new())))
    }

    /// Partition key path of a container, e.g. `/customerId`
    async fn partition_path(&self, target: &Target) -> Result<Option<String>> {
        let container = self
            .send(CosmosRequest::new(Method::GET, "colls", target.link()))
            .await?;
        Ok(container["partitionKey"]["paths"][0]
            .as_str()
            .map(str::to_string))
    }

    /// Explicit key, else read from the document (or the id) through the container's key path
    async fn resolve_partition(
        &self,
        target: &Target,
        explicit: Option<Value>,
        id: Option<&str>,
        body: Option<&Value>,
    ) -> Result<Value> {
        if let Some(key) = explicit {
            return Ok(key);
        }
        let path = self.partition_path(target).await?.ok_or_else(|| {
            ConnectorError::invalid_request("Container has no partition key definition")
        })?;
        if let Some(value) = body.and_then(|b| b.pointer(&path)) {
            return Ok(value.clone());
        }
        match id {
            Some(id) if path == "/id" => Ok(json!(id)),
            _ => Err(ConnectorError::invalid_request(format!(
                "Field 'partition_key' is required for containers partitioned on {}",
                path
            ))),
        }
    }

    async fn run(&self, operation: CosmosOperation) -> Result<Value> {
        match operation {
            CosmosOperation::Query {
                target,
                query_text,
                parameters,
            } => self.query(&target, &query_text, &parameters).await,
            CosmosOperation::Get {
                target,
                id,
                partition_key,
            } => {
                let key = self
                    .resolve_partition(&target, partition_key, Some(&id), None)
                    .await?;
                let mut request =
                    CosmosRequest::new(Method::GET, "docs", format!("{}/docs/{}", target.link(), id));
                request
                    .headers
                    .insert("x-ms-documentdb-partitionkey", partition_header(&key)?);
                self.send(request).await
            }
            CosmosOperation::Create {
                target,
                body,
                partition_key,
            } => {
                let key = self
                    .resolve_partition(&target, partition_key, None, Some(&body))
                    .await?;
                let mut request = CosmosRequest::new(Method::POST, "docs", target.link());
                request
                    .headers
                    .insert("x-ms-documentdb-partitionkey", partition_header(&key)?);
                request.body = Some(body);
                self.send(request).await
            }
            CosmosOperation::Replace {
                target,
                id,
                mut body,
                partition_key,
            } => {
                if let Value::Object(map) = &mut body {
                    map.entry("id").or_insert_with(|| json!(id));
                }
                let key = self
                    .resolve_partition(&target, partition_key, Some(&id), Some(&body))
                    .await?;
                let mut request =
                    CosmosRequest::new(Method::PUT, "docs", format!("{}/docs/{}", target.link(), id));
                request
                    .headers
                    .insert("x-ms-documentdb-partitionkey", partition_header(&key)?);
                request.body = Some(body);
                self.send(request).await
            }
            CosmosOperation::Delete {
                target,
                id,
                partition_key,
            } => {
                let key = self
                    .resolve_partition(&target, partition_key, Some(&id), None)
                    .await?;
                let mut request = CosmosRequest::new(
                    Method::DELETE,
                    "docs",
                    format!("{}/docs/{}", target.link(), id),
                );
                request
                    .headers
                    .insert("x-ms-documentdb-partitionkey", partition_header(&key)?);
                self.send(request).await?;
                Ok(json!({ "status": "success" }))
            }
        }
    }

    fn ids(feed: &Value, key: &str) -> Vec<String> {
        feed[key]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item["id"].as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub struct CosmosDbConnector {
    ctx: ConnectorContext,
    client: Option<CosmosClient>,
}

impl CosmosDbConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx, client: None }
    }

    fn client(&self) -> Result<&CosmosClient> {
        self.client
            .as_ref()
            .ok_or_else(|| ConnectorError::connection(BackendType::CosmosDb.display_name(), "not connected"))
    }
}

#[async_trait]
impl Connectable for CosmosDbConnector {
    fn backend(&self) -> BackendType {
        BackendType::CosmosDb
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        let params = self.ctx.resolve(&COSMOS_SPEC)?;
        let key = STANDARD.decode(params.require("primary_key")?).map_err(|e| {
            ConnectorError::connection(BackendType::CosmosDb.display_name(), format!("Primary key is not valid base64: {}", e))
        })?;
        let endpoint = params.require("account_uri")?;
        let rest = RestClient::with_headers(
            BackendType::CosmosDb,
            endpoint,
            HeaderMap::new(),
            self.ctx.connect_timeout(),
        )?;
        let client = CosmosClient {
            rest,
            key,
            database: params.get("database").map(str::to_string),
            container: params.get("container").map(str::to_string),
        };

        debug!("Connecting to Cosmos DB at {}", client.rest.base_url());
        client
            .send(CosmosRequest::new(Method::GET, "dbs", ""))
            .await
            .map_err(|e| {
                error!("Cosmos DB connection check failed: {}", e);
                e
            })?;
        self.client = Some(client);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

#[async_trait]
impl Queryable for CosmosDbConnector {
    fn prepare(&self, query: &str) -> Result<()> {
        decode_operation::<CosmosOperation>(query).map(|_| ())
    }

    async fn run_query(&mut self, query: &str) -> Result<Value> {
        let operation: CosmosOperation = decode_operation(query)?;
        self.client()?.run(operation).await
    }
}

#[async_trait]
impl SchemaIntrospectable for CosmosDbConnector {
    /// Databases and their containers; the configured database/container narrow the listing
    async fn fetch_schema(&mut self) -> Result<Value> {
        let client = self.client()?;
        let databases = match &client.database {
            Some(database) => vec![database.clone()],
            None => CosmosClient::ids(
                &client.send(CosmosRequest::new(Method::GET, "dbs", "")).await?,
                "Databases",
            ),
        };

        let mut out = Vec::new();
        for database in databases {
            let feed = client
                .send(CosmosRequest::new(Method::GET, "colls", format!("dbs/{}", database)))
                .await?;
            let collections: Vec<Value> = CosmosClient::ids(&feed, "DocumentCollections")
                .into_iter()
                .filter(|name| client.container.as_ref().map_or(true, |c| c == name))
                .map(|name| json!({ "name": name, "fields": [] }))
                .collect();
            out.push(json!({ "name": database, "collections": collections }));
        }
        Ok(json!({ "databases": out }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbbridge_core::{normalize, Connector, Credentials, ErrorKind};
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // base64("secret-key")
    const KEY: &str = "c2VjcmV0LWtleQ==";

    fn connector(url: &str) -> CosmosDbConnector {
        let creds = Credentials::new()
            .with("account_uri", url)
            .with("primary_key", KEY);
        CosmosDbConnector::new(ConnectorContext::new(creds))
    }

    async fn mount_connect_check(mock_server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/dbs"))
            .and(header_exists("authorization"))
            .and(header("x-ms-version", COSMOS_API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Databases": [{"id": "shop"}]
            })))
            .mount(mock_server)
            .await;
    }

    #[test]
    fn test_signature_is_url_encoded_hmac() {
        let sig = master_key_signature(
            b"secret-key",
            &Method::GET,
            "dbs",
            "dbs/shop",
            "Thu, 27 Apr 2017 00:51:12 GMT",
        )
        .unwrap();
        assert!(sig.starts_with("type%3Dmaster%26ver%3D1.0%26sig%3D"));
        let again = master_key_signature(
            b"secret-key",
            &Method::GET,
            "dbs",
            "dbs/shop",
            "thu, 27 apr 2017 00:51:12 gmt",
        )
        .unwrap();
        assert_eq!(sig, again);
    }

    #[test]
    fn test_request_paths() {
        assert_eq!(CosmosRequest::new(Method::GET, "dbs", "").path(), "/dbs");
        assert_eq!(
            CosmosRequest::new(Method::GET, "colls", "dbs/shop").path(),
            "/dbs/shop/colls"
        );
        assert_eq!(
            CosmosRequest::new(Method::POST, "docs", "dbs/shop/colls/orders").path(),
            "/dbs/shop/colls/orders/docs"
        );
        assert_eq!(
            CosmosRequest::new(Method::GET, "docs", "dbs/shop/colls/orders/docs/o1").path(),
            "/dbs/shop/colls/orders/docs/o1"
        );
    }

    #[test]
    fn test_delete_requires_id() {
        let err = decode_operation::<CosmosOperation>(
            r#"{"operation": "delete", "database": "shop", "container": "orders"}"#,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), dbbridge_core::DELETE_REQUIRES_FILTERS);

        let err = decode_operation::<CosmosOperation>(
            r#"{"operation": "create", "database": "shop", "container": "orders", "body": {}}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperationRequest);
    }

    #[tokio::test]
    async fn test_query_returns_documents() {
        let mock_server = MockServer::start().await;
        mount_connect_check(&mock_server).await;
        Mock::given(method("POST"))
            .and(path("/dbs/shop/colls/orders/docs"))
            .and(header("x-ms-documentdb-isquery", "True"))
            .and(header("content-type", "application/query+json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Documents": [{"id": "o1", "status": "open"}], "_count": 1
            })))
            .mount(&mock_server)
            .await;

        let mut cosmos = connector(&mock_server.uri());
        let result = cosmos
            .execute_query(
                r#"{"operation": "query", "database": "shop", "container": "orders",
                    "query_text": "SELECT * FROM c WHERE c.status = @s",
                    "parameters": [{"name": "@s", "value": "open"}]}"#,
            )
            .await;
        assert_eq!(result.data, Some(json!([{"id": "o1", "status": "open"}])));
    }

    #[tokio::test]
    async fn test_create_reads_partition_key_from_body() {
        let mock_server = MockServer::start().await;
        mount_connect_check(&mock_server).await;
        Mock::given(method("GET"))
            .and(path("/dbs/shop/colls/orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "orders", "partitionKey": {"paths": ["/customer"], "kind": "Hash"}
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/dbs/shop/colls/orders/docs"))
            .and(header("x-ms-documentdb-partitionkey", "[\"c42\"]"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "o2", "customer": "c42", "_etag": "\"0\""
            })))
            .mount(&mock_server)
            .await;

        let mut cosmos = connector(&mock_server.uri());
        let result = cosmos
            .execute_query(
                r#"{"operation": "create", "database": "shop", "container": "orders",
                    "body": {"id": "o2", "customer": "c42"}}"#,
            )
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.data.unwrap()["id"], "o2");
    }

    #[tokio::test]
    async fn test_schema_lists_containers() {
        let mock_server = MockServer::start().await;
        mount_connect_check(&mock_server).await;
        Mock::given(method("GET"))
            .and(path("/dbs/shop/colls"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "DocumentCollections": [{"id": "orders"}, {"id": "customers"}]
            })))
            .mount(&mock_server)
            .await;

        let mut cosmos = connector(&mock_server.uri());
        let schema = cosmos.get_schema().await;
        let tree = normalize("cosmosdb", &schema);
        assert!(tree.entity("shop.orders").is_some());
        assert!(tree.entity("shop.customers").is_some());
    }

    #[tokio::test]
    async fn test_delete_without_id_sends_nothing() {
        let mock_server = MockServer::start().await;
        let mut cosmos = connector(&mock_server.uri());
        let result = cosmos
            .execute_query(r#"{"operation": "delete", "database": "shop", "container": "orders", "id": ""}"#)
            .await;
        assert_eq!(result.kind, Some(ErrorKind::InvalidOperationRequest));
        assert!(mock_server.received_requests().await.unwrap().is_empty());
    }
}
