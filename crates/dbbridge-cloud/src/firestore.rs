//! Firestore connector over the REST v1 API
//!
//! Documents travel as typed values (`stringValue`, `integerValue`, ...) and
//! are flattened to plain JSON with an added `_id`. Firestore has no fixed
//! schema, so introspection returns the limited-schema marker.

use async_trait::async_trait;
use dbbridge_core::google::{access_token, GoogleCredentials, DATASTORE_SCOPE};
use dbbridge_core::operation::require_non_empty;
use dbbridge_core::{
    decode_operation, BackendType, Connectable, ConnectorContext, ConnectorError, CredentialSpec,
    FieldSpec, OperationSet, Queryable, RestClient, Result, SchemaIntrospectable,
    DELETE_REQUIRES_FILTERS,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

const FIRESTORE_API: &str = "https://firestore.googleapis.com/v1";

const PAGE_SIZE: usize = 300;

const FIRESTORE_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::Firestore,
    url: None,
    fields: &[
        FieldSpec::required("project_id")
            .aliases(&["project"])
            .env("GCP_PROJECT_ID"),
        FieldSpec::optional("credentials_file")
            .aliases(&["credentials_path"])
            .env("GOOGLE_APPLICATION_CREDENTIALS"),
        FieldSpec::optional("service_account_json").secret(),
        FieldSpec::optional("access_token").secret(),
        FieldSpec::optional("database").default_value("(default)"),
        FieldSpec::optional("api_url"),
    ],
};

#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
enum FirestoreOperation {
    GetAll {
        collection: String,
        #[serde(default)]
        limit: Option<usize>,
    },
    Get {
        collection: String,
        id: String,
    },
    Query {
        collection: String,
        #[serde(default, rename = "where")]
        conditions: Vec<Condition>,
        #[serde(default)]
        order_by: Option<OrderBy>,
        #[serde(default)]
        limit: Option<usize>,
    },
    Add {
        collection: String,
        data: Map<String, Value>,
    },
    Set {
        collection: String,
        id: String,
        data: Map<String, Value>,
        #[serde(default)]
        merge: bool,
    },
    Update {
        collection: String,
        id: String,
        data: Map<String, Value>,
    },
    Delete {
        collection: String,
        #[serde(default)]
        id: String,
    },
}

#[derive(Debug, Deserialize)]
struct Condition {
    field: String,
    operator: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct OrderBy {
    field: String,
    #[serde(default)]
    direction: Option<String>,
}

impl OperationSet for FirestoreOperation {
    const OPERATIONS: &'static [&'static str] =
        &["get_all", "get", "query", "add", "set", "update", "delete"];

    fn validate(&self) -> Result<()> {
        match self {
            FirestoreOperation::GetAll { collection, .. } => require_non_empty("collection", collection),
            FirestoreOperation::Get { collection, id }
            | FirestoreOperation::Set { collection, id, .. }
            | FirestoreOperation::Update { collection, id, .. } => {
                require_non_empty("collection", collection)?;
                require_non_empty("id", id)
            }
            FirestoreOperation::Query {
                collection,
                conditions,
                ..
            } => {
                require_non_empty("collection", collection)?;
                for condition in conditions {
                    field_operator(&condition.operator)?;
                }
                Ok(())
            }
            FirestoreOperation::Add { collection, .. } => require_non_empty("collection", collection),
            FirestoreOperation::Delete { collection, id } => {
                if id.trim().is_empty() {
                    return Err(ConnectorError::invalid_request(DELETE_REQUIRES_FILTERS));
                }
                require_non_empty("collection", collection)
            }
        }
    }
}

/// Comparison operators accepted in `where`, in both symbol and API spelling
fn field_operator(operator: &str) -> Result<&'static str> {
    let op = match operator.trim() {
        "==" | "EQUAL" => "EQUAL",
        "!=" | "NOT_EQUAL" => "NOT_EQUAL",
        "<" | "LESS_THAN" => "LESS_THAN",
        "<=" | "LESS_THAN_OR_EQUAL" => "LESS_THAN_OR_EQUAL",
        ">" | "GREATER_THAN" => "GREATER_THAN",
        ">=" | "GREATER_THAN_OR_EQUAL" => "GREATER_THAN_OR_EQUAL",
        "array-contains" | "ARRAY_CONTAINS" => "ARRAY_CONTAINS",
        "array-contains-any" | "ARRAY_CONTAINS_ANY" => "ARRAY_CONTAINS_ANY",
        "in" | "IN" => "IN",
        "not-in" | "NOT_IN" => "NOT_IN",
        other => {
            return Err(ConnectorError::invalid_request(format!(
                "Unsupported where operator: {}",
                other
            )))
        }
    };
    Ok(op)
}

/// Plain JSON to a Firestore typed value
fn to_firestore(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) if n.is_i64() || n.is_u64() => json!({ "integerValue": n.to_string() }),
        Value::Number(n) => json!({ "doubleValue": n }),
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => {
            json!({ "arrayValue": { "values": items.iter().map(to_firestore).collect::<Vec<_>>() } })
        }
        Value::Object(map) => json!({ "mapValue": { "fields": to_fields(map) } }),
    }
}

fn to_fields(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (k.clone(), to_firestore(v)))
        .collect()
}

/// Firestore typed value to plain JSON
fn from_firestore(value: &Value) -> Value {
    let Some((kind, inner)) = value.as_object().and_then(|m| m.iter().next()) else {
        return Value::Null;
    };
    match kind.as_str() {
        "nullValue" => Value::Null,
        "integerValue" => match inner {
            Value::String(s) => s.parse::<i64>().map(Value::from).unwrap_or_else(|_| inner.clone()),
            other => other.clone(),
        },
        "arrayValue" => Value::Array(
            inner["values"]
                .as_array()
                .map(|values| values.iter().map(from_firestore).collect())
                .unwrap_or_default(),
        ),
        "mapValue" => Value::Object(
            inner["fields"]
                .as_object()
                .map(from_fields)
                .unwrap_or_default(),
        ),
        "geoPointValue" => json!({
            "latitude": inner["latitude"],
            "longitude": inner["longitude"],
        }),
        // booleanValue, doubleValue, stringValue, timestampValue, bytesValue, referenceValue
        _ => inner.clone(),
    }
}

fn from_fields(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), from_firestore(v)))
        .collect()
}

/// Flatten a document resource, adding its id as `_id`
fn document_json(doc: &Value) -> Value {
    let mut out = doc["fields"]
        .as_object()
        .map(from_fields)
        .unwrap_or_default();
    if let Some(name) = doc["name"].as_str() {
        let id = name.rsplit('/').next().unwrap_or(name);
        out.insert("_id".to_string(), json!(id));
    }
    Value::Object(out)
}

fn structured_query(
    collection: &str,
    conditions: &[Condition],
    order_by: Option<&OrderBy>,
    limit: Option<usize>,
) -> Result<Value> {
    let mut query = Map::new();
    query.insert("from".to_string(), json!([{ "collectionId": collection }]));

    let filters = conditions
        .iter()
        .map(|c| {
            Ok(json!({
                "fieldFilter": {
                    "field": { "fieldPath": c.field },
                    "op": field_operator(&c.operator)?,
                    "value": to_firestore(&c.value),
                }
            }))
        })
        .collect::<Result<Vec<_>>>()?;
    match filters.len() {
        0 => {}
        1 => {
            query.insert("where".to_string(), filters.into_iter().next().unwrap_or_default());
        }
        _ => {
            query.insert(
                "where".to_string(),
                json!({ "compositeFilter": { "op": "AND", "filters": filters } }),
            );
        }
    }

    if let Some(order) = order_by {
        let direction = match order.direction.as_deref().map(str::to_ascii_lowercase) {
            Some(d) if d == "desc" || d == "descending" => "DESCENDING",
            _ => "ASCENDING",
        };
        query.insert(
            "orderBy".to_string(),
            json!([{ "field": { "fieldPath": order.field }, "direction": direction }]),
        );
    }
    if let Some(limit) = limit {
        query.insert("limit".to_string(), json!(limit));
    }
    Ok(json!({ "structuredQuery": query }))
}

struct FirestoreClient {
    rest: RestClient,
    documents: String,
}

impl FirestoreClient {
    fn doc_path(&self, collection: &str, id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.documents,
            urlencoding::encode(collection),
            urlencoding::encode(id)
        )
    }

    async fn list(&self, collection: &str, limit: Option<usize>) -> Result<Value> {
        let path = format!("{}/{}", self.documents, urlencoding::encode(collection));
        let mut docs = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .rest
                .get(&path)
                .query(&[("pageSize", PAGE_SIZE.to_string())]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }
            let page = self.rest.send(request).await?;
            if let Some(items) = page["documents"].as_array() {
                docs.extend(items.iter().map(document_json));
            }
            if limit.map_or(false, |l| docs.len() >= l) {
                docs.truncate(limit.unwrap_or(docs.len()));
                break;
            }
            match page["nextPageToken"].as_str() {
                Some(token) if !token.is_empty() => page_token = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(Value::Array(docs))
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Value> {
        let response = self
            .rest
            .get(&self.doc_path(collection, id))
            .send()
            .await
            .map_err(|e| ConnectorError::query(format!("Firestore API request failed: {}", e)))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ConnectorError::query(format!(
                "Document with id {} does not exist",
                id
            )));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::query(format!(
                "Firestore API returned status {}: {}",
                status, body
            )));
        }
        let doc: Value = response
            .json()
            .await
            .map_err(|e| ConnectorError::query(format!("Failed to parse Firestore response: {}", e)))?;
        Ok(document_json(&doc))
    }

    async fn run(&self, operation: FirestoreOperation) -> Result<Value> {
        match operation {
            FirestoreOperation::GetAll { collection, limit } => self.list(&collection, limit).await,
            FirestoreOperation::Get { collection, id } => self.get(&collection, &id).await,
            FirestoreOperation::Query {
                collection,
                conditions,
                order_by,
                limit,
            } => {
                let body = structured_query(&collection, &conditions, order_by.as_ref(), limit)?;
                let request = self
                    .rest
                    .post(&format!("{}:runQuery", self.documents))
                    .json(&body);
                let results = self.rest.send(request).await?;
                Ok(Value::Array(
                    results
                        .as_array()
                        .map(|items| {
                            items
                                .iter()
                                .filter(|item| item.get("document").is_some())
                                .map(|item| document_json(&item["document"]))
                                .collect()
                        })
                        .unwrap_or_default(),
                ))
            }
            FirestoreOperation::Add { collection, data } => {
                let path = format!("{}/{}", self.documents, urlencoding::encode(&collection));
                let request = self
                    .rest
                    .post(&path)
                    .json(&json!({ "fields": to_fields(&data) }));
                let created = self.rest.send(request).await?;
                let id = created["name"]
                    .as_str()
                    .and_then(|name| name.rsplit('/').next())
                    .unwrap_or_default();
                Ok(json!({ "id": id }))
            }
            FirestoreOperation::Set {
                collection,
                id,
                data,
                merge,
            } => {
                let mut request = self
                    .rest
                    .request(Method::PATCH, &self.doc_path(&collection, &id));
                if merge {
                    request = request.query(&mask(&data));
                }
                let written = self
                    .rest
                    .send(request.json(&json!({ "fields": to_fields(&data) })))
                    .await?;
                Ok(document_json(&written))
            }
            FirestoreOperation::Update {
                collection,
                id,
                data,
            } => {
                let mut params = mask(&data);
                params.push(("currentDocument.exists", "true".to_string()));
                let request = self
                    .rest
                    .request(Method::PATCH, &self.doc_path(&collection, &id))
                    .query(&params)
                    .json(&json!({ "fields": to_fields(&data) }));
                let written = self.rest.send(request).await?;
                Ok(document_json(&written))
            }
            FirestoreOperation::Delete { collection, id } => {
                let request = self
                    .rest
                    .request(Method::DELETE, &self.doc_path(&collection, &id));
                self.rest.send(request).await?;
                Ok(json!({ "status": "success" }))
            }
        }
    }
}

/// `updateMask.fieldPaths` for each top-level key
fn mask(data: &Map<String, Value>) -> Vec<(&'static str, String)> {
    data.keys()
        .map(|k| ("updateMask.fieldPaths", k.clone()))
        .collect()
}

pub struct FirestoreConnector {
    ctx: ConnectorContext,
    client: Option<FirestoreClient>,
}

impl FirestoreConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx, client: None }
    }

    fn client(&self) -> Result<&FirestoreClient> {
        self.client
            .as_ref()
            .ok_or_else(|| ConnectorError::connection("Firestore", "not connected"))
    }
}

#[async_trait]
impl Connectable for FirestoreConnector {
    fn backend(&self) -> BackendType {
        BackendType::Firestore
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        let params = self.ctx.resolve(&FIRESTORE_SPEC)?;
        let project = params.require("project_id")?;
        let database = params.get("database").unwrap_or("(default)");
        let credentials = GoogleCredentials::from_params("Firestore", &params)?;
        let api_url = params.get("api_url").unwrap_or(FIRESTORE_API);
        let timeout = self.ctx.connect_timeout();

        let auth = RestClient::with_headers(BackendType::Firestore, api_url, HeaderMap::new(), timeout)?;
        let token = access_token("Firestore", auth.http(), &credentials, DATASTORE_SCOPE).await?;

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                ConnectorError::connection("Firestore", "access token contains invalid characters")
            })?,
        );
        let client = FirestoreClient {
            rest: RestClient::with_headers(BackendType::Firestore, api_url, headers, timeout)?,
            documents: format!("/projects/{}/databases/{}/documents", project, database),
        };

        debug!("Checking Firestore access to project {}", project);
        let check = client
            .rest
            .post(&format!("{}:listCollectionIds", client.documents))
            .json(&json!({ "pageSize": 1 }));
        client.rest.send(check).await?;

        self.client = Some(client);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

#[async_trait]
impl Queryable for FirestoreConnector {
    fn prepare(&self, query: &str) -> Result<()> {
        decode_operation::<FirestoreOperation>(query).map(|_| ())
    }

    async fn run_query(&mut self, query: &str) -> Result<Value> {
        let operation: FirestoreOperation = decode_operation(query)?;
        self.client()?.run(operation).await
    }
}

impl SchemaIntrospectable for FirestoreConnector {}

#[cfg(test)]
mod tests {
    use super::*;
    use dbbridge_core::{Connector, Credentials, ErrorKind};
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DOCS: &str = "/projects/demo/databases/(default)/documents";

    fn connector(url: &str) -> FirestoreConnector {
        let creds = Credentials::new()
            .with("project_id", "demo")
            .with("access_token", "ya29.test")
            .with("api_url", url);
        FirestoreConnector::new(ConnectorContext::new(creds))
    }

    async fn mount_connect_check(mock_server: &MockServer) {
        Mock::given(method("POST"))
            .and(path(format!("{}:listCollectionIds", DOCS)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "collectionIds": ["users"]
            })))
            .mount(mock_server)
            .await;
    }

    #[test]
    fn test_typed_values() {
        let doc = json!({
            "name": "projects/demo/databases/(default)/documents/users/u1",
            "fields": {
                "name": {"stringValue": "Ada"},
                "age": {"integerValue": "36"},
                "tags": {"arrayValue": {"values": [{"stringValue": "math"}]}},
                "address": {"mapValue": {"fields": {"city": {"stringValue": "London"}}}},
                "deleted": {"nullValue": null}
            }
        });
        assert_eq!(
            document_json(&doc),
            json!({
                "_id": "u1",
                "name": "Ada",
                "age": 36,
                "tags": ["math"],
                "address": {"city": "London"},
                "deleted": null
            })
        );
        assert_eq!(to_firestore(&json!(2.5)), json!({"doubleValue": 2.5}));
        assert_eq!(to_firestore(&json!(7)), json!({"integerValue": "7"}));
    }

    #[test]
    fn test_structured_query() {
        let conditions = vec![
            Condition {
                field: "age".into(),
                operator: ">=".into(),
                value: json!(18),
            },
            Condition {
                field: "active".into(),
                operator: "==".into(),
                value: json!(true),
            },
        ];
        let order = OrderBy {
            field: "age".into(),
            direction: Some("desc".into()),
        };
        let body = structured_query("users", &conditions, Some(&order), Some(5)).unwrap();
        let query = &body["structuredQuery"];
        assert_eq!(query["where"]["compositeFilter"]["filters"][0]["fieldFilter"]["op"], "GREATER_THAN_OR_EQUAL");
        assert_eq!(query["orderBy"][0]["direction"], "DESCENDING");
        assert_eq!(query["limit"], 5);
    }

    #[test]
    fn test_operation_validation() {
        let err = decode_operation::<FirestoreOperation>(
            r#"{"operation": "delete", "collection": "users"}"#,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), DELETE_REQUIRES_FILTERS);

        let err = decode_operation::<FirestoreOperation>(
            r#"{"operation": "query", "collection": "users",
                "where": [{"field": "a", "operator": "~", "value": 1}]}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperationRequest);

        let err = decode_operation::<FirestoreOperation>(r#"{"operation": "drop", "collection": "users"}"#)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    }

    #[tokio::test]
    async fn test_get_missing_document() {
        let mock_server = MockServer::start().await;
        mount_connect_check(&mock_server).await;
        Mock::given(method("GET"))
            .and(path(format!("{}/users/ghost", DOCS)))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": 404, "status": "NOT_FOUND"}
            })))
            .mount(&mock_server)
            .await;

        let mut firestore = connector(&mock_server.uri());
        let result = firestore
            .execute_query(r#"{"operation": "get", "collection": "users", "id": "ghost"}"#)
            .await;
        assert!(!result.success);
        assert!(result
            .error
            .unwrap()
            .contains("Document with id ghost does not exist"));
    }

    #[tokio::test]
    async fn test_add_and_query() {
        let mock_server = MockServer::start().await;
        mount_connect_check(&mock_server).await;
        Mock::given(method("POST"))
            .and(path(format!("{}/users", DOCS)))
            .and(body_partial_json(json!({"fields": {"name": {"stringValue": "Ada"}}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "projects/demo/databases/(default)/documents/users/abc123",
                "fields": {"name": {"stringValue": "Ada"}}
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{}:runQuery", DOCS)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"document": {
                    "name": "projects/demo/databases/(default)/documents/users/abc123",
                    "fields": {"name": {"stringValue": "Ada"}}
                }, "readTime": "2024-01-01T00:00:00Z"}
            ])))
            .mount(&mock_server)
            .await;

        let mut firestore = connector(&mock_server.uri());
        let added = firestore
            .execute_query(r#"{"operation": "add", "collection": "users", "data": {"name": "Ada"}}"#)
            .await;
        assert_eq!(added.data, Some(json!({"id": "abc123"})));

        let found = firestore
            .execute_query(
                r#"{"operation": "query", "collection": "users",
                    "where": [{"field": "name", "operator": "==", "value": "Ada"}]}"#,
            )
            .await;
        assert_eq!(found.data, Some(json!([{"_id": "abc123", "name": "Ada"}])));
    }

    #[tokio::test]
    async fn test_set_with_merge_sends_mask() {
        let mock_server = MockServer::start().await;
        mount_connect_check(&mock_server).await;
        Mock::given(method("PATCH"))
            .and(path(format!("{}/users/u1", DOCS)))
            .and(query_param("updateMask.fieldPaths", "age"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "projects/demo/databases/(default)/documents/users/u1",
                "fields": {"age": {"integerValue": "37"}}
            })))
            .mount(&mock_server)
            .await;

        let mut firestore = connector(&mock_server.uri());
        let result = firestore
            .execute_query(
                r#"{"operation": "set", "collection": "users", "id": "u1",
                    "data": {"age": 37}, "merge": true}"#,
            )
            .await;
        assert_eq!(result.data, Some(json!({"_id": "u1", "age": 37})));
    }

    #[tokio::test]
    async fn test_schema_is_limited() {
        let mock_server = MockServer::start().await;
        mount_connect_check(&mock_server).await;
        let mut firestore = connector(&mock_server.uri());
        let schema = firestore.get_schema().await;
        assert_eq!(schema, dbbridge_core::limited_schema(BackendType::Firestore));
    }

    #[tokio::test]
    async fn test_delete_without_id_sends_nothing() {
        let mock_server = MockServer::start().await;
        let mut firestore = connector(&mock_server.uri());
        let result = firestore
            .execute_query(r#"{"operation": "delete", "collection": "users"}"#)
            .await;
        assert_eq!(result.kind, Some(ErrorKind::InvalidOperationRequest));
        assert_eq!(result.error.as_deref(), Some(DELETE_REQUIRES_FILTERS));
        assert!(mock_server.received_requests().await.unwrap().is_empty());
    }
}
