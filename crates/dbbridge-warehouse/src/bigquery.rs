//! BigQuery connector over the v2 REST API
//!
//! Authenticates with a service account (JSON or key file) or a pre-issued
//! `access_token`. Queries run through `jobs.query` in standard SQL; schema
//! lists the tables of one dataset with each column's mode.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dbbridge_core::google::{access_token, GoogleCredentials, BIGQUERY_SCOPE};
use dbbridge_core::{
    BackendType, Connectable, ConnectorContext, ConnectorError, CredentialSpec, FieldSpec,
    Queryable, RestClient, Result, SchemaIntrospectable,
};
use dbbridge_relational::catalog::affected_rows;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Map, Value};
use tracing::debug;

const BIGQUERY_API: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// `jobs.getQueryResults` polls before giving up on an unfinished job
const MAX_POLLS: usize = 10;

const BIGQUERY_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::BigQuery,
    url: None,
    fields: &[
        FieldSpec::required("project_id")
            .aliases(&["project"])
            .env("GCP_PROJECT_ID"),
        FieldSpec::optional("dataset")
            .aliases(&["dataset_id"])
            .env("GCP_DATASET_ID"),
        FieldSpec::optional("credentials_file")
            .aliases(&["credentials_path"])
            .env("GOOGLE_APPLICATION_CREDENTIALS"),
        FieldSpec::optional("service_account_json").secret(),
        FieldSpec::optional("access_token").secret(),
        FieldSpec::optional("location"),
        FieldSpec::optional("api_url"),
    ],
};

pub struct BigQueryConnector {
    ctx: ConnectorContext,
    client: Option<BigQueryClient>,
}

struct BigQueryClient {
    rest: RestClient,
    project: String,
    dataset: Option<String>,
    location: Option<String>,
}

impl BigQueryClient {
    fn project_path(&self, rest: &str) -> String {
        format!("/projects/{}{}", segment(&self.project), rest)
    }

    async fn query(&self, sql: &str) -> Result<Value> {
        let mut body = json!({
            "query": sql,
            "useLegacySql": false,
            "timeoutMs": 20_000,
        });
        if let Some(location) = &self.location {
            body["location"] = json!(location);
        }
        if let Some(dataset) = &self.dataset {
            body["defaultDataset"] = json!({ "projectId": self.project, "datasetId": dataset });
        }

        let request = self.rest.post(&self.project_path("/queries")).json(&body);
        let mut response = self.rest.send(request).await?;

        let mut polls = 0;
        while response.get("jobComplete").and_then(Value::as_bool) == Some(false) {
            polls += 1;
            if polls > MAX_POLLS {
                return Err(ConnectorError::query("BigQuery job did not complete in time"));
            }
            let job = &response["jobReference"];
            let job_id = job["jobId"]
                .as_str()
                .ok_or_else(|| ConnectorError::query("BigQuery response has no job id"))?;
            debug!("Waiting for BigQuery job {}", job_id);

            let mut request = self
                .rest
                .get(&self.project_path(&format!("/queries/{}", segment(job_id))))
                .query(&[("timeoutMs", "20000")]);
            if let Some(location) = job["location"].as_str() {
                request = request.query(&[("location", location)]);
            }
            response = self.rest.send(request).await?;
        }

        if let Some(errors) = response.get("errors").and_then(Value::as_array) {
            if let Some(message) = errors.first().and_then(|e| e["message"].as_str()) {
                return Err(ConnectorError::query(message));
            }
        }
        Ok(query_response_value(&response))
    }

    async fn list_tables(&self, dataset: &str) -> Result<Vec<String>> {
        let path = self.project_path(&format!("/datasets/{}/tables", segment(dataset)));
        let mut tables = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self.rest.get(&path);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let page = self.rest.send(request).await?;
            if let Some(items) = page.get("tables").and_then(Value::as_array) {
                tables.extend(
                    items
                        .iter()
                        .filter_map(|t| t["tableReference"]["tableId"].as_str())
                        .map(str::to_string),
                );
            }
            match page.get("nextPageToken").and_then(Value::as_str) {
                Some(token) => page_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(tables)
    }
}

/// Rows of a `jobs.query` response, or the DML count when there is no schema
fn query_response_value(response: &Value) -> Value {
    let Some(fields) = response["schema"]["fields"].as_array() else {
        let count = response
            .get("numDmlAffectedRows")
            .and_then(|n| n.as_str().and_then(|s| s.parse().ok()).or_else(|| n.as_u64()))
            .unwrap_or(0);
        return affected_rows(count);
    };

    let rows = response
        .get("rows")
        .and_then(Value::as_array)
        .map(|rows| rows.iter().map(|row| record_to_json(fields, row)).collect())
        .unwrap_or_default();
    Value::Array(rows)
}

/// `{"f": [{"v": ...}]}` into an object keyed by field name
fn record_to_json(fields: &[Value], record: &Value) -> Value {
    let cells = record["f"].as_array().cloned().unwrap_or_default();
    let object: Map<String, Value> = fields
        .iter()
        .zip(cells)
        .map(|(field, cell)| {
            let name = field["name"].as_str().unwrap_or_default().to_string();
            (name, cell_to_json(field, &cell["v"]))
        })
        .collect();
    Value::Object(object)
}

fn cell_to_json(field: &Value, value: &Value) -> Value {
    if field["mode"].as_str() == Some("REPEATED") {
        let items = value.as_array().cloned().unwrap_or_default();
        return Value::Array(
            items
                .iter()
                .map(|item| scalar_to_json(field, &item["v"]))
                .collect(),
        );
    }
    scalar_to_json(field, value)
}

fn scalar_to_json(field: &Value, value: &Value) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    let field_type = field["type"].as_str().unwrap_or("STRING");
    if matches!(field_type, "RECORD" | "STRUCT") {
        let subfields = field["fields"].as_array().cloned().unwrap_or_default();
        return record_to_json(&subfields, value);
    }

    let Some(text) = value.as_str() else {
        return value.clone();
    };
    match field_type {
        "INTEGER" | "INT64" => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| json!(text)),
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => text
            .parse::<f64>()
            .map(Value::from)
            .unwrap_or_else(|_| json!(text)),
        "BOOLEAN" | "BOOL" => Value::Bool(text.eq_ignore_ascii_case("true")),
        "TIMESTAMP" => text
            .parse::<f64>()
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp_micros((secs * 1e6).round() as i64))
            .map(|ts| json!(ts.to_rfc3339()))
            .unwrap_or_else(|| json!(text)),
        "JSON" => serde_json::from_str(text).unwrap_or_else(|_| json!(text)),
        _ => json!(text),
    }
}

fn column_json(field: &Value) -> Value {
    let mode = field["mode"].as_str().unwrap_or("NULLABLE");
    json!({
        "name": field["name"],
        "type": field["type"],
        "mode": mode,
        "nullable": mode != "REQUIRED",
    })
}

fn segment(part: &str) -> String {
    urlencoding::encode(part).into_owned()
}

impl BigQueryConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx, client: None }
    }

    fn client(&self) -> Result<&BigQueryClient> {
        self.client
            .as_ref()
            .ok_or_else(|| ConnectorError::connection("BigQuery", "not connected"))
    }
}

#[async_trait]
impl Connectable for BigQueryConnector {
    fn backend(&self) -> BackendType {
        BackendType::BigQuery
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        let params = self.ctx.resolve(&BIGQUERY_SPEC)?;
        let project = params.require("project_id")?.to_string();
        let credentials = GoogleCredentials::from_params("BigQuery", &params)?;
        let api_url = params.get("api_url").unwrap_or(BIGQUERY_API);
        let timeout = self.ctx.connect_timeout();

        let auth = RestClient::with_headers(BackendType::BigQuery, api_url, HeaderMap::new(), timeout)?;
        let token = access_token("BigQuery", auth.http(), &credentials, BIGQUERY_SCOPE).await?;

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                ConnectorError::connection("BigQuery", "access token contains invalid characters")
            })?,
        );
        let rest = RestClient::with_headers(BackendType::BigQuery, api_url, headers, timeout)?;
        let client = BigQueryClient {
            rest,
            project,
            dataset: params.get("dataset").map(str::to_string),
            location: params.get("location").map(str::to_string),
        };

        debug!("Checking BigQuery access to project {}", client.project);
        let check = client
            .rest
            .get(&client.project_path("/datasets"))
            .query(&[("maxResults", "1")]);
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
impl Queryable for BigQueryConnector {
    async fn run_query(&mut self, query: &str) -> Result<Value> {
        let sql = query.trim();
        if sql.is_empty() {
            return Err(ConnectorError::invalid_request("Query is empty"));
        }
        self.client()?.query(sql).await
    }
}

#[async_trait]
impl SchemaIntrospectable for BigQueryConnector {
    /// `{"dataset", "tables": [{"name", "columns": [{"name", "type", "mode"}]}]}`
    async fn fetch_schema(&mut self) -> Result<Value> {
        let client = self.client()?;
        let dataset = client.dataset.as_deref().ok_or_else(|| {
            ConnectorError::invalid_request(
                "Dataset ID is required (either in credentials or as GCP_DATASET_ID environment variable)",
            )
        })?;

        let mut tables = Vec::new();
        for table in client.list_tables(dataset).await? {
            let path = client.project_path(&format!(
                "/datasets/{}/tables/{}",
                segment(dataset),
                segment(&table)
            ));
            let meta = client.rest.send(client.rest.get(&path)).await?;
            let columns: Vec<Value> = meta["schema"]["fields"]
                .as_array()
                .map(|fields| fields.iter().map(column_json).collect())
                .unwrap_or_default();
            tables.push(json!({ "name": table, "columns": columns }));
        }
        Ok(json!({ "dataset": dataset, "tables": tables }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbbridge_core::{normalize, Connector, Credentials, ErrorKind};
    use std::collections::HashMap;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector(url: &str) -> BigQueryConnector {
        let creds = Credentials::new()
            .with("project_id", "acme")
            .with("dataset", "sales")
            .with("access_token", "ya29.test")
            .with("api_url", url);
        BigQueryConnector::new(ConnectorContext::with_env(
            creds,
            Arc::new(HashMap::<String, String>::new()),
        ))
    }

    async fn mount_connect_check(mock_server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/projects/acme/datasets"))
            .and(header("authorization", "Bearer ya29.test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"datasets": []})))
            .mount(mock_server)
            .await;
    }

    #[test]
    fn test_typed_cells() {
        let schema = json!([
            {"name": "id", "type": "INTEGER", "mode": "REQUIRED"},
            {"name": "tags", "type": "STRING", "mode": "REPEATED"},
            {"name": "at", "type": "TIMESTAMP"},
            {"name": "geo", "type": "RECORD", "fields": [{"name": "lat", "type": "FLOAT"}]}
        ]);
        let row = json!({"f": [
            {"v": "7"},
            {"v": [{"v": "a"}, {"v": "b"}]},
            {"v": "1.7e9"},
            {"v": {"f": [{"v": "51.5"}]}}
        ]});
        let value = record_to_json(schema.as_array().unwrap(), &row);
        assert_eq!(value["id"], 7);
        assert_eq!(value["tags"], json!(["a", "b"]));
        assert_eq!(value["at"], "2023-11-14T22:13:20+00:00");
        assert_eq!(value["geo"], json!({"lat": 51.5}));
    }

    #[tokio::test]
    async fn test_query_polls_until_complete() {
        let mock_server = MockServer::start().await;
        mount_connect_check(&mock_server).await;
        Mock::given(method("POST"))
            .and(path("/projects/acme/queries"))
            .and(body_partial_json(json!({
                "query": "SELECT region FROM orders",
                "useLegacySql": false,
                "defaultDataset": {"projectId": "acme", "datasetId": "sales"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobComplete": false,
                "jobReference": {"jobId": "job_1", "location": "EU"}
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/projects/acme/queries/job_1"))
            .and(query_param("location", "EU"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobComplete": true,
                "schema": {"fields": [{"name": "region", "type": "STRING"}]},
                "rows": [{"f": [{"v": "emea"}]}]
            })))
            .mount(&mock_server)
            .await;

        let mut bigquery = connector(&mock_server.uri());
        let result = bigquery.execute_query("SELECT region FROM orders").await;
        assert_eq!(result.data, Some(json!([{"region": "emea"}])));
    }

    #[test]
    fn test_dml_count() {
        let response = json!({"jobComplete": true, "numDmlAffectedRows": "3"});
        assert_eq!(query_response_value(&response), json!({"affected_rows": 3}));
    }

    #[tokio::test]
    async fn test_schema_lists_dataset_tables() {
        let mock_server = MockServer::start().await;
        mount_connect_check(&mock_server).await;
        Mock::given(method("GET"))
            .and(path("/projects/acme/datasets/sales/tables"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tables": [{"tableReference": {"tableId": "orders"}}]
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/projects/acme/datasets/sales/tables/orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "schema": {"fields": [
                    {"name": "id", "type": "INTEGER", "mode": "REQUIRED"},
                    {"name": "region", "type": "STRING"}
                ]}
            })))
            .mount(&mock_server)
            .await;

        let mut bigquery = connector(&mock_server.uri());
        let schema = bigquery.get_schema().await;
        assert_eq!(schema["dataset"], "sales");
        assert_eq!(schema["tables"][0]["columns"][0]["mode"], "REQUIRED");

        let tree = normalize("bigquery", &schema);
        let orders = tree.entity("orders").unwrap();
        assert!(!orders.fields[0].nullable);
        assert!(orders.fields[1].nullable);
    }

    #[tokio::test]
    async fn test_missing_google_credentials() {
        let creds = Credentials::new().with("project_id", "acme");
        let mut bigquery = BigQueryConnector::new(ConnectorContext::with_env(
            creds,
            Arc::new(HashMap::<String, String>::new()),
        ));
        let result = bigquery.execute_query("SELECT 1").await;
        assert_eq!(result.kind, Some(ErrorKind::MissingCredential));
    }
}
