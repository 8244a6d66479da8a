//! InfluxDB 2.x connector over the HTTP API
//!
//! Flux queries come back as annotated CSV and are flattened to one JSON
//! object per record. Writes accept raw line protocol or point objects:
//!
//! ```json
//! {"operation": "write", "bucket": "metrics",
//!  "data": [{"measurement": "cpu", "tags": {"host": "a"}, "fields": {"usage": 0.5}}]}
//! ```

use async_trait::async_trait;
use chrono::DateTime;
use dbbridge_core::operation::require_non_empty;
use dbbridge_core::{
    decode_operation_value, BackendType, Connectable, ConnectorContext, ConnectorError,
    CredentialSpec, FieldSpec, OperationSet, QueryInput, Queryable, RestClient, Result,
    SchemaIntrospectable, UrlSpec,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

const INFLUXDB_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::InfluxDb,
    url: Some(UrlSpec::field("url", &["connection_string", "url"]).env("INFLUXDB_URL")),
    fields: &[
        FieldSpec::optional("url"),
        FieldSpec::optional("host")
            .aliases(&["hostname"])
            .default_value("localhost"),
        FieldSpec::optional("port").default_value("8086"),
        FieldSpec::optional("token")
            .aliases(&["api_token"])
            .env("INFLUXDB_TOKEN")
            .secret(),
        FieldSpec::optional("org")
            .aliases(&["organization"])
            .env("INFLUXDB_ORG"),
        FieldSpec::optional("bucket"),
    ],
};

#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
enum InfluxOperation {
    Query {
        flux_query: String,
    },
    Write {
        #[serde(default)]
        bucket: Option<String>,
        data: Value,
    },
}

impl OperationSet for InfluxOperation {
    const OPERATIONS: &'static [&'static str] = &["query", "write"];

    fn validate(&self) -> Result<()> {
        match self {
            InfluxOperation::Query { flux_query } => require_non_empty("flux_query", flux_query),
            InfluxOperation::Write { data, .. } => line_protocol(data).map(|_| ()),
        }
    }
}

// Line protocol escaping differs per element
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_key(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

fn field_value(value: &Value) -> Result<String> {
    match value {
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) if n.is_i64() => Ok(format!("{}i", n)),
        Value::Number(n) if n.is_u64() => Ok(format!("{}u", n)),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))),
        other => Err(ConnectorError::invalid_request(format!(
            "Unsupported field value: {}",
            other
        ))),
    }
}

/// Point time in nanoseconds; RFC 3339 strings are converted
fn point_time(value: &Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::String(s) => {
            let ts = DateTime::parse_from_rfc3339(s).map_err(|e| {
                ConnectorError::invalid_request(format!("Invalid point time '{}': {}", s, e))
            })?;
            ts.timestamp_nanos_opt()
                .map(|ns| Some(ns.to_string()))
                .ok_or_else(|| ConnectorError::invalid_request(format!("Point time out of range: {}", s)))
        }
        other => Err(ConnectorError::invalid_request(format!(
            "Invalid point time: {}",
            other
        ))),
    }
}

fn point_line(point: &Map<String, Value>) -> Result<String> {
    let measurement = point
        .get("measurement")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ConnectorError::invalid_request("Point requires a 'measurement'"))?;
    let fields = point
        .get("fields")
        .and_then(Value::as_object)
        .filter(|f| !f.is_empty())
        .ok_or_else(|| ConnectorError::invalid_request("Point requires at least one field"))?;

    let mut line = escape_measurement(measurement);
    if let Some(tags) = point.get("tags").and_then(Value::as_object) {
        for (key, value) in tags {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            line.push_str(&format!(",{}={}", escape_key(key), escape_key(&value)));
        }
    }

    let rendered = fields
        .iter()
        .map(|(key, value)| Ok(format!("{}={}", escape_key(key), field_value(value)?)))
        .collect::<Result<Vec<_>>>()?;
    line.push(' ');
    line.push_str(&rendered.join(","));

    if let Some(time) = point_time(point.get("time").unwrap_or(&Value::Null))? {
        line.push(' ');
        line.push_str(&time);
    }
    Ok(line)
}

/// Line protocol body for a write: a string, a list of lines, or point objects
fn line_protocol(data: &Value) -> Result<String> {
    let lines = match data {
        Value::String(s) => vec![s.clone()],
        Value::Object(point) => vec![point_line(point)?],
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                Value::Object(point) => point_line(point),
                _ => Err(ConnectorError::invalid_request(
                    "Write data items must be line protocol strings or point objects",
                )),
            })
            .collect::<Result<Vec<_>>>()?,
        _ => {
            return Err(ConnectorError::invalid_request(
                "Write operation requires bucket and data",
            ))
        }
    };

    let body = lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if body.is_empty() {
        return Err(ConnectorError::invalid_request(
            "Write operation requires bucket and data",
        ));
    }
    Ok(body)
}

fn typed_cell(datatype: Option<&str>, raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    match datatype {
        Some("long") => raw.parse::<i64>().map(Value::from).unwrap_or_else(|_| json!(raw)),
        Some("unsignedLong") => raw.parse::<u64>().map(Value::from).unwrap_or_else(|_| json!(raw)),
        Some("double") => raw
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or_else(|| json!(raw)),
        Some("boolean") => json!(raw == "true"),
        _ => json!(raw),
    }
}

/// Flatten annotated CSV (several tables, each with `#datatype` and a header) into records
fn parse_flux_csv(body: &str) -> Result<Vec<Value>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut records = Vec::new();
    let mut datatypes: Vec<String> = Vec::new();
    let mut header: Option<Vec<String>> = None;

    for row in reader.records() {
        let row = row.map_err(|e| ConnectorError::query(format!("Invalid Flux CSV response: {}", e)))?;
        let first = row.get(0).unwrap_or("");

        if first == "#datatype" {
            datatypes = row.iter().map(str::to_string).collect();
            header = None;
            continue;
        }
        if first.starts_with('#') {
            continue;
        }
        if row.iter().all(str::is_empty) {
            header = None;
            continue;
        }

        let Some(columns) = &header else {
            header = Some(row.iter().map(str::to_string).collect());
            continue;
        };

        let mut record = Map::new();
        for (i, (column, raw)) in columns.iter().zip(row.iter()).enumerate() {
            // first column is the annotation column
            if i == 0 && column.is_empty() {
                continue;
            }
            record.insert(
                column.clone(),
                typed_cell(datatypes.get(i).map(String::as_str), raw),
            );
        }
        records.push(Value::Object(record));
    }
    Ok(records)
}

/// Flux string literal
fn flux_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

struct InfluxClient {
    rest: RestClient,
    org: Option<String>,
    bucket: Option<String>,
}

impl InfluxClient {
    fn org_query(&self) -> Vec<(&'static str, String)> {
        self.org
            .iter()
            .map(|org| ("org", org.clone()))
            .collect()
    }

    async fn flux(&self, query: &str) -> Result<Vec<Value>> {
        debug!("Running Flux query: {}", query);
        let request = self
            .rest
            .post("/api/v2/query")
            .query(&self.org_query())
            .header(ACCEPT, "application/csv")
            .json(&json!({
                "query": query,
                "type": "flux",
                "dialect": { "header": true, "annotations": ["datatype"] }
            }));
        let body = self.rest.send_text(request).await?;
        parse_flux_csv(&body)
    }

    async fn write(&self, bucket: Option<String>, data: &Value) -> Result<Value> {
        let bucket = bucket
            .or_else(|| self.bucket.clone())
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| {
                ConnectorError::invalid_request("Write operation requires bucket and data")
            })?;
        let body = line_protocol(data)?;

        let mut params = self.org_query();
        params.push(("bucket", bucket));
        params.push(("precision", "ns".to_string()));
        let request = self
            .rest
            .post("/api/v2/write")
            .query(&params)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        self.rest.send_text(request).await?;
        Ok(json!({ "status": "success" }))
    }

    /// First column values of a schema function, e.g. `schema.measurements`
    async fn values(&self, flux: &str) -> Result<Vec<String>> {
        Ok(self
            .flux(flux)
            .await?
            .iter()
            .filter_map(|record| record["_value"].as_str().map(str::to_string))
            .collect())
    }

    async fn measurement(&self, bucket: &str, measurement: &str) -> Value {
        let import = "import \"influxdata/influxdb/schema\"\n\n";
        let fields = self
            .values(&format!(
                "{}schema.measurementFieldKeys(bucket: {}, measurement: {})",
                import,
                flux_string(bucket),
                flux_string(measurement)
            ))
            .await;
        let tags = self
            .values(&format!(
                "{}schema.measurementTagKeys(bucket: {}, measurement: {})",
                import,
                flux_string(bucket),
                flux_string(measurement)
            ))
            .await;
        if let Err(e) = fields.as_ref().and(tags.as_ref()) {
            warn!("Error getting keys for {}.{}: {}", bucket, measurement, e);
        }

        let tags: Vec<String> = tags
            .unwrap_or_default()
            .into_iter()
            .filter(|t| !t.starts_with('_'))
            .collect();
        json!({
            "name": measurement,
            "field_keys": fields.unwrap_or_default(),
            "tag_keys": tags,
        })
    }
}

pub struct InfluxDbConnector {
    ctx: ConnectorContext,
    client: Option<InfluxClient>,
}

impl InfluxDbConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx, client: None }
    }

    fn client(&self) -> Result<&InfluxClient> {
        self.client
            .as_ref()
            .ok_or_else(|| ConnectorError::connection("InfluxDB", "not connected"))
    }
}

#[async_trait]
impl Connectable for InfluxDbConnector {
    fn backend(&self) -> BackendType {
        BackendType::InfluxDb
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        let params = self.ctx.resolve(&INFLUXDB_SPEC)?;
        let base_url = match params.get("url") {
            Some(url) => url.to_string(),
            None => format!(
                "http://{}:{}",
                params.require("host")?,
                params.port("port", 8086)?
            ),
        };

        let mut headers = HeaderMap::new();
        if let Some(token) = params.get("token") {
            let value = HeaderValue::from_str(&format!("Token {}", token))
                .map_err(|e| ConnectorError::connection("InfluxDB", e))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = InfluxClient {
            rest: RestClient::with_headers(
                BackendType::InfluxDb,
                base_url,
                headers,
                self.ctx.connect_timeout(),
            )?,
            org: params.get("org").map(str::to_string),
            bucket: params.get("bucket").map(str::to_string),
        };

        debug!("Connecting to InfluxDB at {}", client.rest.base_url());
        client.rest.send_text(client.rest.get("/ping")).await?;
        self.client = Some(client);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

#[async_trait]
impl Queryable for InfluxDbConnector {
    async fn run_query(&mut self, query: &str) -> Result<Value> {
        let client = self.client()?;
        match QueryInput::parse(query) {
            QueryInput::Text(flux) => {
                require_non_empty("query", &flux)?;
                Ok(Value::Array(client.flux(&flux).await?))
            }
            QueryInput::Json(value) => match decode_operation_value::<InfluxOperation>(value)? {
                InfluxOperation::Query { flux_query } => {
                    Ok(Value::Array(client.flux(&flux_query).await?))
                }
                InfluxOperation::Write { bucket, data } => client.write(bucket, &data).await,
            },
        }
    }
}

#[async_trait]
impl SchemaIntrospectable for InfluxDbConnector {
    /// `{"buckets": [{"name", "id", "measurements": [{"name", "field_keys", "tag_keys"}]}]}`
    async fn fetch_schema(&mut self) -> Result<Value> {
        let client = self.client()?;
        let mut params = client.org_query();
        params.push(("limit", "100".to_string()));
        let listing = client
            .rest
            .send(client.rest.get("/api/v2/buckets").query(&params))
            .await?;

        let mut buckets = Vec::new();
        for bucket in listing["buckets"].as_array().into_iter().flatten() {
            let Some(name) = bucket["name"].as_str() else {
                continue;
            };
            let measurements = match client
                .values(&format!(
                    "import \"influxdata/influxdb/schema\"\n\nschema.measurements(bucket: {})",
                    flux_string(name)
                ))
                .await
            {
                Ok(names) => {
                    let mut out = Vec::with_capacity(names.len());
                    for measurement in names {
                        out.push(client.measurement(name, &measurement).await);
                    }
                    out
                }
                Err(e) => {
                    warn!("Error getting measurements for bucket {}: {}", name, e);
                    Vec::new()
                }
            };
            buckets.push(json!({
                "name": name,
                "id": bucket["id"],
                "measurements": measurements,
            }));
        }
        Ok(json!({ "buckets": buckets }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbbridge_core::{normalize, Connector, Credentials, ErrorKind};
    use wiremock::matchers::{body_string, body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CPU_CSV: &str = "#datatype,string,long,dateTime:RFC3339,string,string,double,boolean\r\n\
,result,table,_time,_measurement,host,_value,ok\r\n\
,_result,0,2024-01-01T00:00:00Z,cpu,a,0.5,true\r\n\
,_result,0,2024-01-01T00:01:00Z,cpu,a,,false\r\n\
\r\n\
#datatype,string,long,string,long\r\n\
,result,table,_field,_value\r\n\
,_result,1,count,42\r\n";

    async fn server() -> MockServer {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&mock_server)
            .await;
        mock_server
    }

    fn connector(url: &str) -> InfluxDbConnector {
        let creds = Credentials::new()
            .with("url", url)
            .with("token", "secret-token")
            .with("org", "acme")
            .with("bucket", "metrics");
        InfluxDbConnector::new(ConnectorContext::new(creds))
    }

    #[test]
    fn test_parse_annotated_csv() {
        let records = parse_flux_csv(CPU_CSV).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["_value"], json!(0.5));
        assert_eq!(records[0]["ok"], json!(true));
        assert_eq!(records[0]["table"], json!(0));
        assert_eq!(records[1]["_value"], Value::Null);
        assert_eq!(records[2]["_field"], json!("count"));
        assert_eq!(records[2]["_value"], json!(42));
        assert!(records[0].get("").is_none());
    }

    #[test]
    fn test_line_protocol_from_points() {
        let body = line_protocol(&json!([
            {
                "measurement": "cpu load",
                "tags": {"host": "web,1"},
                "fields": {"usage": 0.5, "cores": 4, "label": "say \"hi\"", "up": true},
                "time": "2024-01-01T00:00:00Z"
            },
            "mem,host=a used=1i"
        ]))
        .unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert!(lines[0].starts_with("cpu\\ load,host=web\\,1 "));
        assert!(lines[0].ends_with(" 1704067200000000000"));
        for field in ["cores=4i", "label=\"say \\\"hi\\\"\"", "up=true", "usage=0.5"] {
            assert!(lines[0].contains(field), "{} missing from {}", field, lines[0]);
        }
        assert_eq!(lines[1], "mem,host=a used=1i");

        let err = line_protocol(&json!([{"measurement": "cpu", "fields": {}}])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperationRequest);
        assert!(line_protocol(&json!(42)).is_err());
    }

    #[tokio::test]
    async fn test_flux_text_query() {
        let mock_server = server().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/query"))
            .and(query_param("org", "acme"))
            .and(header("authorization", "Token secret-token"))
            .and(body_string_contains("from(bucket"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CPU_CSV))
            .mount(&mock_server)
            .await;

        let mut influx = connector(&mock_server.uri());
        let result = influx
            .execute_query("from(bucket: \"metrics\") |> range(start: -1h)")
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.data.unwrap().as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_write_uses_default_bucket() {
        let mock_server = server().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/write"))
            .and(query_param("bucket", "metrics"))
            .and(query_param("precision", "ns"))
            .and(body_string("cpu,host=a usage=0.5"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&mock_server)
            .await;

        let mut influx = connector(&mock_server.uri());
        let result = influx
            .execute_query(r#"{"operation": "write", "data": "cpu,host=a usage=0.5"}"#)
            .await;
        assert_eq!(result.data, Some(json!({"status": "success"})));

        let result = influx
            .execute_query(r#"{"operation": "delete", "bucket": "metrics"}"#)
            .await;
        assert_eq!(result.kind, Some(ErrorKind::UnsupportedOperation));
    }

    #[tokio::test]
    async fn test_schema_buckets_and_measurements() {
        let mock_server = server().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/buckets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "buckets": [{"id": "b1", "name": "metrics"}]
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/query"))
            .and(body_string_contains("schema.measurements("))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "#datatype,string,long,string\r\n,result,table,_value\r\n,_result,0,cpu\r\n",
            ))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/query"))
            .and(body_string_contains("measurementFieldKeys"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "#datatype,string,long,string\r\n,result,table,_value\r\n,_result,0,usage\r\n",
            ))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/query"))
            .and(body_string_contains("measurementTagKeys"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "#datatype,string,long,string\r\n,result,table,_value\r\n,_result,0,_measurement\r\n,_result,0,host\r\n",
            ))
            .mount(&mock_server)
            .await;

        let mut influx = connector(&mock_server.uri());
        let schema = influx.get_schema().await;
        assert_eq!(schema["buckets"][0]["measurements"][0]["tag_keys"], json!(["host"]));

        let tree = normalize("influxdb", &schema);
        let cpu = tree.entity("metrics.cpu").unwrap();
        assert_eq!(cpu.fields.len(), 1);
        assert_eq!(cpu.tags.len(), 1);
    }
}
