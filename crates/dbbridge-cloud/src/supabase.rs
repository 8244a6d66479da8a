//! Supabase connector through the PostgREST endpoint
//!
//! Filters map to PostgREST query parameters: a scalar is `eq`, an object
//! names the operator (`{"age": {"gte": 18}}`), an array is `in`.

use async_trait::async_trait;
use dbbridge_core::operation::{require_filters, require_non_empty};
use dbbridge_core::{
    decode_operation, BackendType, Connectable, ConnectorContext, ConnectorError, CredentialSpec,
    FieldSpec, OperationSet, Queryable, RestClient, Result, SchemaIntrospectable,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

const SUPABASE_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::Supabase,
    url: None,
    fields: &[
        FieldSpec::required("url")
            .aliases(&["supabase_url"])
            .env("SUPABASE_URL"),
        FieldSpec::required("key")
            .aliases(&["supabase_key", "api_key"])
            .env("SUPABASE_KEY")
            .secret(),
    ],
};

const FILTER_OPERATORS: &[&str] = &[
    "eq", "neq", "gt", "gte", "lt", "lte", "like", "ilike", "is", "in", "cs", "cd",
];

#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
enum SupabaseOperation {
    Select {
        table: String,
        #[serde(default = "all_columns")]
        columns: String,
        #[serde(default)]
        filters: Option<Value>,
        #[serde(default)]
        order: Option<String>,
        #[serde(default)]
        limit: Option<u64>,
    },
    Insert {
        table: String,
        data: Value,
    },
    Update {
        table: String,
        data: Map<String, Value>,
        #[serde(default)]
        filters: Option<Value>,
    },
    Delete {
        table: String,
        #[serde(default)]
        filters: Option<Value>,
    },
}

fn all_columns() -> String {
    "*".to_string()
}

impl OperationSet for SupabaseOperation {
    const OPERATIONS: &'static [&'static str] = &["select", "insert", "update", "delete"];

    fn validate(&self) -> Result<()> {
        match self {
            SupabaseOperation::Select { table, filters, .. } => {
                require_non_empty("table", table)?;
                filter_params(filters.as_ref()).map(|_| ())
            }
            SupabaseOperation::Insert { table, data } => {
                require_non_empty("table", table)?;
                match data {
                    Value::Object(_) | Value::Array(_) => Ok(()),
                    _ => Err(ConnectorError::invalid_request(
                        "Field 'data' must be an object or a list of objects",
                    )),
                }
            }
            SupabaseOperation::Update { table, filters, .. } => {
                require_non_empty("table", table)?;
                require_filters(filters.as_ref())?;
                filter_params(filters.as_ref()).map(|_| ())
            }
            SupabaseOperation::Delete { table, filters } => {
                require_non_empty("table", table)?;
                require_filters(filters.as_ref())?;
                filter_params(filters.as_ref()).map(|_| ())
            }
        }
    }
}

fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// `column=op.value` pairs for a filter object
fn filter_params(filters: Option<&Value>) -> Result<Vec<(String, String)>> {
    let filters = match filters {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(ConnectorError::invalid_request(
                "Field 'filters' must be an object",
            ))
        }
    };

    let mut params = Vec::new();
    for (column, condition) in filters {
        match condition {
            Value::Object(ops) => {
                for (op, value) in ops {
                    if !FILTER_OPERATORS.contains(&op.as_str()) {
                        return Err(ConnectorError::invalid_request(format!(
                            "Unsupported filter operator: {}",
                            op
                        )));
                    }
                    let rendered = match value {
                        Value::Array(items) => in_list(items),
                        other => literal(other),
                    };
                    params.push((column.clone(), format!("{}.{}", op, rendered)));
                }
            }
            Value::Array(items) => params.push((column.clone(), format!("in.{}", in_list(items)))),
            Value::Null => params.push((column.clone(), "is.null".to_string())),
            scalar => params.push((column.clone(), format!("eq.{}", literal(scalar)))),
        }
    }
    Ok(params)
}

fn in_list(items: &[Value]) -> String {
    let values: Vec<String> = items.iter().map(literal).collect();
    format!("({})", values.join(","))
}

struct SupabaseClient {
    rest: RestClient,
}

impl SupabaseClient {
    fn table(&self, method: Method, table: &str) -> RequestBuilder {
        self.rest
            .request(method, &format!("/rest/v1/{}", urlencoding::encode(table)))
    }

    async fn run(&self, operation: SupabaseOperation) -> Result<Value> {
        let request = match operation {
            SupabaseOperation::Select {
                table,
                columns,
                filters,
                order,
                limit,
            } => {
                let mut request = self
                    .table(Method::GET, &table)
                    .query(&[("select", columns)])
                    .query(&filter_params(filters.as_ref())?);
                if let Some(order) = order {
                    request = request.query(&[("order", order)]);
                }
                if let Some(limit) = limit {
                    request = request.query(&[("limit", limit)]);
                }
                request
            }
            SupabaseOperation::Insert { table, data } => self
                .table(Method::POST, &table)
                .header("Prefer", "return=representation")
                .json(&data),
            SupabaseOperation::Update {
                table,
                data,
                filters,
            } => self
                .table(Method::PATCH, &table)
                .query(&filter_params(filters.as_ref())?)
                .header("Prefer", "return=representation")
                .json(&data),
            SupabaseOperation::Delete { table, filters } => self
                .table(Method::DELETE, &table)
                .query(&filter_params(filters.as_ref())?)
                .header("Prefer", "return=representation"),
        };

        let rows = self.rest.send(request).await?;
        Ok(match rows {
            Value::Null => Value::Array(Vec::new()),
            other => other,
        })
    }
}

/// Tables and columns from the PostgREST OpenAPI `definitions`
fn openapi_tables(spec: &Value) -> Value {
    let tables: Vec<Value> = spec["definitions"]
        .as_object()
        .map(|defs| {
            defs.iter()
                .map(|(name, def)| {
                    let required: Vec<&str> = def["required"]
                        .as_array()
                        .map(|r| r.iter().filter_map(Value::as_str).collect())
                        .unwrap_or_default();
                    let columns: Vec<Value> = def["properties"]
                        .as_object()
                        .map(|props| {
                            props
                                .iter()
                                .map(|(column, prop)| {
                                    let description = prop["description"].as_str().unwrap_or("");
                                    json!({
                                        "name": column,
                                        "type": prop["format"].as_str()
                                            .or_else(|| prop["type"].as_str())
                                            .unwrap_or("unknown"),
                                        "nullable": !required.contains(&column.as_str()),
                                        "primary_key": description.contains("<pk/>"),
                                    })
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    json!({ "name": name, "columns": columns })
                })
                .collect()
        })
        .unwrap_or_default();
    json!({ "tables": tables })
}

pub struct SupabaseConnector {
    ctx: ConnectorContext,
    client: Option<SupabaseClient>,
}

impl SupabaseConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx, client: None }
    }

    fn client(&self) -> Result<&SupabaseClient> {
        self.client
            .as_ref()
            .ok_or_else(|| ConnectorError::connection("Supabase", "not connected"))
    }
}

#[async_trait]
impl Connectable for SupabaseConnector {
    fn backend(&self) -> BackendType {
        BackendType::Supabase
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        let params = self.ctx.resolve(&SUPABASE_SPEC)?;
        let url = params.require("url")?;
        let key = params.require("key")?;

        let invalid = |_| ConnectorError::connection("Supabase", "API key contains invalid characters");
        let mut headers = HeaderMap::new();
        headers.insert("apikey", HeaderValue::from_str(key).map_err(invalid)?);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", key)).map_err(invalid)?,
        );
        let client = SupabaseClient {
            rest: RestClient::with_headers(
                BackendType::Supabase,
                url,
                headers,
                self.ctx.connect_timeout(),
            )?,
        };

        debug!("Checking Supabase REST endpoint at {}", client.rest.base_url());
        client.rest.send(client.rest.get("/rest/v1/")).await?;
        self.client = Some(client);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

#[async_trait]
impl Queryable for SupabaseConnector {
    fn prepare(&self, query: &str) -> Result<()> {
        decode_operation::<SupabaseOperation>(query).map(|_| ())
    }

    async fn run_query(&mut self, query: &str) -> Result<Value> {
        let operation: SupabaseOperation = decode_operation(query)?;
        self.client()?.run(operation).await
    }
}

#[async_trait]
impl SchemaIntrospectable for SupabaseConnector {
    async fn fetch_schema(&mut self) -> Result<Value> {
        let client = self.client()?;
        let spec = client.rest.send(client.rest.get("/rest/v1/")).await?;
        Ok(openapi_tables(&spec))
    }
}
