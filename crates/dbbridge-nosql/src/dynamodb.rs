//! Amazon DynamoDB connector
//!
//! Items, keys and expression values are plain JSON; numbers become `N`
//! attributes and objects become maps. Binary attributes come back base64
//! encoded.

use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::config::Credentials as AwsCredentials;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use base64::Engine;
use dbbridge_core::operation::{require_filters, require_non_empty};
use dbbridge_core::{
    decode_operation, BackendType, Connectable, ConnectorContext, ConnectorError, CredentialSpec,
    FieldSpec, OperationSet, Queryable, Result, SchemaIntrospectable, HTTP_TIMEOUT,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::debug;

const DYNAMODB_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::DynamoDb,
    url: None,
    fields: &[
        FieldSpec::required("access_key")
            .aliases(&["aws_access_key_id"])
            .env("AWS_ACCESS_KEY_ID"),
        FieldSpec::required("secret_key")
            .aliases(&["aws_secret_access_key"])
            .env("AWS_SECRET_ACCESS_KEY")
            .secret(),
        FieldSpec::optional("session_token")
            .aliases(&["aws_session_token"])
            .secret(),
        FieldSpec::optional("region")
            .aliases(&["aws_region", "region_name"])
            .env("AWS_REGION")
            .default_value("us-east-1"),
        FieldSpec::optional("endpoint_url")
            .aliases(&["endpoint"])
            .env("DYNAMODB_ENDPOINT"),
    ],
};

type Item = HashMap<String, AttributeValue>;

#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
enum DynamoOperation {
    Scan {
        table: String,
        #[serde(default)]
        filter_expression: Option<String>,
        #[serde(default)]
        attributes_to_get: Option<Vec<String>>,
        #[serde(flatten)]
        expression: ExpressionAttributes,
    },
    Query {
        table: String,
        #[serde(default)]
        key_condition: String,
        #[serde(default)]
        filter_expression: Option<String>,
        #[serde(flatten)]
        expression: ExpressionAttributes,
    },
    GetItem {
        table: String,
        #[serde(default)]
        key: Map<String, Value>,
    },
    PutItem {
        table: String,
        #[serde(default)]
        item: Map<String, Value>,
    },
    UpdateItem {
        table: String,
        #[serde(default)]
        key: Map<String, Value>,
        #[serde(default)]
        update_expression: String,
        #[serde(flatten)]
        expression: ExpressionAttributes,
    },
    DeleteItem {
        table: String,
        #[serde(default)]
        key: Option<Value>,
    },
}

/// `:placeholder` values and `#name` aliases shared by expression-based operations
#[derive(Debug, Default, Deserialize)]
struct ExpressionAttributes {
    #[serde(default)]
    expression_attribute_values: Option<Map<String, Value>>,
    #[serde(default)]
    expression_attribute_names: Option<HashMap<String, String>>,
}

impl ExpressionAttributes {
    fn values(&self) -> Option<Item> {
        self.expression_attribute_values.as_ref().map(to_item)
    }
}

impl DynamoOperation {
    fn table(&self) -> &str {
        match self {
            DynamoOperation::Scan { table, .. }
            | DynamoOperation::Query { table, .. }
            | DynamoOperation::GetItem { table, .. }
            | DynamoOperation::PutItem { table, .. }
            | DynamoOperation::UpdateItem { table, .. }
            | DynamoOperation::DeleteItem { table, .. } => table,
        }
    }
}

impl OperationSet for DynamoOperation {
    const OPERATIONS: &'static [&'static str] = &[
        "scan",
        "query",
        "get_item",
        "put_item",
        "update_item",
        "delete_item",
    ];

    fn validate(&self) -> Result<()> {
        require_non_empty("table", self.table())?;
        let missing = |message: &str| Err(ConnectorError::invalid_request(message));
        match self {
            DynamoOperation::Query { key_condition, .. } if key_condition.trim().is_empty() => {
                missing("Query operation requires key condition")
            }
            DynamoOperation::GetItem { key, .. } if key.is_empty() => {
                missing("Get item operation requires key")
            }
            DynamoOperation::PutItem { item, .. } if item.is_empty() => {
                missing("Put item operation requires item")
            }
            DynamoOperation::UpdateItem {
                key,
                update_expression,
                ..
            } if key.is_empty() || update_expression.trim().is_empty() => {
                missing("Update item operation requires key and update expression")
            }
            DynamoOperation::DeleteItem { key, .. } => require_filters(key.as_ref()),
            _ => Ok(()),
        }
    }
}

pub struct DynamoDbConnector {
    ctx: ConnectorContext,
    client: Option<Client>,
}

impl DynamoDbConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx, client: None }
    }

    async fn build_client(&self) -> Result<Client> {
        let params = self.ctx.resolve(&DYNAMODB_SPEC)?;
        let credentials = AwsCredentials::new(
            params.require("access_key")?,
            params.require("secret_key")?,
            params.get("session_token").map(str::to_string),
            None,
            "dbbridge",
        );
        let timeouts = TimeoutConfig::builder()
            .connect_timeout(self.ctx.connect_timeout())
            .operation_timeout(HTTP_TIMEOUT)
            .build();

        let region = params.require("region")?.to_string();
        debug!("Creating DynamoDB client for region {}", region);

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(credentials)
            .timeout_config(timeouts);
        if let Some(endpoint) = params.get("endpoint_url") {
            debug!("Using DynamoDB endpoint {}", endpoint);
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Ok(Client::new(&config))
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| ConnectorError::connection("DynamoDB", "not connected"))
    }
}

/// SDK errors print only their category; include the service message
fn sdk_error<E: std::error::Error>(err: E) -> ConnectorError {
    ConnectorError::query(DisplayErrorContext(err))
}

#[async_trait]
impl Connectable for DynamoDbConnector {
    fn backend(&self) -> BackendType {
        BackendType::DynamoDb
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        let client = self.build_client().await?;
        client
            .list_tables()
            .limit(1)
            .send()
            .await
            .map_err(|e| ConnectorError::connection("DynamoDB", DisplayErrorContext(e)))?;
        self.client = Some(client);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

#[async_trait]
impl Queryable for DynamoDbConnector {
    fn prepare(&self, query: &str) -> Result<()> {
        decode_operation::<DynamoOperation>(query).map(|_| ())
    }

    async fn run_query(&mut self, query: &str) -> Result<Value> {
        let operation: DynamoOperation = decode_operation(query)?;
        let client = self.client()?;
        let success = || json!({ "status": "success" });

        match operation {
            DynamoOperation::Scan {
                table,
                filter_expression,
                attributes_to_get,
                expression,
            } => {
                let output = client
                    .scan()
                    .table_name(table)
                    .set_filter_expression(filter_expression)
                    .set_projection_expression(attributes_to_get.map(|a| a.join(", ")))
                    .set_expression_attribute_values(expression.values())
                    .set_expression_attribute_names(expression.expression_attribute_names)
                    .send()
                    .await
                    .map_err(sdk_error)?;
                Ok(items_to_json(output.items()))
            }
            DynamoOperation::Query {
                table,
                key_condition,
                filter_expression,
                expression,
            } => {
                let output = client
                    .query()
                    .table_name(table)
                    .key_condition_expression(key_condition)
                    .set_filter_expression(filter_expression)
                    .set_expression_attribute_values(expression.values())
                    .set_expression_attribute_names(expression.expression_attribute_names)
                    .send()
                    .await
                    .map_err(sdk_error)?;
                Ok(items_to_json(output.items()))
            }
            DynamoOperation::GetItem { table, key } => {
                let output = client
                    .get_item()
                    .table_name(table)
                    .set_key(Some(to_item(&key)))
                    .send()
                    .await
                    .map_err(sdk_error)?;
                Ok(output.item().map(item_to_json).unwrap_or(Value::Null))
            }
            DynamoOperation::PutItem { table, item } => {
                client
                    .put_item()
                    .table_name(table)
                    .set_item(Some(to_item(&item)))
                    .send()
                    .await
                    .map_err(sdk_error)?;
                Ok(success())
            }
            DynamoOperation::UpdateItem {
                table,
                key,
                update_expression,
                expression,
            } => {
                client
                    .update_item()
                    .table_name(table)
                    .set_key(Some(to_item(&key)))
                    .update_expression(update_expression)
                    .set_expression_attribute_values(expression.values())
                    .set_expression_attribute_names(expression.expression_attribute_names)
                    .send()
                    .await
                    .map_err(sdk_error)?;
                Ok(success())
            }
            DynamoOperation::DeleteItem { table, key } => {
                let key = match key {
                    Some(Value::Object(key)) => key,
                    _ => {
                        return Err(ConnectorError::invalid_request(
                            "Field 'key' must be a JSON object",
                        ))
                    }
                };
                client
                    .delete_item()
                    .table_name(table)
                    .set_key(Some(to_item(&key)))
                    .send()
                    .await
                    .map_err(sdk_error)?;
                Ok(success())
            }
        }
    }
}

#[async_trait]
impl SchemaIntrospectable for DynamoDbConnector {
    async fn fetch_schema(&mut self) -> Result<Value> {
        let client = self.client()?;

        let mut names = Vec::new();
        let mut start: Option<String> = None;
        loop {
            let page = client
                .list_tables()
                .set_exclusive_start_table_name(start.take())
                .send()
                .await
                .map_err(sdk_error)?;
            names.extend(page.table_names().iter().cloned());
            match page.last_evaluated_table_name() {
                Some(last) => start = Some(last.to_string()),
                None => break,
            }
        }

        let mut tables = Vec::new();
        for name in names {
            let described = client
                .describe_table()
                .table_name(&name)
                .send()
                .await
                .map_err(sdk_error)?;
            let Some(table) = described.table() else {
                continue;
            };
            let key_schema: Vec<Value> = table
                .key_schema()
                .iter()
                .map(|k| json!({ "AttributeName": k.attribute_name(), "KeyType": k.key_type().as_str() }))
                .collect();
            let attributes: Vec<Value> = table
                .attribute_definitions()
                .iter()
                .map(|a| {
                    json!({ "AttributeName": a.attribute_name(), "AttributeType": a.attribute_type().as_str() })
                })
                .collect();
            tables.push(json!({
                "name": name,
                "key_schema": key_schema,
                "attribute_definitions": attributes,
            }));
        }

        Ok(json!({ "tables": tables }))
    }
}

fn to_item(map: &Map<String, Value>) -> Item {
    map.iter()
        .map(|(k, v)| (k.clone(), to_attribute(v)))
        .collect()
}

fn to_attribute(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(to_attribute).collect()),
        Value::Object(map) => AttributeValue::M(to_item(map)),
    }
}

fn items_to_json(items: &[Item]) -> Value {
    Value::Array(items.iter().map(item_to_json).collect())
}

fn item_to_json(item: &Item) -> Value {
    let map: Map<String, Value> = item
        .iter()
        .map(|(k, v)| (k.clone(), attribute_to_json(v)))
        .collect();
    Value::Object(map)
}

fn number(n: &str) -> Value {
    if let Ok(i) = n.parse::<i64>() {
        return json!(i);
    }
    n.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(n.to_string()))
}

fn blob(b: &Blob) -> Value {
    Value::String(base64::engine::general_purpose::STANDARD.encode(b.as_ref()))
}

fn attribute_to_json(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => number(n),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::B(b) => blob(b),
        AttributeValue::L(items) => Value::Array(items.iter().map(attribute_to_json).collect()),
        AttributeValue::M(map) => item_to_json(map),
        AttributeValue::Ss(items) => json!(items),
        AttributeValue::Ns(items) => Value::Array(items.iter().map(|n| number(n)).collect()),
        AttributeValue::Bs(items) => Value::Array(items.iter().map(blob).collect()),
        _ => Value::Null,
    }
}
