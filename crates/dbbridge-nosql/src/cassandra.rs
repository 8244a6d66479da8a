//! Cassandra connector (CQL text queries over the scylla driver)

use async_trait::async_trait;
use dbbridge_core::{
    BackendType, Connectable, ConnectorContext, ConnectorError, CredentialSpec, FieldSpec,
    Queryable, Result, SchemaIntrospectable,
};
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::value::{CqlValue, Row};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, error};

const CASSANDRA_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::Cassandra,
    url: None,
    fields: &[
        FieldSpec::optional("host")
            .aliases(&["hostname", "contact_point"])
            .env("CASSANDRA_HOST")
            .default_value("localhost"),
        FieldSpec::optional("port").default_value("9042"),
        FieldSpec::optional("username").aliases(&["user"]),
        FieldSpec::optional("password").secret(),
        FieldSpec::optional("keyspace").aliases(&["keyspace_name"]),
    ],
};

const COLUMNS_CQL: &str =
    "SELECT keyspace_name, table_name, column_name, type, kind FROM system_schema.columns";

pub struct CassandraConnector {
    ctx: ConnectorContext,
    session: Option<Session>,
}

impl CassandraConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx, session: None }
    }

    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| ConnectorError::connection("Cassandra", "not connected"))
    }

    async fn select(&self, cql: &str) -> Result<Vec<Value>> {
        let result = self
            .session()?
            .query_unpaged(cql, &[])
            .await
            .map_err(ConnectorError::query)?;

        if !result.is_rows() {
            return Ok(Vec::new());
        }
        let rows = result.into_rows_result().map_err(ConnectorError::query)?;
        let names: Vec<String> = rows
            .column_specs()
            .iter()
            .map(|spec| spec.name().to_string())
            .collect();

        let mut out = Vec::new();
        for row in rows.rows::<Row>().map_err(ConnectorError::query)? {
            let row = row.map_err(ConnectorError::query)?;
            let object: Map<String, Value> = names
                .iter()
                .cloned()
                .zip(row.columns.into_iter().map(|c| c.map(cql_to_json).unwrap_or(Value::Null)))
                .collect();
            out.push(Value::Object(object));
        }
        Ok(out)
    }
}

#[async_trait]
impl Connectable for CassandraConnector {
    fn backend(&self) -> BackendType {
        BackendType::Cassandra
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        let params = self.ctx.resolve(&CASSANDRA_SPEC)?;
        let node = format!(
            "{}:{}",
            params.require("host")?,
            params.port("port", 9042)?
        );
        debug!("Connecting to Cassandra node {}", node);

        let mut builder = SessionBuilder::new()
            .known_node(&node)
            .connection_timeout(self.ctx.connect_timeout());
        if let (Some(username), Some(password)) = (params.get("username"), params.get("password"))
        {
            builder = builder.user(username, password);
        }

        let session = builder.build().await.map_err(|e| {
            error!("Cassandra session failed: {}", e);
            ConnectorError::connection("Cassandra", e)
        })?;

        if let Some(keyspace) = params.get("keyspace") {
            session
                .use_keyspace(keyspace, false)
                .await
                .map_err(|e| ConnectorError::connection("Cassandra", e))?;
        }

        self.session = Some(session);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.session = None;
        Ok(())
    }
}

#[async_trait]
impl Queryable for CassandraConnector {
    /// Statements without a result set return an empty list
    async fn run_query(&mut self, query: &str) -> Result<Value> {
        let cql = query.trim().trim_end_matches(';');
        if cql.is_empty() {
            return Err(ConnectorError::invalid_request("Query is empty"));
        }
        Ok(Value::Array(self.select(cql).await?))
    }
}

#[async_trait]
impl SchemaIntrospectable for CassandraConnector {
    async fn fetch_schema(&mut self) -> Result<Value> {
        let rows = self.select(COLUMNS_CQL).await?;
        Ok(keyspaces_value(&rows))
    }
}

/// Group `system_schema.columns` rows into keyspaces → tables → columns
fn keyspaces_value(rows: &[Value]) -> Value {
    let mut keyspaces: BTreeMap<&str, BTreeMap<&str, Vec<Value>>> = BTreeMap::new();
    for row in rows {
        let text = |key: &str| row.get(key).and_then(Value::as_str);
        let (Some(keyspace), Some(table), Some(column)) =
            (text("keyspace_name"), text("table_name"), text("column_name"))
        else {
            continue;
        };
        if keyspace.starts_with("system") {
            continue;
        }
        let kind = text("kind").unwrap_or("regular");
        keyspaces
            .entry(keyspace)
            .or_default()
            .entry(table)
            .or_default()
            .push(json!({
                "name": column,
                "type": text("type").unwrap_or("unknown"),
                "kind": kind,
                "primary_key": kind == "partition_key" || kind == "clustering",
            }));
    }

    let keyspaces: Vec<Value> = keyspaces
        .into_iter()
        .map(|(name, tables)| {
            let tables: Vec<Value> = tables
                .into_iter()
                .map(|(table, columns)| json!({ "name": table, "columns": columns }))
                .collect();
            json!({ "name": name, "tables": tables })
        })
        .collect();
    json!({ "keyspaces": keyspaces })
}

fn cql_to_json(value: CqlValue) -> Value {
    match value {
        CqlValue::Ascii(s) | CqlValue::Text(s) => Value::String(s),
        CqlValue::Boolean(b) => Value::Bool(b),
        CqlValue::TinyInt(i) => json!(i),
        CqlValue::SmallInt(i) => json!(i),
        CqlValue::Int(i) => json!(i),
        CqlValue::BigInt(i) => json!(i),
        CqlValue::Counter(c) => json!(c.0),
        CqlValue::Float(f) => json!(f),
        CqlValue::Double(f) => json!(f),
        CqlValue::Timestamp(ts) => json!(ts.0),
        CqlValue::Uuid(u) => Value::String(u.to_string()),
        CqlValue::Inet(ip) => Value::String(ip.to_string()),
        CqlValue::Blob(bytes) => Value::String(hex::encode(bytes)),
        CqlValue::Empty => Value::Null,
        CqlValue::List(items) | CqlValue::Set(items) => {
            Value::Array(items.into_iter().map(cql_to_json).collect())
        }
        CqlValue::Tuple(items) => Value::Array(
            items
                .into_iter()
                .map(|v| v.map(cql_to_json).unwrap_or(Value::Null))
                .collect(),
        ),
        CqlValue::Map(pairs) => {
            let map: Map<String, Value> = pairs
                .into_iter()
                .map(|(k, v)| {
                    let key = match cql_to_json(k) {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (key, cql_to_json(v))
                })
                .collect();
            Value::Object(map)
        }
        CqlValue::UserDefinedType { fields, .. } => {
            let map: Map<String, Value> = fields
                .into_iter()
                .map(|(name, v)| (name, v.map(cql_to_json).unwrap_or(Value::Null)))
                .collect();
            Value::Object(map)
        }
        other => Value::String(format!("{:?}", other)),
    }
}
