//! TimescaleDB connector
//!
//! Connects and queries through the PostgreSQL connector; the schema lists
//! hypertables with their time dimension.

use async_trait::async_trait;
use dbbridge_core::{
    BackendType, Connectable, ConnectorContext, ConnectorError, Queryable, Result,
    SchemaIntrospectable,
};
use dbbridge_relational::postgres::{pg_error, run_sql, PostgresConnector, PostgresFlavor};
use serde_json::{json, Value};
use std::time::Duration;

const HYPERTABLE_COLUMNS_SQL: &str = r#"
SELECT h.hypertable_schema::text,
       h.hypertable_name::text,
       d.column_name::text AS time_column,
       c.column_name::text,
       c.data_type::text
FROM timescaledb_information.hypertables h
LEFT JOIN timescaledb_information.dimensions d
  ON d.hypertable_schema = h.hypertable_schema
 AND d.hypertable_name = h.hypertable_name
 AND d.dimension_number = 1
JOIN information_schema.columns c
  ON c.table_schema = h.hypertable_schema
 AND c.table_name = h.hypertable_name
ORDER BY h.hypertable_schema, h.hypertable_name, c.ordinal_position
"#;

/// One row of [`HYPERTABLE_COLUMNS_SQL`]
#[derive(Debug, Clone, PartialEq)]
struct HypertableColumn {
    schema: String,
    table: String,
    time_column: Option<String>,
    column: String,
    data_type: String,
}

/// `{"hypertables": [{"schema", "name", "time_column", "columns": [{"name", "type", "is_time_column"}]}]}`
fn hypertables_value(rows: &[HypertableColumn]) -> Value {
    let mut hypertables: Vec<Value> = Vec::new();
    let mut current: Option<(&str, &str)> = None;

    for row in rows {
        if current != Some((row.schema.as_str(), row.table.as_str())) {
            current = Some((row.schema.as_str(), row.table.as_str()));
            hypertables.push(json!({
                "schema": row.schema,
                "name": row.table,
                "time_column": row.time_column,
                "columns": [],
            }));
        }
        if let Some(columns) = hypertables
            .last_mut()
            .and_then(|h| h["columns"].as_array_mut())
        {
            columns.push(json!({
                "name": row.column,
                "type": row.data_type,
                "is_time_column": row.time_column.as_deref() == Some(row.column.as_str()),
            }));
        }
    }
    json!({ "hypertables": hypertables })
}

pub struct TimescaleDbConnector {
    inner: PostgresConnector,
}

impl TimescaleDbConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self {
            inner: PostgresConnector::with_flavor(ctx, PostgresFlavor::TimescaleDb),
        }
    }
}

#[async_trait]
impl Connectable for TimescaleDbConnector {
    fn backend(&self) -> BackendType {
        BackendType::TimescaleDb
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn connect_timeout(&self) -> Duration {
        self.inner.connect_timeout()
    }

    async fn open(&mut self) -> Result<()> {
        self.inner.open().await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

#[async_trait]
impl Queryable for TimescaleDbConnector {
    async fn run_query(&mut self, query: &str) -> Result<Value> {
        run_sql(self.inner.client()?, query).await
    }
}

#[async_trait]
impl SchemaIntrospectable for TimescaleDbConnector {
    async fn fetch_schema(&mut self) -> Result<Value> {
        let rows = self
            .inner
            .client()?
            .query(HYPERTABLE_COLUMNS_SQL, &[])
            .await
            .map_err(|e| ConnectorError::query(pg_error(&e)))?;

        let columns: Vec<HypertableColumn> = rows
            .iter()
            .map(|row| HypertableColumn {
                schema: row.get::<_, Option<String>>(0).unwrap_or_default(),
                table: row.get::<_, Option<String>>(1).unwrap_or_default(),
                time_column: row.get(2),
                column: row.get::<_, Option<String>>(3).unwrap_or_default(),
                data_type: row.get::<_, Option<String>>(4).unwrap_or_default(),
            })
            .collect();
        Ok(hypertables_value(&columns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbbridge_core::{normalize, Connector, Credentials, ErrorKind};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn column(table: &str, column: &str, data_type: &str) -> HypertableColumn {
        HypertableColumn {
            schema: "public".to_string(),
            table: table.to_string(),
            time_column: Some("time".to_string()),
            column: column.to_string(),
            data_type: data_type.to_string(),
        }
    }

    #[test]
    fn test_hypertables_mark_time_column() {
        let value = hypertables_value(&[
            column("conditions", "time", "timestamp with time zone"),
            column("conditions", "temperature", "double precision"),
            column("readings", "time", "timestamp with time zone"),
        ]);
        let hypertables = value["hypertables"].as_array().unwrap();
        assert_eq!(hypertables.len(), 2);
        assert_eq!(hypertables[0]["time_column"], "time");
        assert_eq!(hypertables[0]["columns"][0]["is_time_column"], true);
        assert_eq!(hypertables[0]["columns"][1]["is_time_column"], false);

        let tree = normalize("timescaledb", &value);
        assert_eq!(tree.entity("conditions").unwrap().fields.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_database() {
        let ctx = ConnectorContext::with_env(
            Credentials::new().with("host", "localhost"),
            Arc::new(HashMap::<String, String>::new()),
        );
        let mut connector = TimescaleDbConnector::new(ctx);
        let result = connector.execute_query("SELECT 1").await;
        assert_eq!(result.kind, Some(ErrorKind::MissingCredential));
        assert!(result.error.unwrap().contains("database"));
    }
}
