//! MySQL connector, shared by MariaDB and Google Cloud SQL
//!
//! Cloud SQL is reached through the Cloud SQL Auth Proxy, so it is an ordinary
//! MySQL connection to the proxy's local address.

use crate::catalog::{tables_value, yes_no, BatchResult, ColumnInfo};
use async_trait::async_trait;
use dbbridge_core::sql::split_statements;
use dbbridge_core::{
    BackendType, Connectable, ConnectorContext, ConnectorError, CredentialSpec, FieldSpec,
    Queryable, Result, SchemaIntrospectable, UrlSpec,
};
use futures::TryStreamExt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Column, ConnectOptions, Connection, Either, Row, TypeInfo, ValueRef};
use std::time::Duration;
use tracing::{debug, info};

const MYSQL_FIELDS: &[FieldSpec] = &[
    FieldSpec::optional("host")
        .aliases(&["hostname"])
        .env("MYSQL_HOST")
        .default_value("localhost"),
    FieldSpec::optional("port").env("MYSQL_PORT").default_value("3306"),
    FieldSpec::optional("username").aliases(&["user"]).env("MYSQL_USER"),
    FieldSpec::optional("password").env("MYSQL_PASSWORD").secret(),
    FieldSpec::required("database")
        .aliases(&["database_name", "db_name"])
        .env("MYSQL_DATABASE"),
];

const MYSQL_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::MySql,
    url: Some(UrlSpec::complete(&["connection_string"])),
    fields: MYSQL_FIELDS,
};

const MARIADB_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::MariaDb,
    url: Some(UrlSpec::complete(&["connection_string"])),
    fields: MYSQL_FIELDS,
};

const CLOUD_SQL_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::CloudSql,
    url: Some(UrlSpec::complete(&["connection_string"])),
    fields: &[
        FieldSpec::required("project_id")
            .aliases(&["gcp_project_id"])
            .env("GCP_PROJECT_ID"),
        FieldSpec::optional("region")
            .aliases(&["gcp_region"])
            .default_value("us-central1"),
        FieldSpec::required("instance").aliases(&["instance_name"]),
        FieldSpec::optional("host").default_value("127.0.0.1"),
        FieldSpec::optional("port").default_value("3306"),
        FieldSpec::optional("username").aliases(&["user"]),
        FieldSpec::optional("password").secret(),
        FieldSpec::optional("database").aliases(&["database_name", "db_name"]),
    ],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MySqlFlavor {
    MySql,
    MariaDb,
    CloudSql,
}

impl MySqlFlavor {
    pub fn backend(self) -> BackendType {
        match self {
            MySqlFlavor::MySql => BackendType::MySql,
            MySqlFlavor::MariaDb => BackendType::MariaDb,
            MySqlFlavor::CloudSql => BackendType::CloudSql,
        }
    }

    fn credential_spec(self) -> &'static CredentialSpec {
        match self {
            MySqlFlavor::MySql => &MYSQL_SPEC,
            MySqlFlavor::MariaDb => &MARIADB_SPEC,
            MySqlFlavor::CloudSql => &CLOUD_SQL_SPEC,
        }
    }
}

pub struct MySqlConnector {
    ctx: ConnectorContext,
    flavor: MySqlFlavor,
    conn: Option<MySqlConnection>,
}

impl MySqlConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self::with_flavor(ctx, MySqlFlavor::MySql)
    }

    pub fn with_flavor(ctx: ConnectorContext, flavor: MySqlFlavor) -> Self {
        Self {
            ctx,
            flavor,
            conn: None,
        }
    }

    fn display_name(&self) -> &'static str {
        self.flavor.backend().display_name()
    }

    fn conn(&mut self) -> Result<&mut MySqlConnection> {
        let name = self.display_name();
        self.conn
            .as_mut()
            .ok_or_else(|| ConnectorError::connection(name, "not connected"))
    }

    pub fn build_options(&self) -> Result<MySqlConnectOptions> {
        let name = self.display_name();
        let params = self.ctx.resolve(self.flavor.credential_spec())?;

        if let Some(url) = params.url() {
            return url.parse::<MySqlConnectOptions>().map_err(|e| {
                ConnectorError::connection(name, format!("Invalid connection string: {}", e))
            });
        }

        if self.flavor == MySqlFlavor::CloudSql {
            info!(
                "Connecting to Cloud SQL instance {}:{}:{} through the auth proxy",
                params.get("project_id").unwrap_or_default(),
                params.get("region").unwrap_or_default(),
                params.get("instance").unwrap_or_default()
            );
        }

        let mut options = MySqlConnectOptions::new()
            .host(params.get("host").unwrap_or("localhost"))
            .port(params.port("port", 3306)?);
        if let Some(user) = params.get("username") {
            options = options.username(user);
        }
        if let Some(password) = params.get("password") {
            options = options.password(password);
        }
        if let Some(database) = params.get("database") {
            options = options.database(database);
        }
        Ok(options)
    }
}

#[async_trait]
impl Connectable for MySqlConnector {
    fn backend(&self) -> BackendType {
        self.flavor.backend()
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn connect_timeout(&self) -> Duration {
        self.ctx.connect_timeout()
    }

    async fn open(&mut self) -> Result<()> {
        let name = self.display_name();
        let options = self.build_options()?;
        debug!(
            "Connecting to {} at {}:{}",
            name,
            options.get_host(),
            options.get_port()
        );

        let mut conn = options
            .connect()
            .await
            .map_err(|e| ConnectorError::connection(name, e))?;
        conn.ping()
            .await
            .map_err(|e| ConnectorError::connection(name, e))?;

        self.conn = Some(conn);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close()
                .await
                .map_err(|e| ConnectorError::connection(self.display_name(), e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Queryable for MySqlConnector {
    async fn run_query(&mut self, query: &str) -> Result<Value> {
        let statements = split_statements(query);
        if statements.is_empty() {
            return Err(ConnectorError::invalid_request("Query is empty"));
        }

        let conn = self.conn()?;
        let mut batch = BatchResult::new(&statements);
        let mut stream = sqlx::raw_sql(query).fetch_many(&mut *conn);
        while let Some(item) = stream.try_next().await.map_err(ConnectorError::query)? {
            match item {
                Either::Left(done) => batch.statement_done(done.rows_affected()),
                Either::Right(row) => batch.row(row_to_json(&row)),
            }
        }
        Ok(batch.finish())
    }
}

const COLUMNS_SQL: &str = r#"
SELECT c.TABLE_NAME, c.COLUMN_NAME, c.COLUMN_TYPE, c.IS_NULLABLE, c.COLUMN_KEY,
       k.REFERENCED_TABLE_NAME, k.REFERENCED_COLUMN_NAME
FROM information_schema.COLUMNS c
LEFT JOIN information_schema.KEY_COLUMN_USAGE k
  ON k.TABLE_SCHEMA = c.TABLE_SCHEMA
 AND k.TABLE_NAME = c.TABLE_NAME
 AND k.COLUMN_NAME = c.COLUMN_NAME
 AND k.REFERENCED_TABLE_NAME IS NOT NULL
WHERE c.TABLE_SCHEMA = DATABASE()
ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION
"#;

#[async_trait]
impl SchemaIntrospectable for MySqlConnector {
    async fn fetch_schema(&mut self) -> Result<Value> {
        let conn = self.conn()?;
        let rows: Vec<MySqlRow> = sqlx::raw_sql(COLUMNS_SQL)
            .fetch(&mut *conn)
            .try_collect()
            .await
            .map_err(ConnectorError::query)?;

        let columns: Vec<ColumnInfo> = rows
            .iter()
            .map(|row| {
                let reference = match (text(row, 5), text(row, 6)) {
                    (Some(table), Some(column)) => Some(format!("{}.{}", table, column)),
                    _ => None,
                };
                ColumnInfo {
                    schema: None,
                    table: text(row, 0).unwrap_or_default(),
                    name: text(row, 1).unwrap_or_default(),
                    data_type: text(row, 2).unwrap_or_default(),
                    nullable: text(row, 3).as_deref().and_then(yes_no),
                    primary_key: text(row, 4).as_deref() == Some("PRI"),
                    reference,
                }
            })
            .collect();
        Ok(tables_value(&columns, None))
    }
}

/// Catalog text; some servers report information_schema columns as binary
fn text(row: &MySqlRow, idx: usize) -> Option<String> {
    match row.try_get::<Option<String>, _>(idx) {
        Ok(value) => value,
        Err(_) => row
            .try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
    }
}

pub fn row_to_json(row: &MySqlRow) -> Value {
    let mut object = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), extract_value(row, idx));
    }
    Value::Object(object)
}

fn extract_value(row: &MySqlRow, idx: usize) -> Value {
    match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Err(_) => return Value::Null,
        _ => {}
    }

    let type_name = row.columns()[idx].type_info().name();
    let value = match type_name {
        "BOOLEAN" | "BOOL" => row.try_get::<bool, _>(idx).map(Value::Bool).ok(),
        "TINYINT" => row.try_get::<i8, _>(idx).map(|v| json!(v)).ok(),
        "TINYINT UNSIGNED" => row.try_get::<u8, _>(idx).map(|v| json!(v)).ok(),
        "SMALLINT" | "YEAR" => row.try_get::<i16, _>(idx).map(|v| json!(v)).ok(),
        "SMALLINT UNSIGNED" => row.try_get::<u16, _>(idx).map(|v| json!(v)).ok(),
        "MEDIUMINT" | "INT" | "INTEGER" => row.try_get::<i32, _>(idx).map(|v| json!(v)).ok(),
        "MEDIUMINT UNSIGNED" | "INT UNSIGNED" | "INTEGER UNSIGNED" => {
            row.try_get::<u32, _>(idx).map(|v| json!(v)).ok()
        }
        "BIGINT" => row.try_get::<i64, _>(idx).map(|v| json!(v)).ok(),
        "BIGINT UNSIGNED" => row.try_get::<u64, _>(idx).map(|v| json!(v)).ok(),
        "FLOAT" => row.try_get::<f32, _>(idx).map(|v| json!(v as f64)).ok(),
        "DOUBLE" | "DOUBLE PRECISION" | "REAL" => row.try_get::<f64, _>(idx).map(|v| json!(v)).ok(),
        "DECIMAL" | "NUMERIC" | "DEC" | "FIXED" => {
            row.try_get::<Decimal, _>(idx).map(decimal_to_json).ok()
        }
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT" => row
            .try_get::<Vec<u8>, _>(idx)
            .map(|v| json!(hex::encode(v)))
            .ok(),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(idx)
            .map(|v| json!(v.to_string()))
            .ok(),
        "TIME" => row
            .try_get::<chrono::NaiveTime, _>(idx)
            .map(|v| json!(v.to_string()))
            .ok(),
        "DATETIME" => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .map(|v| json!(v.to_string()))
            .ok(),
        "TIMESTAMP" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .map(|v| json!(v.to_rfc3339()))
            .or_else(|_| {
                row.try_get::<chrono::NaiveDateTime, _>(idx)
                    .map(|v| json!(v.to_string()))
            })
            .ok(),
        "JSON" => row.try_get::<Value, _>(idx).ok(),
        _ => None,
    };

    value.unwrap_or_else(|| fallback(row, idx))
}

/// CHAR/TEXT/ENUM/SET and anything unrecognized
fn fallback(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(s) = row.try_get::<String, _>(idx) {
        return Value::String(s);
    }
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return json!(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return json!(v);
    }
    match row.try_get::<Vec<u8>, _>(idx) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(s) => Value::String(s),
            Err(e) => json!(hex::encode(e.into_bytes())),
        },
        Err(_) => Value::Null,
    }
}

fn decimal_to_json(value: Decimal) -> Value {
    value
        .to_f64()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(value.to_string()))
}
