//! PostgreSQL connector
//!
//! Also serves the wire-compatible products: Redshift, Heroku Postgres, Neon,
//! Crunchy Bridge and TimescaleDB (whose schema lives in the time-series crate).

use crate::catalog::{affected_rows, tables_value, yes_no, BatchResult, ColumnInfo};
use crate::tls;
use async_trait::async_trait;
use dbbridge_core::sql::{is_read_statement, split_statements};
use dbbridge_core::{
    BackendType, Connectable, ConnectorContext, ConnectorError, CredentialSpec, FieldSpec,
    Queryable, Result, SchemaIntrospectable, UrlSpec,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, Config, NoTls, Row};
use tracing::{debug, error};

const URL_KEYS: &[&str] = &["connection_string", "database_url"];

const POSTGRES_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::PostgreSql,
    url: Some(UrlSpec::complete(URL_KEYS).env("DATABASE_URL")),
    fields: &[
        FieldSpec::optional("host")
            .aliases(&["hostname"])
            .env("PGHOST")
            .default_value("localhost"),
        FieldSpec::optional("port").env("PGPORT").default_value("5432"),
        FieldSpec::optional("username").aliases(&["user"]).env("PGUSER"),
        FieldSpec::optional("password").env("PGPASSWORD").secret(),
        FieldSpec::required("database")
            .aliases(&["database_name", "db_name", "dbname"])
            .env("PGDATABASE"),
        FieldSpec::optional("sslmode").aliases(&["ssl_mode"]),
    ],
};

const REDSHIFT_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::Redshift,
    url: Some(UrlSpec::complete(&["connection_string"])),
    fields: &[
        FieldSpec::optional("cluster_id").aliases(&["cluster_identifier"]),
        FieldSpec::optional("region")
            .aliases(&["aws_region"])
            .env("AWS_REGION")
            .default_value("us-east-1"),
        FieldSpec::optional("host").aliases(&["cluster_address", "hostname"]),
        FieldSpec::optional("port").default_value("5439"),
        FieldSpec::required("username").aliases(&["user"]),
        FieldSpec::required("password").secret(),
        FieldSpec::required("database").aliases(&["database_name", "db_name"]),
        FieldSpec::optional("sslmode").aliases(&["ssl_mode"]),
    ],
};

const HEROKU_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::Heroku,
    url: Some(UrlSpec::complete(URL_KEYS).env("DATABASE_URL")),
    fields: &[],
};

const NEON_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::Neon,
    url: Some(UrlSpec::complete(&["connection_string", "db_url"])),
    fields: &[
        FieldSpec::required("host").aliases(&["hostname"]),
        FieldSpec::optional("port").default_value("5432"),
        FieldSpec::required("username").aliases(&["user"]),
        FieldSpec::required("password").secret(),
        FieldSpec::required("database").aliases(&["database_name", "db_name"]),
    ],
};

const CRUNCHY_BRIDGE_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::CrunchyBridge,
    url: Some(UrlSpec::complete(&["connection_string"])),
    fields: &[],
};

const TIMESCALE_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::TimescaleDb,
    url: Some(UrlSpec::complete(&["connection_string"])),
    fields: &[
        FieldSpec::optional("host")
            .aliases(&["hostname"])
            .default_value("localhost"),
        FieldSpec::optional("port").default_value("5432"),
        FieldSpec::optional("username").aliases(&["user"]),
        FieldSpec::optional("password").secret(),
        FieldSpec::required("database").aliases(&["database_name", "db_name"]),
        FieldSpec::optional("sslmode").aliases(&["ssl_mode"]),
    ],
};

/// Postgres-compatible product served by [`PostgresConnector`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostgresFlavor {
    PostgreSql,
    Redshift,
    Heroku,
    Neon,
    CrunchyBridge,
    TimescaleDb,
}

impl PostgresFlavor {
    pub fn backend(self) -> BackendType {
        match self {
            PostgresFlavor::PostgreSql => BackendType::PostgreSql,
            PostgresFlavor::Redshift => BackendType::Redshift,
            PostgresFlavor::Heroku => BackendType::Heroku,
            PostgresFlavor::Neon => BackendType::Neon,
            PostgresFlavor::CrunchyBridge => BackendType::CrunchyBridge,
            PostgresFlavor::TimescaleDb => BackendType::TimescaleDb,
        }
    }

    pub fn credential_spec(self) -> &'static CredentialSpec {
        match self {
            PostgresFlavor::PostgreSql => &POSTGRES_SPEC,
            PostgresFlavor::Redshift => &REDSHIFT_SPEC,
            PostgresFlavor::Heroku => &HEROKU_SPEC,
            PostgresFlavor::Neon => &NEON_SPEC,
            PostgresFlavor::CrunchyBridge => &CRUNCHY_BRIDGE_SPEC,
            PostgresFlavor::TimescaleDb => &TIMESCALE_SPEC,
        }
    }

    /// Managed hosts that refuse unencrypted connections
    fn requires_tls(self) -> bool {
        matches!(
            self,
            PostgresFlavor::Heroku | PostgresFlavor::Neon | PostgresFlavor::CrunchyBridge
        )
    }

    fn url_only(self) -> bool {
        matches!(self, PostgresFlavor::Heroku | PostgresFlavor::CrunchyBridge)
    }

    fn default_port(self) -> u16 {
        match self {
            PostgresFlavor::Redshift => 5439,
            _ => 5432,
        }
    }
}

/// PostgreSQL-protocol connector
pub struct PostgresConnector {
    ctx: ConnectorContext,
    flavor: PostgresFlavor,
    client: Option<Client>,
    connection: Option<JoinHandle<()>>,
}

impl PostgresConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self::with_flavor(ctx, PostgresFlavor::PostgreSql)
    }

    pub fn with_flavor(ctx: ConnectorContext, flavor: PostgresFlavor) -> Self {
        Self {
            ctx,
            flavor,
            client: None,
            connection: None,
        }
    }

    pub fn flavor(&self) -> PostgresFlavor {
        self.flavor
    }

    /// Live client; errors when the connector isn't connected
    pub fn client(&self) -> Result<&Client> {
        self.client.as_ref().ok_or_else(|| {
            ConnectorError::connection(self.display_name(), "not connected")
        })
    }

    fn display_name(&self) -> &'static str {
        self.flavor.backend().display_name()
    }

    /// Driver configuration from the resolved credentials
    pub fn build_config(&self) -> Result<Config> {
        let name = self.display_name();
        let params = self.ctx.resolve(self.flavor.credential_spec())?;

        let mut config = match params.url() {
            Some(url) => url.parse::<Config>().map_err(|e| {
                ConnectorError::connection(name, format!("Invalid connection string: {}", e))
            })?,
            None if self.flavor.url_only() => {
                return Err(ConnectorError::missing_credential(
                    name,
                    vec!["connection_string".to_string()],
                ))
            }
            None => {
                let host = match (params.get("host"), params.get("cluster_id")) {
                    (Some(host), _) => host.to_string(),
                    (None, Some(cluster_id)) => format!(
                        "{}.{}.redshift.amazonaws.com",
                        cluster_id,
                        params.get("region").unwrap_or("us-east-1")
                    ),
                    (None, None) => {
                        return Err(ConnectorError::missing_credential(
                            name,
                            vec!["host".to_string()],
                        ))
                    }
                };

                let mut config = Config::new();
                config
                    .host(&host)
                    .port(params.port("port", self.flavor.default_port())?)
                    .dbname(params.require("database")?);
                if let Some(user) = params.get("username") {
                    config.user(user);
                }
                if let Some(password) = params.get("password") {
                    config.password(password);
                }
                if let Some(mode) = params.get("sslmode") {
                    config.ssl_mode(parse_ssl_mode(name, mode)?);
                }
                config
            }
        };

        config
            .connect_timeout(self.ctx.connect_timeout())
            .application_name("dbbridge");
        if self.flavor.requires_tls() {
            config.ssl_mode(SslMode::Require);
        }
        Ok(config)
    }
}

fn parse_ssl_mode(backend: &str, mode: &str) -> Result<SslMode> {
    match mode.to_ascii_lowercase().as_str() {
        "disable" => Ok(SslMode::Disable),
        "prefer" | "allow" => Ok(SslMode::Prefer),
        "require" | "verify-ca" | "verify-full" => Ok(SslMode::Require),
        other => Err(ConnectorError::invalid_request(format!(
            "Invalid sslmode '{}' for {}",
            other, backend
        ))),
    }
}

#[async_trait]
impl Connectable for PostgresConnector {
    fn backend(&self) -> BackendType {
        self.flavor.backend()
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn connect_timeout(&self) -> Duration {
        self.ctx.connect_timeout()
    }

    async fn open(&mut self) -> Result<()> {
        let name = self.display_name();
        let config = self.build_config()?;
        debug!(
            "Connecting to {}: {:?}@{:?}/{:?}",
            name,
            config.get_user(),
            config.get_hosts(),
            config.get_dbname()
        );

        let (client, connection) = if matches!(config.get_ssl_mode(), SslMode::Require) {
            let tls = tls::require_tls_connector()
                .map_err(|e| ConnectorError::connection(name, e))?;
            let (client, connection) = config
                .connect(tls)
                .await
                .map_err(|e| ConnectorError::connection(name, pg_error(&e)))?;
            (client, spawn_connection(name, connection))
        } else {
            let (client, connection) = config
                .connect(NoTls)
                .await
                .map_err(|e| ConnectorError::connection(name, pg_error(&e)))?;
            (client, spawn_connection(name, connection))
        };

        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| ConnectorError::connection(name, pg_error(&e)))?;

        self.client = Some(client);
        self.connection = Some(connection);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the client terminates the connection task
        self.client.take();
        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
        Ok(())
    }
}

fn spawn_connection<F, E>(name: &'static str, connection: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: std::fmt::Display,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("{} connection error: {}", name, e);
        }
    })
}

#[async_trait]
impl Queryable for PostgresConnector {
    async fn run_query(&mut self, query: &str) -> Result<Value> {
        run_sql(self.client()?, query).await
    }
}

#[async_trait]
impl SchemaIntrospectable for PostgresConnector {
    async fn fetch_schema(&mut self) -> Result<Value> {
        let client = self.client()?;
        let columns = if self.flavor == PostgresFlavor::Redshift {
            catalog_columns(client, REDSHIFT_COLUMNS_SQL).await?
        } else {
            catalog_columns(client, COLUMNS_SQL).await?
        };
        Ok(tables_value(&columns, Some("public")))
    }
}

const COLUMNS_SQL: &str = r#"
SELECT c.table_schema::text,
       c.table_name::text,
       c.column_name::text,
       c.data_type::text,
       c.is_nullable::text,
       (pk.column_name IS NOT NULL) AS is_primary,
       fk.foreign_table::text,
       fk.foreign_column::text
FROM information_schema.columns c
JOIN information_schema.tables t
  ON t.table_schema = c.table_schema
 AND t.table_name = c.table_name
 AND t.table_type = 'BASE TABLE'
LEFT JOIN (
    SELECT kcu.table_schema, kcu.table_name, kcu.column_name
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
      ON tc.constraint_name = kcu.constraint_name
     AND tc.table_schema = kcu.table_schema
    WHERE tc.constraint_type = 'PRIMARY KEY'
) pk ON pk.table_schema = c.table_schema
    AND pk.table_name = c.table_name
    AND pk.column_name = c.column_name
LEFT JOIN (
    SELECT DISTINCT ON (kcu.table_schema, kcu.table_name, kcu.column_name)
           kcu.table_schema, kcu.table_name, kcu.column_name,
           ccu.table_name AS foreign_table,
           ccu.column_name AS foreign_column
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
      ON tc.constraint_name = kcu.constraint_name
     AND tc.table_schema = kcu.table_schema
    JOIN information_schema.constraint_column_usage ccu
      ON ccu.constraint_name = tc.constraint_name
     AND ccu.table_schema = tc.table_schema
    WHERE tc.constraint_type = 'FOREIGN KEY'
) fk ON fk.table_schema = c.table_schema
    AND fk.table_name = c.table_name
    AND fk.column_name = c.column_name
WHERE c.table_schema NOT IN ('pg_catalog', 'information_schema')
ORDER BY c.table_schema, c.table_name, c.ordinal_position
"#;

const REDSHIFT_COLUMNS_SQL: &str = r#"
SELECT table_schema::text,
       table_name::text,
       column_name::text,
       data_type::text,
       is_nullable::text,
       false AS is_primary,
       NULL::text AS foreign_table,
       NULL::text AS foreign_column
FROM information_schema.columns
WHERE table_schema NOT IN ('pg_catalog', 'information_schema', 'pg_internal')
ORDER BY table_schema, table_name, ordinal_position
"#;

/// Run a catalog query returning the eight columns of [`COLUMNS_SQL`]
pub async fn catalog_columns(client: &Client, sql: &str) -> Result<Vec<ColumnInfo>> {
    let rows = client
        .query(sql, &[])
        .await
        .map_err(|e| ConnectorError::query(pg_error(&e)))?;

    rows.iter()
        .map(|row| {
            let text = |idx: usize| -> Result<Option<String>> {
                row.try_get::<_, Option<String>>(idx)
                    .map_err(|e| ConnectorError::query(pg_error(&e)))
            };
            let foreign_table = text(6)?;
            let foreign_column = text(7)?;
            Ok(ColumnInfo {
                schema: text(0)?,
                table: text(1)?.unwrap_or_default(),
                name: text(2)?.unwrap_or_default(),
                data_type: text(3)?.unwrap_or_default(),
                nullable: text(4)?.as_deref().and_then(yes_no),
                primary_key: row.try_get::<_, Option<bool>>(5).ok().flatten().unwrap_or(false),
                reference: match (foreign_table, foreign_column) {
                    (Some(table), Some(column)) => Some(format!("{}.{}", table, column)),
                    (Some(table), None) => Some(table),
                    _ => None,
                },
            })
        })
        .collect()
}

/// Execute SQL: rows for reads, `affected_rows` for writes
///
/// Multi-statement input runs statement by statement, stopping at the first
/// failure, and yields the last statement that returned rows or the total
/// affected count.
pub async fn run_sql(client: &Client, sql: &str) -> Result<Value> {
    let statements = split_statements(sql);
    match statements.len() {
        0 => Err(ConnectorError::invalid_request("Query is empty")),
        1 if is_read_statement(&statements[0]) => {
            let rows = client
                .query(statements[0].as_str(), &[])
                .await
                .map_err(|e| ConnectorError::query(pg_error(&e)))?;
            Ok(Value::Array(rows.iter().map(row_to_json).collect()))
        }
        1 => {
            let count = client
                .execute(statements[0].as_str(), &[])
                .await
                .map_err(|e| ConnectorError::query(pg_error(&e)))?;
            Ok(affected_rows(count))
        }
        _ => statement_batch(client, &statements).await,
    }
}

/// Statements run one at a time so batch reads keep their column types
async fn statement_batch(client: &Client, statements: &[String]) -> Result<Value> {
    let mut batch = BatchResult::new(statements);
    for statement in statements {
        if is_read_statement(statement) {
            let rows = client
                .query(statement.as_str(), &[])
                .await
                .map_err(|e| ConnectorError::query(pg_error(&e)))?;
            for row in &rows {
                batch.row(row_to_json(row));
            }
            batch.statement_done(0);
        } else {
            let count = client
                .execute(statement.as_str(), &[])
                .await
                .map_err(|e| ConnectorError::query(pg_error(&e)))?;
            batch.statement_done(count);
        }
    }
    Ok(batch.finish())
}

/// Driver error text, preferring the server's own message
pub fn pg_error(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => match db.detail() {
            Some(detail) => format!("{}: {} ({})", db.severity(), db.message(), detail),
            None => format!("{}: {}", db.severity(), db.message()),
        },
        None => match std::error::Error::source(e) {
            Some(source) => format!("{}: {}", e, source),
            None => e.to_string(),
        },
    }
}

pub fn row_to_json(row: &Row) -> Value {
    let mut object = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), extract_value(row, idx));
    }
    Value::Object(object)
}

fn get<'a, T>(row: &'a Row, idx: usize) -> Option<T>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

fn extract_value(row: &Row, idx: usize) -> Value {
    let type_name = row.columns()[idx].type_().name();

    let value = match type_name {
        "bool" => get::<bool>(row, idx).map(Value::Bool),
        "int2" => get::<i16>(row, idx).map(|v| json!(v)),
        "int4" => get::<i32>(row, idx).map(|v| json!(v)),
        "int8" => get::<i64>(row, idx).map(|v| json!(v)),
        "oid" => get::<u32>(row, idx).map(|v| json!(v)),
        "float4" => get::<f32>(row, idx).map(|v| json!(v as f64)),
        "float8" => get::<f64>(row, idx).map(|v| json!(v)),
        "numeric" => get::<Decimal>(row, idx).map(decimal_to_json),
        "timestamp" => get::<chrono::NaiveDateTime>(row, idx).map(|v| json!(v.to_string())),
        "timestamptz" => get::<chrono::DateTime<chrono::Utc>>(row, idx).map(|v| json!(v.to_rfc3339())),
        "date" => get::<chrono::NaiveDate>(row, idx).map(|v| json!(v.to_string())),
        "time" => get::<chrono::NaiveTime>(row, idx).map(|v| json!(v.to_string())),
        "json" | "jsonb" => get::<Value>(row, idx),
        "uuid" => get::<uuid::Uuid>(row, idx).map(|v| json!(v.to_string())),
        "bytea" => get::<Vec<u8>>(row, idx).map(|v| json!(hex::encode(v))),
        "_text" | "_varchar" | "_bpchar" | "_name" => {
            get::<Vec<Option<String>>>(row, idx).map(|v| json!(v))
        }
        "_int4" => get::<Vec<Option<i32>>>(row, idx).map(|v| json!(v)),
        "_int8" => get::<Vec<Option<i64>>>(row, idx).map(|v| json!(v)),
        "_float8" => get::<Vec<Option<f64>>>(row, idx).map(|v| json!(v)),
        "_bool" => get::<Vec<Option<bool>>>(row, idx).map(|v| json!(v)),
        // Text-compatible types (varchar, text, bpchar, name, citext, ...)
        _ => get::<String>(row, idx).map(Value::String),
    };

    value.unwrap_or(Value::Null)
}

fn decimal_to_json(value: Decimal) -> Value {
    value
        .to_f64()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(value.to_string()))
}
