//! SQL Server connector over TDS (tiberius)
//!
//! Azure Synapse Analytics dedicated pools speak the same protocol; the
//! [`SqlServerFlavor::Synapse`] flavor only changes credentials, encryption
//! and the schema layout.

use crate::catalog::{affected_rows, schemas_value, tables_value, yes_no, ColumnInfo};
use async_trait::async_trait;
use dbbridge_core::sql::{is_read_statement, split_statements};
use dbbridge_core::{
    BackendType, Connectable, ConnectorContext, ConnectorError, CredentialSpec, FieldSpec,
    Queryable, Result, SchemaIntrospectable, UrlSpec,
};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, Row, SqlBrowser};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

const SQLSERVER_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::SqlServer,
    url: Some(UrlSpec::complete(&["connection_string"])),
    fields: &[
        FieldSpec::required("host").aliases(&["server_address", "server"]),
        FieldSpec::optional("instance").aliases(&["instance_name"]),
        FieldSpec::optional("port").default_value("1433"),
        FieldSpec::required("username").aliases(&["user"]),
        FieldSpec::required("password").secret(),
        FieldSpec::optional("database").aliases(&["database_name", "db_name"]),
        FieldSpec::optional("trust_server_certificate").default_value("true"),
    ],
};

const SYNAPSE_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::Synapse,
    url: None,
    fields: &[
        FieldSpec::required("server")
            .aliases(&["server_name"])
            .env("SYNAPSE_SERVER"),
        FieldSpec::required("username").env("SYNAPSE_USERNAME"),
        FieldSpec::required("password")
            .env("SYNAPSE_PASSWORD")
            .secret(),
        FieldSpec::required("database")
            .aliases(&["db_name", "database_name"])
            .env("SYNAPSE_DATABASE"),
        FieldSpec::optional("port").default_value("1433"),
    ],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlServerFlavor {
    SqlServer,
    Synapse,
}

impl SqlServerFlavor {
    pub fn backend(self) -> BackendType {
        match self {
            SqlServerFlavor::SqlServer => BackendType::SqlServer,
            SqlServerFlavor::Synapse => BackendType::Synapse,
        }
    }
}

type TdsClient = Client<Compat<TcpStream>>;

pub struct SqlServerConnector {
    ctx: ConnectorContext,
    flavor: SqlServerFlavor,
    client: Option<TdsClient>,
}

impl SqlServerConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self::with_flavor(ctx, SqlServerFlavor::SqlServer)
    }

    pub fn synapse(ctx: ConnectorContext) -> Self {
        Self::with_flavor(ctx, SqlServerFlavor::Synapse)
    }

    pub fn with_flavor(ctx: ConnectorContext, flavor: SqlServerFlavor) -> Self {
        Self {
            ctx,
            flavor,
            client: None,
        }
    }

    fn display_name(&self) -> &'static str {
        self.flavor.backend().display_name()
    }

    fn client(&mut self) -> Result<&mut TdsClient> {
        let name = self.display_name();
        self.client
            .as_mut()
            .ok_or_else(|| ConnectorError::connection(name, "not connected"))
    }

    pub fn build_config(&self) -> Result<Config> {
        match self.flavor {
            SqlServerFlavor::SqlServer => self.sqlserver_config(),
            SqlServerFlavor::Synapse => self.synapse_config(),
        }
    }

    fn sqlserver_config(&self) -> Result<Config> {
        let name = self.display_name();
        let params = self.ctx.resolve(&SQLSERVER_SPEC)?;

        if let Some(ado) = params.url() {
            return Config::from_ado_string(ado).map_err(|e| {
                ConnectorError::connection(name, format!("Invalid connection string: {}", e))
            });
        }

        let mut config = Config::new();
        config.host(params.require("host")?);
        config.port(params.port("port", 1433)?);
        config.authentication(AuthMethod::sql_server(
            params.require("username")?,
            params.require("password")?,
        ));
        if let Some(instance) = params.get("instance") {
            config.instance_name(instance);
        }
        if let Some(database) = params.get("database") {
            config.database(database);
        }
        if params.get("trust_server_certificate").and_then(yes_no) != Some(false) {
            config.trust_cert();
        }
        Ok(config)
    }

    fn synapse_config(&self) -> Result<Config> {
        let params = self.ctx.resolve(&SYNAPSE_SPEC)?;
        let server = params.require("server")?;
        let server = server.strip_prefix("tcp:").unwrap_or(server);

        let mut config = Config::new();
        config.host(server);
        config.port(params.port("port", 1433)?);
        config.database(params.require("database")?);
        config.authentication(AuthMethod::sql_server(
            params.require("username")?,
            params.require("password")?,
        ));
        config.encryption(EncryptionLevel::Required);
        Ok(config)
    }
}

#[async_trait]
impl Connectable for SqlServerConnector {
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
        debug!("Connecting to {} at {}", name, config.get_addr());

        // Named instances resolve their port through the SQL Browser service
        let tcp = TcpStream::connect_named(&config)
            .await
            .map_err(|e| ConnectorError::connection(name, e))?;
        tcp.set_nodelay(true)
            .map_err(|e| ConnectorError::connection(name, e))?;

        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| ConnectorError::connection(name, e))?;
        self.client = Some(client);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client
                .close()
                .await
                .map_err(|e| ConnectorError::connection(self.display_name(), e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Queryable for SqlServerConnector {
    async fn run_query(&mut self, query: &str) -> Result<Value> {
        let statements = split_statements(query);
        if statements.is_empty() {
            return Err(ConnectorError::invalid_request("Query is empty"));
        }

        let client = self.client()?;
        if !statements.iter().any(|s| is_read_statement(s)) {
            let result = client
                .execute(query, &[])
                .await
                .map_err(ConnectorError::query)?;
            return Ok(affected_rows(result.total()));
        }

        // Only reads produce result sets, so the last one is the last read
        let result_sets = client
            .simple_query(query)
            .await
            .map_err(ConnectorError::query)?
            .into_results()
            .await
            .map_err(ConnectorError::query)?;
        let rows = result_sets.last().map(Vec::as_slice).unwrap_or_default();
        Ok(Value::Array(rows.iter().map(row_to_json).collect()))
    }
}

const COLUMNS_SQL: &str = r#"
SELECT c.TABLE_SCHEMA, c.TABLE_NAME, c.COLUMN_NAME, c.DATA_TYPE, c.IS_NULLABLE,
       CAST(CASE WHEN pk.COLUMN_NAME IS NULL THEN 0 ELSE 1 END AS BIT) AS IS_PRIMARY,
       fk.REFERENCED_TABLE, fk.REFERENCED_COLUMN
FROM INFORMATION_SCHEMA.COLUMNS c
JOIN INFORMATION_SCHEMA.TABLES t
  ON t.TABLE_SCHEMA = c.TABLE_SCHEMA
 AND t.TABLE_NAME = c.TABLE_NAME
 AND t.TABLE_TYPE = 'BASE TABLE'
LEFT JOIN (
    SELECT ku.TABLE_SCHEMA, ku.TABLE_NAME, ku.COLUMN_NAME
    FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
    JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE ku
      ON tc.CONSTRAINT_NAME = ku.CONSTRAINT_NAME
     AND tc.TABLE_SCHEMA = ku.TABLE_SCHEMA
    WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
) pk ON pk.TABLE_SCHEMA = c.TABLE_SCHEMA
    AND pk.TABLE_NAME = c.TABLE_NAME
    AND pk.COLUMN_NAME = c.COLUMN_NAME
LEFT JOIN (
    SELECT ku.TABLE_SCHEMA, ku.TABLE_NAME, ku.COLUMN_NAME,
           MIN(ccu.TABLE_NAME) AS REFERENCED_TABLE,
           MIN(ccu.COLUMN_NAME) AS REFERENCED_COLUMN
    FROM INFORMATION_SCHEMA.REFERENTIAL_CONSTRAINTS rc
    JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE ku
      ON rc.CONSTRAINT_NAME = ku.CONSTRAINT_NAME
     AND rc.CONSTRAINT_SCHEMA = ku.CONSTRAINT_SCHEMA
    JOIN INFORMATION_SCHEMA.CONSTRAINT_COLUMN_USAGE ccu
      ON rc.UNIQUE_CONSTRAINT_NAME = ccu.CONSTRAINT_NAME
     AND rc.UNIQUE_CONSTRAINT_SCHEMA = ccu.CONSTRAINT_SCHEMA
    GROUP BY ku.TABLE_SCHEMA, ku.TABLE_NAME, ku.COLUMN_NAME
) fk ON fk.TABLE_SCHEMA = c.TABLE_SCHEMA
    AND fk.TABLE_NAME = c.TABLE_NAME
    AND fk.COLUMN_NAME = c.COLUMN_NAME
WHERE c.TABLE_SCHEMA NOT IN ('sys', 'INFORMATION_SCHEMA')
ORDER BY c.TABLE_SCHEMA, c.TABLE_NAME, c.ORDINAL_POSITION
"#;

// Synapse dedicated pools don't enforce foreign keys
const SYNAPSE_COLUMNS_SQL: &str = r#"
SELECT c.TABLE_SCHEMA, c.TABLE_NAME, c.COLUMN_NAME, c.DATA_TYPE, c.IS_NULLABLE,
       CAST(0 AS BIT) AS IS_PRIMARY,
       CAST(NULL AS NVARCHAR(128)) AS REFERENCED_TABLE,
       CAST(NULL AS NVARCHAR(128)) AS REFERENCED_COLUMN
FROM INFORMATION_SCHEMA.COLUMNS c
JOIN INFORMATION_SCHEMA.TABLES t
  ON t.TABLE_SCHEMA = c.TABLE_SCHEMA
 AND t.TABLE_NAME = c.TABLE_NAME
 AND t.TABLE_TYPE = 'BASE TABLE'
WHERE c.TABLE_SCHEMA NOT IN ('sys', 'INFORMATION_SCHEMA')
ORDER BY c.TABLE_SCHEMA, c.TABLE_NAME, c.ORDINAL_POSITION
"#;

#[async_trait]
impl SchemaIntrospectable for SqlServerConnector {
    async fn fetch_schema(&mut self) -> Result<Value> {
        let flavor = self.flavor;
        let sql = match flavor {
            SqlServerFlavor::SqlServer => COLUMNS_SQL,
            SqlServerFlavor::Synapse => SYNAPSE_COLUMNS_SQL,
        };

        let rows = self
            .client()?
            .simple_query(sql)
            .await
            .map_err(ConnectorError::query)?
            .into_first_result()
            .await
            .map_err(ConnectorError::query)?;

        let columns: Vec<ColumnInfo> = rows
            .iter()
            .map(|row| {
                let text = |idx: usize| -> Option<String> {
                    row.try_get::<&str, _>(idx).ok().flatten().map(String::from)
                };
                let reference = match (text(6), text(7)) {
                    (Some(table), Some(column)) => Some(format!("{}.{}", table, column)),
                    _ => None,
                };
                ColumnInfo {
                    schema: text(0),
                    table: text(1).unwrap_or_default(),
                    name: text(2).unwrap_or_default(),
                    data_type: text(3).unwrap_or_default(),
                    nullable: text(4).as_deref().and_then(yes_no),
                    primary_key: row.try_get::<bool, _>(5).ok().flatten().unwrap_or(false),
                    reference,
                }
            })
            .collect();

        Ok(match flavor {
            SqlServerFlavor::SqlServer => tables_value(&columns, Some("dbo")),
            SqlServerFlavor::Synapse => schemas_value(&columns),
        })
    }
}

pub fn row_to_json(row: &Row) -> Value {
    let mut object = Map::new();
    for (idx, (column, data)) in row.cells().enumerate() {
        object.insert(column.name().to_string(), cell_to_json(row, idx, data));
    }
    Value::Object(object)
}

fn cell_to_json(row: &Row, idx: usize, data: &ColumnData<'static>) -> Value {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| json!(v)),
        ColumnData::I16(v) => v.map(|v| json!(v)),
        ColumnData::I32(v) => v.map(|v| json!(v)),
        ColumnData::I64(v) => v.map(|v| json!(v)),
        ColumnData::F32(v) => v.map(|v| json!(v as f64)),
        ColumnData::F64(v) => v.map(|v| json!(v)),
        ColumnData::Bit(v) => v.map(Value::Bool),
        ColumnData::String(v) => v.as_ref().map(|s| Value::String(s.to_string())),
        ColumnData::Guid(v) => v.map(|g| json!(g.to_string())),
        ColumnData::Binary(v) => v.as_ref().map(|b| json!(hex::encode(b))),
        ColumnData::Numeric(v) => v.map(|n| {
            let value = n.value() as f64 / 10f64.powi(n.scale() as i32);
            serde_json::Number::from_f64(value)
                .map(Value::Number)
                .unwrap_or_else(|| json!(n.to_string()))
        }),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|xml| json!(xml.clone().into_owned().into_string())),
        ColumnData::Date(_) => row
            .try_get::<chrono::NaiveDate, _>(idx)
            .ok()
            .flatten()
            .map(|d| json!(d.to_string())),
        ColumnData::Time(_) => row
            .try_get::<chrono::NaiveTime, _>(idx)
            .ok()
            .flatten()
            .map(|t| json!(t.to_string())),
        ColumnData::DateTimeOffset(_) => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .ok()
            .flatten()
            .map(|t| json!(t.to_rfc3339())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .ok()
            .flatten()
            .map(|t| json!(t.to_string())),
    };
    value.unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbbridge_core::{Credentials, EnvSource, ErrorKind};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn connector(flavor: SqlServerFlavor, credentials: Credentials, env: &[(&str, &str)]) -> SqlServerConnector {
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let env: Arc<dyn EnvSource> = Arc::new(env);
        SqlServerConnector::with_flavor(ConnectorContext::with_env(credentials, env), flavor)
    }

    #[test]
    fn test_fields_build_address() {
        let creds = Credentials::new()
            .with("server_address", "mssql.internal")
            .with("port", 14330)
            .with("username", "sa")
            .with("password", "Passw0rd!")
            .with("database_name", "sales");
        let config = connector(SqlServerFlavor::SqlServer, creds, &[])
            .build_config()
            .unwrap();
        assert_eq!(config.get_addr(), "mssql.internal:14330");
    }

    #[test]
    fn test_ado_connection_string_wins() {
        let creds = Credentials::new()
            .with(
                "connection_string",
                "server=tcp:ado.example.com,1444;user=sa;password=x;database=db;TrustServerCertificate=true",
            )
            .with("host", "ignored");
        let config = connector(SqlServerFlavor::SqlServer, creds, &[])
            .build_config()
            .unwrap();
        assert_eq!(config.get_addr(), "ado.example.com:1444");
    }

    #[test]
    fn test_missing_sqlserver_fields() {
        let err = connector(SqlServerFlavor::SqlServer, Credentials::new(), &[])
            .build_config()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingCredential);
        let message = err.to_string();
        assert!(message.contains("host"));
        assert!(message.contains("username"));
        assert!(message.contains("password"));
    }

    #[test]
    fn test_synapse_reads_environment() {
        let config = connector(
            SqlServerFlavor::Synapse,
            Credentials::new(),
            &[
                ("SYNAPSE_SERVER", "tcp:ws.sql.azuresynapse.net"),
                ("SYNAPSE_USERNAME", "admin"),
                ("SYNAPSE_PASSWORD", "secret"),
                ("SYNAPSE_DATABASE", "pool"),
            ],
        )
        .build_config()
        .unwrap();
        assert_eq!(config.get_addr(), "ws.sql.azuresynapse.net:1433");

        let err = connector(SqlServerFlavor::Synapse, Credentials::new(), &[])
            .build_config()
            .unwrap_err();
        assert!(err.to_string().starts_with("Missing required credentials for Azure Synapse Analytics"));
    }
}
