//! IBM Db2 connector over ODBC (needs unixODBC and the Db2 CLI driver)

use crate::blocking::BlockingHandle;
use crate::catalog::{tables_value, yes_no, BatchResult, ColumnInfo};
use async_trait::async_trait;
use dbbridge_core::sql::split_statements;
use dbbridge_core::{
    BackendType, Connectable, ConnectorContext, ConnectorError, CredentialSpec, FieldSpec,
    Queryable, Result, SchemaIntrospectable, UrlSpec,
};
use odbc_api::buffers::TextRowSet;
use odbc_api::{Connection, ConnectionOptions, Cursor, DataType, ResultSetMetadata};
use serde_json::{json, Map, Value};
use tracing::debug;

const DB2_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::Db2,
    url: Some(UrlSpec::complete(&["connection_string"])),
    fields: &[
        FieldSpec::optional("host")
            .aliases(&["hostname"])
            .default_value("localhost"),
        FieldSpec::optional("port").default_value("50000"),
        FieldSpec::required("username").aliases(&["user", "uid"]),
        FieldSpec::required("password").aliases(&["pwd"]).secret(),
        FieldSpec::required("database").aliases(&["database_name", "db_name"]),
        FieldSpec::optional("driver").default_value("IBM DB2 ODBC DRIVER"),
    ],
};

const BATCH_SIZE: usize = 256;
const MAX_TEXT_LEN: usize = 4096;

pub struct Db2Connector {
    ctx: ConnectorContext,
    conn: BlockingHandle<Connection<'static>>,
}

impl Db2Connector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self {
            ctx,
            conn: BlockingHandle::new("IBM Db2"),
        }
    }

    /// ODBC connection string
    pub fn connection_string(&self) -> Result<String> {
        let params = self.ctx.resolve(&DB2_SPEC)?;
        if let Some(url) = params.url() {
            return Ok(url.to_string());
        }
        Ok(format!(
            "DRIVER={{{}}};DATABASE={};HOSTNAME={};PORT={};PROTOCOL=TCPIP;UID={};PWD={};",
            params.get("driver").unwrap_or("IBM DB2 ODBC DRIVER"),
            params.require("database")?,
            params.get("host").unwrap_or("localhost"),
            params.port("port", 50000)?,
            params.require("username")?,
            params.require("password")?,
        ))
    }
}

#[async_trait]
impl Connectable for Db2Connector {
    fn backend(&self) -> BackendType {
        BackendType::Db2
    }

    fn is_connected(&self) -> bool {
        self.conn.is_open()
    }

    async fn open(&mut self) -> Result<()> {
        let connection_string = self.connection_string()?;
        let login_timeout = self.ctx.connect_timeout().as_secs() as u32;
        debug!("Connecting to IBM Db2 over ODBC");

        self.conn
            .open(move || {
                let env = odbc_api::environment()
                    .map_err(|e| ConnectorError::connection("IBM Db2", e))?;
                env.connect_with_connection_string(
                    &connection_string,
                    ConnectionOptions {
                        login_timeout_sec: Some(login_timeout),
                        ..ConnectionOptions::default()
                    },
                )
                .map_err(|e| ConnectorError::connection("IBM Db2", e))
            })
            .await
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the connection disconnects
        self.conn.take();
        Ok(())
    }
}

/// Result of one statement: column names, their ODBC types and text cells
struct TextResult {
    names: Vec<String>,
    types: Vec<DataType>,
    rows: Vec<Vec<Option<String>>>,
}

enum Outcome {
    Rows(TextResult),
    Affected(u64),
}

fn run_statement(conn: &Connection<'static>, sql: &str) -> Result<Outcome> {
    let mut stmt = conn.preallocate().map_err(ConnectorError::query)?;
    let rows = match stmt.execute(sql, ()).map_err(ConnectorError::query)? {
        Some(cursor) => Some(read_cursor(cursor)?),
        None => None,
    };
    match rows {
        Some(rows) => Ok(Outcome::Rows(rows)),
        None => {
            let count = stmt.row_count().map_err(ConnectorError::query)?;
            Ok(Outcome::Affected(count.unwrap_or(0) as u64))
        }
    }
}

fn read_cursor(mut cursor: impl Cursor) -> Result<TextResult> {
    let names = cursor
        .column_names()
        .map_err(ConnectorError::query)?
        .collect::<std::result::Result<Vec<String>, _>>()
        .map_err(ConnectorError::query)?;
    let types = (1..=names.len() as u16)
        .map(|col| cursor.col_data_type(col))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(ConnectorError::query)?;

    let buffer = TextRowSet::for_cursor(BATCH_SIZE, &mut cursor, Some(MAX_TEXT_LEN))
        .map_err(ConnectorError::query)?;
    let mut row_set = cursor.bind_buffer(buffer).map_err(ConnectorError::query)?;

    let mut rows = Vec::new();
    while let Some(batch) = row_set.fetch().map_err(ConnectorError::query)? {
        for row in 0..batch.num_rows() {
            let cells = (0..batch.num_cols())
                .map(|col| {
                    batch
                        .at(col, row)
                        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                })
                .collect();
            rows.push(cells);
        }
    }
    Ok(TextResult { names, types, rows })
}

fn cell_to_json(data_type: &DataType, text: Option<String>) -> Value {
    let Some(text) = text else {
        return Value::Null;
    };
    let trimmed = text.trim();
    let number = match data_type {
        DataType::SmallInt | DataType::Integer | DataType::BigInt | DataType::TinyInt => {
            trimmed.parse::<i64>().ok().map(|v| json!(v))
        }
        DataType::Decimal { .. }
        | DataType::Numeric { .. }
        | DataType::Double
        | DataType::Float { .. }
        | DataType::Real => trimmed
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        _ => None,
    };
    number.unwrap_or(Value::String(text))
}

impl TextResult {
    fn into_json(self) -> Vec<Value> {
        let TextResult { names, types, rows } = self;
        rows.into_iter()
            .map(|cells| {
                let mut object = Map::new();
                for ((name, data_type), cell) in names.iter().zip(&types).zip(cells) {
                    object.insert(name.clone(), cell_to_json(data_type, cell));
                }
                Value::Object(object)
            })
            .collect()
    }
}

#[async_trait]
impl Queryable for Db2Connector {
    /// Statements run one at a time; the first failure stops the script
    async fn run_query(&mut self, query: &str) -> Result<Value> {
        let statements = split_statements(query);
        if statements.is_empty() {
            return Err(ConnectorError::invalid_request("Query is empty"));
        }
        self.conn
            .run(move |conn| {
                let mut batch = BatchResult::new(&statements);
                for statement in &statements {
                    match run_statement(conn, statement)? {
                        Outcome::Rows(result) => {
                            for row in result.into_json() {
                                batch.row(row);
                            }
                            batch.statement_done(0);
                        }
                        Outcome::Affected(count) => batch.statement_done(count),
                    }
                }
                Ok(batch.finish())
            })
            .await
    }
}

const COLUMNS_SQL: &str = r#"
SELECT c.TABNAME, c.COLNAME, c.TYPENAME, c.NULLS,
       CASE WHEN pk.COLNAME IS NULL THEN 0 ELSE 1 END AS IS_PRIMARY,
       fk.REFTABNAME, fk.REFCOLNAME
FROM SYSCAT.COLUMNS c
JOIN SYSCAT.TABLES t
  ON t.TABSCHEMA = c.TABSCHEMA AND t.TABNAME = c.TABNAME AND t.TYPE = 'T'
LEFT JOIN (
    SELECT k.TABSCHEMA, k.TABNAME, k.COLNAME
    FROM SYSCAT.KEYCOLUSE k
    JOIN SYSCAT.TABCONST tc
      ON tc.CONSTNAME = k.CONSTNAME AND tc.TABSCHEMA = k.TABSCHEMA AND tc.TABNAME = k.TABNAME
    WHERE tc.TYPE = 'P'
) pk ON pk.TABSCHEMA = c.TABSCHEMA AND pk.TABNAME = c.TABNAME AND pk.COLNAME = c.COLNAME
LEFT JOIN (
    SELECT k.TABSCHEMA, k.TABNAME, k.COLNAME,
           MIN(r.REFTABNAME) AS REFTABNAME, MIN(rk.COLNAME) AS REFCOLNAME
    FROM SYSCAT.REFERENCES r
    JOIN SYSCAT.KEYCOLUSE k
      ON k.CONSTNAME = r.CONSTNAME AND k.TABSCHEMA = r.TABSCHEMA AND k.TABNAME = r.TABNAME
    JOIN SYSCAT.KEYCOLUSE rk
      ON rk.CONSTNAME = r.REFKEYNAME AND rk.TABSCHEMA = r.REFTABSCHEMA
     AND rk.TABNAME = r.REFTABNAME AND rk.COLSEQ = k.COLSEQ
    GROUP BY k.TABSCHEMA, k.TABNAME, k.COLNAME
) fk ON fk.TABSCHEMA = c.TABSCHEMA AND fk.TABNAME = c.TABNAME AND fk.COLNAME = c.COLNAME
WHERE c.TABSCHEMA = CURRENT SCHEMA
ORDER BY c.TABNAME, c.COLNO
"#;

#[async_trait]
impl SchemaIntrospectable for Db2Connector {
    async fn fetch_schema(&mut self) -> Result<Value> {
        let result = self
            .conn
            .run(|conn| match run_statement(conn, COLUMNS_SQL)? {
                Outcome::Rows(result) => Ok(result),
                Outcome::Affected(_) => Err(ConnectorError::query("catalog query returned no rows")),
            })
            .await?;

        let columns: Vec<ColumnInfo> = result
            .rows
            .into_iter()
            .map(|mut cells| {
                cells.resize(7, None);
                let mut text = |idx: usize| cells[idx].take().map(|s| s.trim().to_string());
                let reference = match (text(5), text(6)) {
                    (Some(table), Some(column)) => Some(format!("{}.{}", table, column)),
                    _ => None,
                };
                ColumnInfo {
                    schema: None,
                    table: text(0).unwrap_or_default(),
                    name: text(1).unwrap_or_default(),
                    data_type: text(2).unwrap_or_default(),
                    nullable: text(3).as_deref().and_then(yes_no),
                    primary_key: text(4).as_deref() == Some("1"),
                    reference,
                }
            })
            .collect();
        Ok(tables_value(&columns, None))
    }
}
