//! SQLite connector
//!
//! rusqlite is blocking, so the connection moves into `spawn_blocking` for
//! every call and comes back with the result.

use crate::blocking::BlockingHandle;
use crate::catalog::{affected_rows, tables_value, ColumnInfo};
use async_trait::async_trait;
use dbbridge_core::sql::{is_read_statement, split_statements};
use dbbridge_core::{
    BackendType, Connectable, ConnectorContext, ConnectorError, CredentialSpec, FieldSpec,
    Queryable, Result, SchemaIntrospectable,
};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tracing::debug;

const SQLITE_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::Sqlite,
    url: None,
    fields: &[FieldSpec::required("path").aliases(&[
        "path_to_database_file",
        "file_path",
        "database",
    ])],
};

pub struct SqliteConnector {
    ctx: ConnectorContext,
    conn: BlockingHandle<Connection>,
}

impl SqliteConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self {
            ctx,
            conn: BlockingHandle::new("SQLite"),
        }
    }

    /// Database file path, accepting `sqlite://path` and `sqlite:path`
    fn database_path(&self) -> Result<String> {
        let params = self.ctx.resolve(&SQLITE_SPEC)?;
        let path = params.require("path")?;
        let path = path
            .strip_prefix("sqlite://")
            .or_else(|| path.strip_prefix("sqlite:"))
            .unwrap_or(path);
        Ok(path.to_string())
    }
}

#[async_trait]
impl Connectable for SqliteConnector {
    fn backend(&self) -> BackendType {
        BackendType::Sqlite
    }

    fn is_connected(&self) -> bool {
        self.conn.is_open()
    }

    async fn open(&mut self) -> Result<()> {
        let path = self.database_path()?;
        debug!("Opening SQLite database {}", path);

        self.conn
            .open(move || {
                let conn = Connection::open(&path)
                    .map_err(|e| ConnectorError::connection("SQLite", e))?;
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .map_err(|e| ConnectorError::connection("SQLite", e))?;
                Ok(conn)
            })
            .await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close()
                .map_err(|(_, e)| ConnectorError::connection("SQLite", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Queryable for SqliteConnector {
    async fn run_query(&mut self, query: &str) -> Result<Value> {
        let mut statements = split_statements(query);
        let statement = match statements.len() {
            0 => return Err(ConnectorError::invalid_request("Query is empty")),
            1 => statements.remove(0),
            n => {
                return Err(ConnectorError::invalid_request(format!(
                    "SQLite executes one statement per call; received {} statements",
                    n
                )))
            }
        };

        self.conn.run(move |conn| execute(conn, &statement)).await
    }
}

fn execute(conn: &Connection, sql: &str) -> Result<Value> {
    let mut stmt = conn.prepare(sql).map_err(ConnectorError::query)?;

    if stmt.column_count() == 0 && !is_read_statement(sql) {
        let count = stmt.execute([]).map_err(ConnectorError::query)?;
        return Ok(affected_rows(count as u64));
    }

    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query([]).map_err(ConnectorError::query)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(ConnectorError::query)? {
        let mut object = Map::new();
        for (idx, name) in names.iter().enumerate() {
            let value = row.get_ref(idx).map_err(ConnectorError::query)?;
            object.insert(name.clone(), to_json(value));
        }
        out.push(Value::Object(object));
    }
    Ok(Value::Array(out))
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => json!(hex::encode(bytes)),
    }
}

#[async_trait]
impl SchemaIntrospectable for SqliteConnector {
    async fn fetch_schema(&mut self) -> Result<Value> {
        let columns = self.conn.run(|conn| catalog_columns(conn)).await?;
        Ok(tables_value(&columns, None))
    }
}

fn catalog_columns(conn: &Connection) -> Result<Vec<ColumnInfo>> {
    let mut tables = conn
        .prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .map_err(ConnectorError::query)?;
    let names = tables
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(ConnectorError::query)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(ConnectorError::query)?;

    let mut columns = Vec::new();
    for table in names {
        let quoted = table.replace('"', "\"\"");

        let mut fk_stmt = conn
            .prepare(&format!("PRAGMA foreign_key_list(\"{}\")", quoted))
            .map_err(ConnectorError::query)?;
        let foreign_keys = fk_stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .map_err(ConnectorError::query)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(ConnectorError::query)?;

        let mut info_stmt = conn
            .prepare(&format!("PRAGMA table_info(\"{}\")", quoted))
            .map_err(ConnectorError::query)?;
        let table_columns = info_stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .map_err(ConnectorError::query)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(ConnectorError::query)?;

        for (name, data_type, not_null, pk) in table_columns {
            let reference = foreign_keys
                .iter()
                .find(|(from, _, _)| *from == name)
                .map(|(_, target, to)| match to {
                    Some(to) => format!("{}.{}", target, to),
                    None => target.clone(),
                });
            columns.push(ColumnInfo {
                schema: None,
                table: table.clone(),
                nullable: Some(not_null == 0 && pk == 0),
                primary_key: pk > 0,
                name,
                data_type,
                reference,
            });
        }
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbbridge_core::{normalize, Connector, Credentials, ErrorKind};
    use tempfile::TempDir;

    fn connector(dir: &TempDir) -> SqliteConnector {
        let path = dir.path().join("test.db");
        let creds = Credentials::new().with("path", path.to_string_lossy().to_string());
        SqliteConnector::new(ConnectorContext::new(creds))
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let mut db = connector(&dir);

        let created = db
            .execute_query("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, score REAL, data BLOB)")
            .await;
        assert!(created.success, "{:?}", created.error);

        let inserted = db
            .execute_query("INSERT INTO t (name, score, data) VALUES ('a;b', 1.5, x'0aff')")
            .await;
        assert_eq!(inserted.data, Some(json!({ "affected_rows": 1 })));

        let rows = db.execute_query("SELECT id, name, score, data FROM t").await;
        assert_eq!(
            rows.data,
            Some(json!([{ "id": 1, "name": "a;b", "score": 1.5, "data": "0aff" }]))
        );
        assert!(!db.is_connected());
    }

    #[tokio::test]
    async fn test_multi_statement_rejected() {
        let dir = TempDir::new().unwrap();
        let mut db = connector(&dir);
        let result = db
            .execute_query("CREATE TABLE a (id INT); CREATE TABLE b (id INT);")
            .await;
        assert!(!result.success);
        assert_eq!(result.kind, Some(ErrorKind::InvalidOperationRequest));
        assert_eq!(
            result.error.as_deref(),
            Some("SQLite executes one statement per call; received 2 statements")
        );
    }

    #[tokio::test]
    async fn test_query_error_keeps_driver_message() {
        let dir = TempDir::new().unwrap();
        let mut db = connector(&dir);
        let result = db.execute_query("SELECT * FROM missing").await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.starts_with("Error executing query:"));
        assert!(error.contains("no such table"));
    }

    #[tokio::test]
    async fn test_schema_with_foreign_keys() {
        let dir = TempDir::new().unwrap();
        let mut db = connector(&dir);
        db.execute_query("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL)")
            .await;
        db.execute_query(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id))",
        )
        .await;

        let schema = db.get_schema().await;
        let tree = normalize("sqlite", &schema);
        let orders = tree.entity("orders").unwrap();
        let user_id = orders.fields.iter().find(|f| f.name == "user_id").unwrap();
        assert!(user_id.foreign_key);
        assert_eq!(user_id.reference.as_deref(), Some("users.id"));

        let users = tree.entity("users").unwrap();
        assert!(users.fields[0].primary_key);
        assert_eq!(users.fields[1].nullable, Some(false));
    }

    #[tokio::test]
    async fn test_missing_path() {
        let mut db = SqliteConnector::new(ConnectorContext::new(Credentials::new()));
        let (ok, message) = db.test_connection().await;
        assert!(!ok);
        assert!(message.contains("path"));
    }

    #[tokio::test]
    async fn test_url_style_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("url.db");
        let creds = Credentials::new().with("database", format!("sqlite://{}", path.display()));
        let mut db = SqliteConnector::new(ConnectorContext::new(creds));
        assert!(db.test_connection().await.0);
        assert!(path.exists());
    }
}
