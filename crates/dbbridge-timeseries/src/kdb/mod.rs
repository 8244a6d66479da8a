//! kdb+ connector over the native IPC protocol
//!
//! q expressions are sent as synchronous messages on a single TCP connection.
//! An optional `script_path` is run once right after the handshake.

pub mod codec;

use async_trait::async_trait;
use codec::{decode_message, encode_login, encode_query, type_name, Header, KObject, MessageType, HEADER_LEN};
use dbbridge_core::{
    BackendType, Connectable, ConnectorContext, ConnectorError, CredentialSpec, FieldSpec,
    Queryable, Result, SchemaIntrospectable,
};
use serde_json::{json, Value};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

const KDB_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::Kdb,
    url: None,
    fields: &[
        FieldSpec::optional("host")
            .aliases(&["hostname"])
            .default_value("localhost"),
        FieldSpec::optional("port").default_value("5000"),
        FieldSpec::optional("username").aliases(&["user"]),
        FieldSpec::optional("password").secret(),
        FieldSpec::optional("script_path").aliases(&["path_to_script"]),
    ],
};

fn io_error(e: std::io::Error) -> ConnectorError {
    ConnectorError::query(format!("kdb+ IPC error: {}", e))
}

struct KdbConnection {
    stream: TcpStream,
}

impl KdbConnection {
    async fn open(host: &str, port: u16, username: Option<&str>, password: Option<&str>) -> Result<Self> {
        let name = BackendType::Kdb.display_name();
        let mut stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ConnectorError::connection(name, e))?;
        stream
            .write_all(&encode_login(username, password))
            .await
            .map_err(|e| ConnectorError::connection(name, e))?;

        // The server answers with one capability byte or closes the socket
        let mut capability = [0u8; 1];
        match stream.read(&mut capability).await {
            Ok(1) => Ok(Self { stream }),
            Ok(_) => Err(ConnectorError::connection(
                name,
                "access denied (handshake rejected)",
            )),
            Err(e) => Err(ConnectorError::connection(name, e)),
        }
    }

    async fn query(&mut self, q: &str) -> Result<KObject> {
        self.stream
            .write_all(&encode_query(MessageType::Sync, q))
            .await
            .map_err(io_error)?;

        loop {
            let mut header = [0u8; HEADER_LEN];
            self.stream.read_exact(&mut header).await.map_err(io_error)?;
            let parsed = Header::parse(&header).map_err(io_error)?;

            let mut message = header.to_vec();
            message.resize(parsed.length, 0);
            self.stream
                .read_exact(&mut message[HEADER_LEN..])
                .await
                .map_err(io_error)?;

            if parsed.msg_type != MessageType::Response {
                debug!("Skipping unsolicited kdb+ message");
                continue;
            }
            return match decode_message(&message).map_err(io_error)? {
                Ok(object) => Ok(object),
                Err(q_error) => Err(ConnectorError::query(format!("q error: '{}", q_error))),
            };
        }
    }
}

/// `meta` output (a keyed table of `c`, `t`, `f`, `a`) as columns
fn meta_columns(meta: &KObject) -> Vec<Value> {
    meta.to_json()
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let name = row["c"].as_str()?;
                    let code = row["t"].as_str().and_then(|t| t.chars().next()).unwrap_or(' ');
                    Some(json!({ "name": name, "type": type_name(code) }))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn is_plain_symbol(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

pub struct KdbConnector {
    ctx: ConnectorContext,
    conn: Option<KdbConnection>,
}

impl KdbConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx, conn: None }
    }

    fn conn(&mut self) -> Result<&mut KdbConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| ConnectorError::connection(BackendType::Kdb.display_name(), "not connected"))
    }
}

#[async_trait]
impl Connectable for KdbConnector {
    fn backend(&self) -> BackendType {
        BackendType::Kdb
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        let params = self.ctx.resolve(&KDB_SPEC)?;
        let host = params.require("host")?;
        let port = params.port("port", 5000)?;
        debug!("Connecting to kdb+ at {}:{}", host, port);

        let mut conn =
            KdbConnection::open(host, port, params.get("username"), params.get("password")).await?;
        conn.query("1+1").await?;

        if let Some(path) = params.get("script_path") {
            if Path::new(path).exists() {
                let script = tokio::fs::read_to_string(path).await.map_err(|e| {
                    ConnectorError::connection(
                        BackendType::Kdb.display_name(),
                        format!("Failed to read script {}: {}", path, e),
                    )
                })?;
                info!("Running kdb+ startup script {}", path);
                conn.query(&script).await?;
            } else {
                warn!("kdb+ script {} not found, skipping", path);
            }
        }

        self.conn = Some(conn);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.stream.shutdown().await {
                warn!("Error closing kdb+ connection: {}", e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Queryable for KdbConnector {
    async fn run_query(&mut self, query: &str) -> Result<Value> {
        let q = query.trim();
        if q.is_empty() {
            return Err(ConnectorError::invalid_request("Query is empty"));
        }
        Ok(self.conn()?.query(q).await?.to_json())
    }
}

#[async_trait]
impl SchemaIntrospectable for KdbConnector {
    /// `{"tables": [{"name", "columns": [{"name", "type"}]}]}`
    async fn fetch_schema(&mut self) -> Result<Value> {
        let conn = self.conn()?;
        let names = conn.query("tables[]").await?.to_json();

        let mut tables = Vec::new();
        for name in names.as_array().into_iter().flatten().filter_map(Value::as_str) {
            if !is_plain_symbol(name) {
                warn!("Skipping kdb+ table with unquotable name {}", name);
                continue;
            }
            let meta = conn.query(&format!("meta `{}", name)).await?;
            tables.push(json!({ "name": name, "columns": meta_columns(&meta) }));
        }
        Ok(json!({ "tables": tables }))
    }
}

#[cfg(test)]
mod tests {
    use super::codec::Atom;
    use super::*;
    use dbbridge_core::{Connector, Credentials, ErrorKind};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    fn response(payload: &[u8]) -> Vec<u8> {
        let mut message = vec![1, 2, 0, 0];
        message.extend_from_slice(&((HEADER_LEN + payload.len()) as i32).to_le_bytes());
        message.extend_from_slice(payload);
        message
    }

    fn long_payload(v: i64) -> Vec<u8> {
        let mut payload = vec![0xf9];
        payload.extend_from_slice(&v.to_le_bytes());
        payload
    }

    /// One-connection q server answering every query with `reply(query)`
    async fn fake_server(
        accept_login: bool,
        reply: fn(&str) -> Vec<u8>,
    ) -> (u16, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            loop {
                if socket.read_u8().await.unwrap() == 0 {
                    break;
                }
            }
            if !accept_login {
                return;
            }
            socket.write_all(&[3]).await.unwrap();

            loop {
                let mut header = [0u8; HEADER_LEN];
                if socket.read_exact(&mut header).await.is_err() {
                    break;
                }
                let parsed = Header::parse(&header).unwrap();
                let mut message = header.to_vec();
                message.resize(parsed.length, 0);
                socket.read_exact(&mut message[HEADER_LEN..]).await.unwrap();

                let query = match decode_message(&message).unwrap().unwrap() {
                    KObject::Chars(q) => q,
                    other => panic!("unexpected request {:?}", other),
                };
                let payload = reply(&query);
                log.lock().unwrap().push(query);
                socket.write_all(&response(&payload)).await.unwrap();
            }
        });
        (port, seen)
    }

    fn connector(port: u16, script: Option<&str>) -> KdbConnector {
        let mut creds = Credentials::new()
            .with("host", "127.0.0.1")
            .with("port", port.to_string())
            .with("username", "trader")
            .with("password", "pw");
        if let Some(script) = script {
            creds.insert("script_path", script);
        }
        KdbConnector::new(ConnectorContext::new(creds))
    }

    #[test]
    fn test_meta_columns() {
        let keys = KObject::Table(
            vec!["c".to_string()],
            vec![KObject::Vector(vec![
                Atom::Symbol("time".to_string()),
                Atom::Symbol("price".to_string()),
            ])],
        );
        let values = KObject::Table(
            vec!["t".to_string(), "f".to_string(), "a".to_string()],
            vec![
                KObject::Chars("pf".to_string()),
                KObject::Vector(vec![Atom::Symbol(String::new()), Atom::Symbol(String::new())]),
                KObject::Vector(vec![Atom::Symbol(String::new()), Atom::Symbol(String::new())]),
            ],
        );
        let meta = KObject::Dict(Box::new(keys), Box::new(values));
        assert_eq!(
            meta_columns(&meta),
            vec![
                json!({"name": "time", "type": "timestamp"}),
                json!({"name": "price", "type": "float"}),
            ]
        );
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let (port, seen) = fake_server(true, |q| match q {
            "1+1" => long_payload(2),
            _ => {
                // 0 1 2j
                let mut payload = vec![7, 0, 3, 0, 0, 0];
                for i in 0..3i64 {
                    payload.extend_from_slice(&i.to_le_bytes());
                }
                payload
            }
        })
        .await;

        let mut kdb = connector(port, None);
        let result = kdb.execute_query("til 3").await;
        assert_eq!(result.data, Some(json!([0, 1, 2])));
        assert_eq!(*seen.lock().unwrap(), vec!["1+1".to_string(), "til 3".to_string()]);
    }

    #[tokio::test]
    async fn test_script_runs_after_connect() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("init.q");
        std::fs::write(&script, "trades:([] px:`float$())").unwrap();

        let (port, seen) = fake_server(true, |_| long_payload(0)).await;
        let mut kdb = connector(port, script.to_str());
        let (ok, message) = kdb.test_connection().await;
        assert!(ok, "{}", message);
        assert_eq!(seen.lock().unwrap()[1], "trades:([] px:`float$())");
    }

    #[tokio::test]
    async fn test_q_error_is_query_error() {
        let (port, _) = fake_server(true, |q| match q {
            "1+1" => long_payload(2),
            _ => b"\x80type\x00".to_vec(),
        })
        .await;

        let mut kdb = connector(port, None);
        let result = kdb.execute_query("`a+1").await;
        assert_eq!(result.kind, Some(ErrorKind::QueryExecution));
        assert!(result.error.unwrap().contains("'type"));
    }

    #[tokio::test]
    async fn test_rejected_login() {
        let (port, _) = fake_server(false, |_| Vec::new()).await;
        let mut kdb = connector(port, None);
        let (ok, message) = kdb.test_connection().await;
        assert!(!ok);
        assert!(message.starts_with("Connection failed: "));
    }
}
