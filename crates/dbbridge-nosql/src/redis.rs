//! Redis connector
//!
//! Queries name one command and its arguments:
//! `{"command": "HGETALL", "args": ["user:1"]}`. The reply is returned as
//! `{"result": ...}`.

use async_trait::async_trait;
use dbbridge_core::{
    BackendType, Connectable, ConnectorContext, ConnectorError, CredentialSpec, FieldSpec,
    Queryable, Result, SchemaIntrospectable, UrlSpec,
};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error};

const REDIS_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::Redis,
    url: Some(UrlSpec::complete(&["connection_string", "url"]).env("REDIS_URL")),
    fields: &[
        FieldSpec::optional("host")
            .aliases(&["hostname"])
            .env("REDIS_HOST")
            .default_value("localhost"),
        FieldSpec::optional("port").default_value("6379"),
        FieldSpec::optional("username").aliases(&["user"]),
        FieldSpec::optional("password").secret(),
        FieldSpec::optional("db").aliases(&["database"]).default_value("0"),
    ],
};

#[derive(Debug, Deserialize)]
struct RedisCommand {
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: Vec<Value>,
}

impl RedisCommand {
    fn parse(query: &str) -> Result<Self> {
        let command: RedisCommand = serde_json::from_str(query)
            .map_err(|_| ConnectorError::invalid_request("Invalid JSON query format"))?;
        if command.command.trim().is_empty() {
            return Err(ConnectorError::invalid_request("Query must specify a command"));
        }
        Ok(command)
    }

    fn to_cmd(&self) -> redis::Cmd {
        let mut cmd = redis::cmd(self.command.trim());
        for arg in &self.args {
            match arg {
                Value::String(s) => cmd.arg(s),
                Value::Bool(b) => cmd.arg(if *b { "1" } else { "0" }),
                other => cmd.arg(other.to_string()),
            };
        }
        cmd
    }
}

pub struct RedisConnector {
    ctx: ConnectorContext,
    conn: Option<ConnectionManager>,
}

impl RedisConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx, conn: None }
    }

    fn connection_info(&self) -> Result<ConnectionInfo> {
        let params = self.ctx.resolve(&REDIS_SPEC)?;
        if let Some(url) = params.url() {
            return url
                .into_connection_info()
                .map_err(|e| ConnectorError::connection("Redis", e));
        }

        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(
                params.require("host")?.to_string(),
                params.port("port", 6379)?,
            ),
            redis: RedisConnectionInfo {
                db: params.parse::<i64>("db")?.unwrap_or(0),
                username: params.get("username").map(str::to_string),
                password: params.get("password").map(str::to_string),
                ..Default::default()
            },
        })
    }

    fn connection(&mut self) -> Result<&mut ConnectionManager> {
        self.conn
            .as_mut()
            .ok_or_else(|| ConnectorError::connection("Redis", "not connected"))
    }
}

#[async_trait]
impl Connectable for RedisConnector {
    fn backend(&self) -> BackendType {
        BackendType::Redis
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        let info = self.connection_info()?;
        debug!("Connecting to Redis at {}", info.addr);

        let client = redis::Client::open(info).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            ConnectorError::connection("Redis", e)
        })?;

        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(self.ctx.connect_timeout())
            .set_number_of_retries(0);
        let mut conn = ConnectionManager::new_with_config(client, config)
            .await
            .map_err(|e| ConnectorError::connection("Redis", e))?;

        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| ConnectorError::connection("Redis", e))?;

        self.conn = Some(conn);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // The manager closes its socket when the last clone drops
        self.conn = None;
        Ok(())
    }
}

#[async_trait]
impl Queryable for RedisConnector {
    async fn run_query(&mut self, query: &str) -> Result<Value> {
        let command = RedisCommand::parse(query)?;
        debug!("Running Redis command {}", command.command);

        let reply: redis::Value = command
            .to_cmd()
            .query_async(self.connection()?)
            .await
            .map_err(ConnectorError::query)?;
        Ok(json!({ "result": reply_to_json(reply) }))
    }
}

// Key-value stores have no schema to describe
impl SchemaIntrospectable for RedisConnector {}

fn reply_to_json(reply: redis::Value) -> Value {
    match reply {
        redis::Value::Nil => Value::Null,
        redis::Value::Int(i) => json!(i),
        redis::Value::Double(d) => json!(d),
        redis::Value::Boolean(b) => Value::Bool(b),
        redis::Value::Okay => Value::String("OK".to_string()),
        redis::Value::SimpleString(s) => Value::String(s),
        redis::Value::BulkString(bytes) => {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        }
        redis::Value::VerbatimString { text, .. } => Value::String(text),
        redis::Value::Array(items) | redis::Value::Set(items) => {
            Value::Array(items.into_iter().map(reply_to_json).collect())
        }
        redis::Value::Map(pairs) => {
            let map: Map<String, Value> = pairs
                .into_iter()
                .map(|(k, v)| {
                    let key = match reply_to_json(k) {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (key, reply_to_json(v))
                })
                .collect();
            Value::Object(map)
        }
        redis::Value::Attribute { data, .. } => reply_to_json(*data),
        redis::Value::Push { data, .. } => {
            Value::Array(data.into_iter().map(reply_to_json).collect())
        }
        redis::Value::ServerError(e) => Value::String(format!("{:?}", e)),
        other => Value::String(format!("{:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbbridge_core::{Connector, Credentials, ErrorKind};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn connector(credentials: Credentials, env: &[(&str, &str)]) -> RedisConnector {
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RedisConnector::new(ConnectorContext::with_env(credentials, Arc::new(env)))
    }

    #[test]
    fn test_connection_info_from_fields() {
        let creds = Credentials::new()
            .with("host", "cache.internal")
            .with("password", "pw")
            .with("db", 3);
        let info = connector(creds, &[]).connection_info().unwrap();
        assert_eq!(
            info.addr,
            ConnectionAddr::Tcp("cache.internal".to_string(), 6379)
        );
        assert_eq!(info.redis.db, 3);
        assert_eq!(info.redis.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_redis_url_from_environment() {
        let info = connector(Credentials::new(), &[("REDIS_URL", "redis://r1:6380/2")])
            .connection_info()
            .unwrap();
        assert_eq!(info.addr, ConnectionAddr::Tcp("r1".to_string(), 6380));
        assert_eq!(info.redis.db, 2);
    }

    #[test]
    fn test_command_arguments() {
        let command =
            RedisCommand::parse(r#"{"command":"SET","args":["k", 5, true]}"#).unwrap();
        let packed = String::from_utf8(command.to_cmd().get_packed_command()).unwrap();
        assert_eq!(packed, "*4\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\n5\r\n$1\r\n1\r\n");
    }

    #[tokio::test]
    async fn test_missing_command_fails_before_connecting() {
        let mut redis = connector(Credentials::new().with("port", 1), &[]);
        let result = redis.execute_query(r#"{"args":["k"]}"#).await;
        assert_eq!(result.kind, Some(ErrorKind::InvalidOperationRequest));
        assert_eq!(result.error.as_deref(), Some("Query must specify a command"));

        let result = redis.execute_query("GET k").await;
        assert_eq!(result.error.as_deref(), Some("Invalid JSON query format"));
    }

    #[test]
    fn test_reply_conversion() {
        let reply = redis::Value::Array(vec![
            redis::Value::BulkString(b"name".to_vec()),
            redis::Value::Int(7),
            redis::Value::Nil,
            redis::Value::Okay,
        ]);
        assert_eq!(reply_to_json(reply), json!(["name", 7, null, "OK"]));

        let map = redis::Value::Map(vec![(
            redis::Value::SimpleString("a".into()),
            redis::Value::Double(1.5),
        )]);
        assert_eq!(reply_to_json(map), json!({ "a": 1.5 }));
    }
}
