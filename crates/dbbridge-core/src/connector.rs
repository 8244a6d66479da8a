use crate::backend::BackendType;
use crate::credentials::{CredentialSpec, Credentials, EnvSource, ProcessEnv, ResolvedParams};
use crate::error::{ConnectorError, ErrorKind, Result};
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Connect timeout applied when the credentials don't set `connect_timeout_secs`
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Request timeout for REST-backed connectors
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a connector constructor receives
#[derive(Clone)]
pub struct ConnectorContext {
    pub credentials: Credentials,
    pub env: Arc<dyn EnvSource>,
}

impl ConnectorContext {
    pub fn new(credentials: Credentials) -> Self {
        Self::with_env(credentials, Arc::new(ProcessEnv))
    }

    pub fn with_env(credentials: Credentials, env: Arc<dyn EnvSource>) -> Self {
        Self { credentials, env }
    }

    pub fn resolve(&self, spec: &CredentialSpec) -> Result<ResolvedParams> {
        spec.resolve(&self.credentials, self.env.as_ref())
    }

    pub fn connect_timeout(&self) -> Duration {
        self.credentials
            .get("connect_timeout_secs")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl std::fmt::Debug for ConnectorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorContext")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of one exclusively owned native handle
#[async_trait]
pub trait Connectable: Send {
    fn backend(&self) -> BackendType;

    fn is_connected(&self) -> bool;

    /// Upper bound for `open`
    fn connect_timeout(&self) -> Duration {
        DEFAULT_CONNECT_TIMEOUT
    }

    /// Resolve credentials, open the native handle and verify it.
    /// Only called while no handle is held.
    async fn open(&mut self) -> Result<()>;

    /// Release the native handle. Implementations must drop the handle even
    /// when the native close call fails.
    async fn close(&mut self) -> Result<()>;
}

/// Native schema retrieval
#[async_trait]
pub trait SchemaIntrospectable: Connectable {
    /// Raw schema in the backend's own shape. Defaults to the limited marker.
    async fn fetch_schema(&mut self) -> Result<Value> {
        Ok(limited_schema(self.backend()))
    }
}

/// Query execution against an open handle
#[async_trait]
pub trait Queryable: Connectable {
    /// Validate a request before any native handle is opened. JSON-driven
    /// connectors decode their operation here so caller errors never reach
    /// the server.
    fn prepare(&self, _query: &str) -> Result<()> {
        Ok(())
    }

    /// Run a SQL string or JSON operation. Called only after `open` succeeded.
    async fn run_query(&mut self, query: &str) -> Result<Value>;
}

/// The four-operation contract every connector exposes
///
/// Implemented for every type that is both [`Queryable`] and
/// [`SchemaIntrospectable`]; concrete connectors never implement it by hand.
#[async_trait]
pub trait Connector: Connectable {
    /// Open the handle unless one is already held
    async fn connect(&mut self) -> Result<()>;

    /// Release the handle if held. Never fails.
    async fn disconnect(&mut self);

    /// Connect and disconnect, reporting the outcome as a message
    async fn test_connection(&mut self) -> (bool, String);

    /// Raw schema, or `{"error": ...}` when introspection failed
    async fn get_schema(&mut self) -> Value;

    /// Run one query inside a scoped connection
    async fn execute_query(&mut self, query: &str) -> ExecutionResult;
}

#[async_trait]
impl<T> Connector for T
where
    T: Queryable + SchemaIntrospectable,
{
    async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let backend = self.backend();
        let timeout = self.connect_timeout();
        debug!("Connecting to {}", backend.display_name());

        match tokio::time::timeout(timeout, self.open()).await {
            Ok(Ok(())) => {
                debug!("Connected to {}", backend.display_name());
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Failed to connect to {}: {}", backend.display_name(), e);
                Err(wrap_connect_error(backend, e))
            }
            Err(_) => {
                error!(
                    "Connecting to {} timed out after {}s",
                    backend.display_name(),
                    timeout.as_secs()
                );
                Err(ConnectorError::connection(
                    backend.display_name(),
                    format!("connection timed out after {}s", timeout.as_secs()),
                ))
            }
        }
    }

    async fn disconnect(&mut self) {
        if !self.is_connected() {
            return;
        }

        let backend = self.backend();
        match AssertUnwindSafe(self.close()).catch_unwind().await {
            Ok(Ok(())) => debug!("Disconnected from {}", backend.display_name()),
            Ok(Err(e)) => warn!(
                "Error while disconnecting from {}: {}",
                backend.display_name(),
                e
            ),
            Err(panic) => warn!(
                "Disconnect from {} panicked: {}",
                backend.display_name(),
                panic_message(panic.as_ref())
            ),
        }
    }

    async fn test_connection(&mut self) -> (bool, String) {
        let outcome = AssertUnwindSafe(self.connect()).catch_unwind().await;
        self.disconnect().await;

        match outcome {
            Ok(Ok(())) => (true, "Connection successful".to_string()),
            Ok(Err(e)) => (false, format!("Connection failed: {}", e)),
            Err(panic) => (
                false,
                format!("Connection failed: {}", panic_message(panic.as_ref())),
            ),
        }
    }

    async fn get_schema(&mut self) -> Value {
        let outcome = AssertUnwindSafe(async {
            self.connect().await?;
            self.fetch_schema().await
        })
        .catch_unwind()
        .await;
        self.disconnect().await;

        let err = match outcome {
            Ok(Ok(schema)) => return schema,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };
        warn!(
            "Schema introspection failed for {}: {}",
            self.backend().display_name(),
            err
        );
        json!({ "error": format!("Error getting schema: {}", err) })
    }

    async fn execute_query(&mut self, query: &str) -> ExecutionResult {
        let outcome = AssertUnwindSafe(async {
            self.prepare(query)?;
            self.connect().await?;
            self.run_query(query).await
        })
        .catch_unwind()
        .await;
        self.disconnect().await;

        match outcome {
            Ok(Ok(data)) => ExecutionResult::ok(data),
            Ok(Err(e)) => {
                debug!("Query against {} failed: {}", self.backend(), e);
                ExecutionResult::failed(e)
            }
            Err(panic) => {
                error!("Connector {} panicked during query", self.backend());
                ExecutionResult::failed(ConnectorError::query(panic_message(panic.as_ref())))
            }
        }
    }
}

/// Errors from `open` that already carry their kind pass through; anything
/// else (a failed check query, for instance) becomes a connection error.
fn wrap_connect_error(backend: BackendType, err: ConnectorError) -> ConnectorError {
    match err {
        ConnectorError::QueryExecution(message) => {
            ConnectorError::connection(backend.display_name(), message)
        }
        other => other,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("connector panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("connector panicked: {}", s)
    } else {
        "connector panicked".to_string()
    }
}

/// Sentinel for backends without meaningful schema metadata
pub fn limited_schema(backend: BackendType) -> Value {
    json!({
        "limited": true,
        "message": format!(
            "Schema introspection is limited for {}; inspect documents with a query instead",
            backend.display_name()
        ),
    })
}

/// Outcome of `execute_query`
///
/// `success` is true exactly when `error` is `None`; `data` is only set on success.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub data: Option<Value>,
    pub success: bool,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl ExecutionResult {
    pub fn ok(data: Value) -> Self {
        Self {
            data: Some(data),
            success: true,
            error: None,
            kind: None,
        }
    }

    pub fn failed(err: ConnectorError) -> Self {
        let kind = err.kind();
        let mut message = err.to_string();
        if message.trim().is_empty() {
            message = format!("{} error", kind);
        }
        Self {
            data: None,
            success: false,
            error: Some(message),
            kind: Some(kind),
        }
    }

    pub fn into_tuple(self) -> (Option<Value>, bool, Option<String>) {
        (self.data, self.success, self.error)
    }
}
