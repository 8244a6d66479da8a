//! DbBridge: one connector contract for relational, NoSQL, graph, warehouse,
//! cloud and time-series databases.
//!
//! ```no_run
//! # async fn demo() -> dbbridge_connectors::Result<()> {
//! use dbbridge_connectors::{get_connector, Connector, Credentials};
//!
//! let creds = Credentials::new().with("path", "/tmp/app.db");
//! let mut connector = get_connector("sqlite", creds)?;
//! let result = connector.execute_query("SELECT 1 AS one").await;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```
//!
//! Every backend is a cargo feature; all but `oracle` and `db2` are on by
//! default. A backend compiled out still parses, and resolving it reports the
//! missing feature.

pub use dbbridge_core::*;

use once_cell::sync::Lazy;
use std::sync::Arc;
use tracing::debug;

static DEFAULT_REGISTRY: Lazy<ConnectorRegistry> = Lazy::new(|| {
    debug!("Initializing default connector registry");
    ConnectorRegistry::new().with_bindings(default_bindings())
});

/// Bindings for all 29 backends, in family order
pub fn default_bindings() -> Vec<ConnectorBinding> {
    let mut bindings = dbbridge_relational::bindings();
    bindings.extend(dbbridge_nosql::bindings());
    bindings.extend(dbbridge_graph::bindings());
    bindings.extend(dbbridge_warehouse::bindings());
    bindings.extend(dbbridge_cloud::bindings());
    bindings.extend(dbbridge_timeseries::bindings());
    bindings
}

/// Process-wide registry reading fallbacks from the real environment
pub fn default_registry() -> &'static ConnectorRegistry {
    &DEFAULT_REGISTRY
}

/// Fresh registry with every binding, reading fallbacks from `env`
pub fn registry_with_env(env: Arc<dyn EnvSource>) -> ConnectorRegistry {
    ConnectorRegistry::with_env(env).with_bindings(default_bindings())
}

/// Resolve `backend` to a new connector through the default registry
pub fn get_connector(backend: &str, credentials: Credentials) -> Result<Box<dyn Connector>> {
    default_registry().get_connector(backend, credentials)
}

/// Resolve and test in one call
///
/// Registry failures are reported like connection failures:
/// `(false, "Error connecting to <backend>: <cause>")`.
pub async fn test_connection(backend: &str, credentials: Credentials) -> (bool, String) {
    test_connection_with(default_registry(), backend, credentials).await
}

pub async fn test_connection_with(
    registry: &ConnectorRegistry,
    backend: &str,
    credentials: Credentials,
) -> (bool, String) {
    match registry.get_connector(backend, credentials) {
        Ok(mut connector) => connector.test_connection().await,
        Err(e) => (false, format!("Error connecting to {}: {}", backend, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn isolated() -> ConnectorRegistry {
        registry_with_env(Arc::new(HashMap::<String, String>::new()))
    }

    #[test]
    fn test_every_backend_is_registered() {
        let registry = isolated();
        assert_eq!(registry.backends(), BackendType::ALL.to_vec());
    }

    #[test]
    fn test_unknown_backend() {
        let err = get_connector("nosuchdb", Credentials::new()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::UnsupportedBackend);
        assert_eq!(err.to_string(), "Unsupported database type: nosuchdb");
    }

    #[cfg(not(feature = "oracle"))]
    #[test]
    fn test_disabled_feature_is_cached_failure() {
        let registry = isolated();
        let first = registry.get_connector("oracle", Credentials::new()).err().unwrap();
        assert_eq!(first.kind(), ErrorKind::DependencyUnavailable);
        assert!(first.to_string().contains("`oracle` feature"));
        assert!(registry.availability(BackendType::Oracle).is_err());
    }

    #[tokio::test]
    async fn test_connection_wraps_registry_errors() {
        let (ok, message) = test_connection("nosuchdb", Credentials::new()).await;
        assert!(!ok);
        assert_eq!(
            message,
            "Error connecting to nosuchdb: Unsupported database type: nosuchdb"
        );
    }

    #[tokio::test]
    async fn test_missing_credentials_through_registry() {
        let registry = isolated();
        let (ok, message) =
            test_connection_with(&registry, "PostgreSQL", Credentials::new()).await;
        assert!(!ok);
        assert!(message.contains("Missing required credentials for PostgreSQL: database"));
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_sqlite_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop.db");
        let creds = || Credentials::new().with("path", path.to_str().unwrap());
        let registry = isolated();

        let mut connector = registry.get_connector("sqlite", creds()).unwrap();
        let created = connector
            .execute_query("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .await;
        assert!(created.success, "{:?}", created.error);

        let inserted = connector
            .execute_query("INSERT INTO items (name) VALUES ('bolt'), ('nut')")
            .await;
        assert_eq!(inserted.data, Some(json!({"affected_rows": 2})));

        let mut fresh = registry.get_connector("sqlite", creds()).unwrap();
        let rows = fresh
            .execute_query("SELECT name FROM items ORDER BY id")
            .await;
        assert_eq!(rows.data, Some(json!([{"name": "bolt"}, {"name": "nut"}])));

        let schema = fresh.get_schema().await;
        let tree = normalize("sqlite", &schema);
        let items = tree.entity("items").unwrap();
        assert_eq!(items.fields.len(), 2);
    }
}
