//! # dbbridge-core
//!
//! Connector abstraction shared by every DbBridge backend crate.
//!
//! A caller hands a backend identifier and a credentials map to a
//! [`ConnectorRegistry`] and gets back a fresh [`Connector`] exposing four
//! operations: connect, test, introspect schema and execute query.
//!
//! ## Architecture
//!
//! - **Connectable**: owns one native handle (`open` / `close`)
//! - **SchemaIntrospectable**: returns the backend's raw schema
//! - **Queryable**: runs a SQL string or JSON operation
//! - **Connector**: the lifecycle contract, implemented for every type that
//!   provides the three traits above
//!
//! Credentials are resolved through [`CredentialSpec`] (explicit connection
//! string, then fields, then environment variables, then defaults), JSON
//! operations are decoded with [`decode_operation`] and raw schemas are
//! flattened with [`normalize`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbbridge_core::{ConnectorRegistry, Credentials};
//!
//! # async fn example(registry: ConnectorRegistry) -> dbbridge_core::Result<()> {
//! let credentials = Credentials::new().with("connection_string", "postgresql://u:p@h:5432/d");
//! let mut connector = registry.get_connector("postgresql", credentials)?;
//!
//! let (ok, message) = connector.test_connection().await;
//! let result = connector.execute_query("SELECT 1 AS x").await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Backend Implementation
//!
//! 1. Create a struct holding a [`ConnectorContext`] and an `Option` of the native handle
//! 2. Implement `Connectable`, `SchemaIntrospectable` and `Queryable`
//! 3. Declare a binding with [`connector_binding!`] gated on the backend's cargo feature

pub mod backend;
pub mod connector;
pub mod credentials;
pub mod error;
pub mod google;
pub mod http;
pub mod operation;
pub mod registry;
pub mod schema;
pub mod sql;

// Re-export commonly used items
pub use backend::{BackendType, CredentialRequirements, Family};
pub use connector::{
    limited_schema, Connectable, Connector, ConnectorContext, ExecutionResult, Queryable,
    SchemaIntrospectable, DEFAULT_CONNECT_TIMEOUT, HTTP_TIMEOUT,
};
pub use credentials::{
    mask_secret, CredentialSpec, Credentials, EnvSource, FieldSpec, ProcessEnv, ResolvedParams,
    UrlSpec, UrlTarget,
};
pub use error::{ConnectorError, ErrorKind, Result, DELETE_REQUIRES_FILTERS};
pub use http::RestClient;
pub use operation::{decode_operation, decode_operation_value, OperationSet, QueryInput};
pub use registry::{BindFn, Constructor, ConnectorBinding, ConnectorRegistry};
pub use schema::{normalize, normalize_for, EntityKind, SchemaEntity, SchemaField, SchemaTree};
