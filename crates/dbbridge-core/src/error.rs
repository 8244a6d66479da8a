use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Message used by every delete operation that is invoked without a filter.
pub const DELETE_REQUIRES_FILTERS: &str =
    "Delete operation requires filters to avoid accidental deletion of all records";

/// Unified error type for registry, credential and connector operations
#[derive(Error, Debug, Clone)]
pub enum ConnectorError {
    /// Backend identifier is not known to the registry
    #[error("Unsupported database type: {backend}")]
    UnsupportedBackend { backend: String },

    /// The connector for a known backend could not be bound (driver not compiled in)
    #[error("Failed to load connector for {backend}. The required dependency may not be installed: {cause}")]
    DependencyUnavailable { backend: String, cause: String },

    /// Credential resolution found no usable value for one or more required fields
    #[error("Missing required credentials for {backend}: {}", fields.join(", "))]
    MissingCredential { backend: String, fields: Vec<String> },

    /// Native connect call failed
    #[error("Error connecting to {backend}: {message}")]
    Connection { backend: String, message: String },

    /// Native query call failed after a successful connect
    #[error("Error executing query: {0}")]
    QueryExecution(String),

    /// JSON `operation` names something the connector does not implement
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// JSON operation is recognized but its request is incomplete or malformed
    #[error("{0}")]
    InvalidOperationRequest(String),
}

impl ConnectorError {
    /// Create a connection error for a backend display name
    pub fn connection(backend: impl Into<String>, message: impl fmt::Display) -> Self {
        ConnectorError::Connection {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    /// Create a query execution error keeping the driver message
    pub fn query(message: impl fmt::Display) -> Self {
        ConnectorError::QueryExecution(message.to_string())
    }

    /// Create an invalid operation request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        ConnectorError::InvalidOperationRequest(message.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported_operation(operation: impl Into<String>) -> Self {
        ConnectorError::UnsupportedOperation(operation.into())
    }

    /// Create a missing credential error
    pub fn missing_credential(backend: impl Into<String>, fields: Vec<String>) -> Self {
        ConnectorError::MissingCredential {
            backend: backend.into(),
            fields,
        }
    }

    /// The taxonomy entry callers branch on
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectorError::UnsupportedBackend { .. } => ErrorKind::UnsupportedBackend,
            ConnectorError::DependencyUnavailable { .. } => ErrorKind::DependencyUnavailable,
            ConnectorError::MissingCredential { .. } => ErrorKind::MissingCredential,
            ConnectorError::Connection { .. } => ErrorKind::Connection,
            ConnectorError::QueryExecution(_) => ErrorKind::QueryExecution,
            ConnectorError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            ConnectorError::InvalidOperationRequest(_) => ErrorKind::InvalidOperationRequest,
        }
    }

    /// Whether the caller can fix the failure by changing its input
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::MissingCredential
                | ErrorKind::UnsupportedOperation
                | ErrorKind::InvalidOperationRequest
        )
    }
}

/// Error taxonomy without payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedBackend,
    DependencyUnavailable,
    MissingCredential,
    Connection,
    QueryExecution,
    UnsupportedOperation,
    InvalidOperationRequest,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::UnsupportedBackend => "unsupported_backend",
            ErrorKind::DependencyUnavailable => "dependency_unavailable",
            ErrorKind::MissingCredential => "missing_credential",
            ErrorKind::Connection => "connection",
            ErrorKind::QueryExecution => "query_execution",
            ErrorKind::UnsupportedOperation => "unsupported_operation",
            ErrorKind::InvalidOperationRequest => "invalid_operation_request",
        };
        write!(f, "{}", name)
    }
}

pub type Result<T> = std::result::Result<T, ConnectorError>;
