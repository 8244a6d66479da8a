//! JSON operation requests
//!
//! Non-SQL connectors accept `{"operation": "...", ...}` objects. Each connector
//! declares a `#[serde(tag = "operation")]` enum and decodes it with
//! [`decode_operation`], which keeps the error taxonomy consistent: malformed
//! JSON and missing fields are invalid requests, unknown names are unsupported
//! operations.

use crate::error::{ConnectorError, Result, DELETE_REQUIRES_FILTERS};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A backend's set of JSON operations
pub trait OperationSet: DeserializeOwned {
    /// Operation names accepted in the `operation` field
    const OPERATIONS: &'static [&'static str];

    /// Checks serde can't express: non-empty ids, non-empty delete filters
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

pub fn decode_operation<T: OperationSet>(query: &str) -> Result<T> {
    let value: Value = serde_json::from_str(query)
        .map_err(|_| ConnectorError::invalid_request("Invalid JSON query format"))?;
    decode_operation_value(value)
}

pub fn decode_operation_value<T: OperationSet>(value: Value) -> Result<T> {
    let object = value
        .as_object()
        .ok_or_else(|| ConnectorError::invalid_request("Invalid JSON query format"))?;

    let operation = match object.get("operation") {
        Some(Value::String(op)) if !op.trim().is_empty() => op.clone(),
        Some(_) => {
            return Err(ConnectorError::invalid_request(
                "Field 'operation' must be a non-empty string",
            ))
        }
        None => {
            return Err(ConnectorError::invalid_request(
                "Query must include an 'operation' field",
            ))
        }
    };

    if !T::OPERATIONS.contains(&operation.as_str()) {
        return Err(ConnectorError::unsupported_operation(operation));
    }

    let decoded: T = serde_json::from_value(value).map_err(|e| {
        ConnectorError::invalid_request(format!("Invalid '{}' request: {}", operation, e))
    })?;
    decoded.validate()?;
    Ok(decoded)
}

/// Query given either as native text (Cypher, GSQL, Flux) or as a JSON object
#[derive(Debug, Clone, PartialEq)]
pub enum QueryInput {
    Text(String),
    Json(Value),
}

impl QueryInput {
    pub fn parse(query: &str) -> Self {
        let trimmed = query.trim();
        if trimmed.starts_with('{') {
            if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
                return QueryInput::Json(value);
            }
        }
        QueryInput::Text(trimmed.to_string())
    }
}

/// Whether a filter value would match everything
pub fn is_empty_filter(filter: Option<&Value>) -> bool {
    match filter {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// Refuse unconditional deletes
pub fn require_filters(filter: Option<&Value>) -> Result<()> {
    if is_empty_filter(filter) {
        return Err(ConnectorError::invalid_request(DELETE_REQUIRES_FILTERS));
    }
    Ok(())
}

pub fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ConnectorError::invalid_request(format!(
            "Field '{}' must not be empty",
            field
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(tag = "operation", rename_all = "snake_case")]
    enum KvOperation {
        Get { key: String },
        Delete { filter: Option<Value> },
    }

    impl OperationSet for KvOperation {
        const OPERATIONS: &'static [&'static str] = &["get", "delete"];

        fn validate(&self) -> Result<()> {
            match self {
                KvOperation::Get { key } => require_non_empty("key", key),
                KvOperation::Delete { filter } => require_filters(filter.as_ref()),
            }
        }
    }

    #[test]
    fn test_decode_valid() {
        let op: KvOperation = decode_operation(r#"{"operation":"get","key":"a"}"#).unwrap();
        assert_eq!(op, KvOperation::Get { key: "a".into() });
    }

    #[test]
    fn test_decode_error_kinds() {
        let cases = [
            ("not json", ErrorKind::InvalidOperationRequest),
            ("[1,2]", ErrorKind::InvalidOperationRequest),
            (r#"{"key":"a"}"#, ErrorKind::InvalidOperationRequest),
            (r#"{"operation":"drop"}"#, ErrorKind::UnsupportedOperation),
            (r#"{"operation":"get"}"#, ErrorKind::InvalidOperationRequest),
            (r#"{"operation":"get","key":""}"#, ErrorKind::InvalidOperationRequest),
        ];
        for (input, kind) in cases {
            let err = decode_operation::<KvOperation>(input).unwrap_err();
            assert_eq!(err.kind(), kind, "input: {}", input);
        }

        let err = decode_operation::<KvOperation>("not json").unwrap_err();
        assert_eq!(err.to_string(), "Invalid JSON query format");
        let err = decode_operation::<KvOperation>(r#"{"operation":"drop"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported operation: drop");
        let err = decode_operation::<KvOperation>(r#"{"operation":"get"}"#).unwrap_err();
        assert!(err.to_string().contains("key"));
    }

    #[test]
    fn test_delete_requires_filters() {
        for filter in [json!(null), json!({}), json!([])] {
            let query = json!({"operation": "delete", "filter": filter}).to_string();
            let err = decode_operation::<KvOperation>(&query).unwrap_err();
            assert_eq!(err.to_string(), DELETE_REQUIRES_FILTERS);
        }
        let err = decode_operation::<KvOperation>(r#"{"operation":"delete"}"#).unwrap_err();
        assert_eq!(err.to_string(), DELETE_REQUIRES_FILTERS);

        assert!(decode_operation::<KvOperation>(
            r#"{"operation":"delete","filter":{"id":1}}"#
        )
        .is_ok());
    }

    #[test]
    fn test_query_input() {
        assert_eq!(
            QueryInput::parse("  MATCH (n) RETURN n "),
            QueryInput::Text("MATCH (n) RETURN n".into())
        );
        assert_eq!(
            QueryInput::parse(r#"{"cypher":"RETURN 1"}"#),
            QueryInput::Json(json!({"cypher": "RETURN 1"}))
        );
        assert!(matches!(QueryInput::parse("{ broken"), QueryInput::Text(_)));
    }
}
