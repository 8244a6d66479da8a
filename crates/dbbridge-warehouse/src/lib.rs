//! Data warehouse connectors
//!
//! Snowflake and BigQuery are driven over their REST APIs; Synapse dedicated
//! SQL pools reuse the SQL Server connector from `dbbridge-relational`.
//! Schemas nest tables under their schema or dataset.

#[cfg(feature = "bigquery")]
pub mod bigquery;
#[cfg(feature = "snowflake")]
pub mod snowflake;

use dbbridge_core::{connector_binding, BackendType, ConnectorBinding};

/// Registry bindings for the warehouse family
pub fn bindings() -> Vec<ConnectorBinding> {
    vec![
        connector_binding!("snowflake", BackendType::Snowflake, |ctx| {
            crate::snowflake::SnowflakeConnector::new(ctx)
        }),
        connector_binding!("bigquery", BackendType::BigQuery, |ctx| {
            crate::bigquery::BigQueryConnector::new(ctx)
        }),
        connector_binding!("synapse", BackendType::Synapse, |ctx| {
            dbbridge_relational::sqlserver::SqlServerConnector::synapse(ctx)
        }),
    ]
}
