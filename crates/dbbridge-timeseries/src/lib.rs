//! Time-series database connectors
//!
//! InfluxDB takes Flux text or JSON `query`/`write` operations over HTTP.
//! TimescaleDB is plain SQL on the PostgreSQL driver with a hypertable schema.
//! kdb+ speaks its own IPC protocol and takes q text.

#[cfg(feature = "influxdb")]
pub mod influxdb;
#[cfg(feature = "kdb")]
pub mod kdb;
#[cfg(feature = "timescaledb")]
pub mod timescaledb;

use dbbridge_core::{connector_binding, BackendType, ConnectorBinding};

/// Registry bindings for the time-series family
pub fn bindings() -> Vec<ConnectorBinding> {
    vec![
        connector_binding!("influxdb", BackendType::InfluxDb, |ctx| {
            crate::influxdb::InfluxDbConnector::new(ctx)
        }),
        connector_binding!("timescaledb", BackendType::TimescaleDb, |ctx| {
            crate::timescaledb::TimescaleDbConnector::new(ctx)
        }),
        connector_binding!("kdb", BackendType::Kdb, |ctx| {
            crate::kdb::KdbConnector::new(ctx)
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbbridge_core::Family;

    #[test]
    fn test_bindings_cover_timeseries_family() {
        let backends: Vec<BackendType> = bindings().iter().map(|b| b.backend).collect();
        assert_eq!(
            backends,
            vec![BackendType::InfluxDb, BackendType::TimescaleDb, BackendType::Kdb]
        );
        assert!(backends.iter().all(|b| b.family() == Family::TimeSeries));
    }
}
