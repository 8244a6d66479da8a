//! Relational SQL connectors
//!
//! One cargo feature per backend. The Postgres wire protocol serves
//! PostgreSQL, Redshift, Heroku, Neon and Crunchy Bridge; MySQL serves MariaDB
//! and Cloud SQL. Oracle and Db2 are opt-in because their drivers need system
//! client libraries.
//!
//! Reads (`SELECT`, `WITH`, `SHOW`, ...) return an array of row objects and
//! writes return `{"affected_rows": n}`. Scripts with several statements return
//! the rows of the last read, or the summed write counts when there is no read.
//! SQLite accepts one statement per call.

pub mod catalog;

#[cfg(any(feature = "sqlite", feature = "oracle", feature = "db2"))]
mod blocking;
#[cfg(feature = "db2")]
pub mod db2;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "oracle")]
pub mod oracle;
#[cfg(feature = "postgresql")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "sqlserver")]
pub mod sqlserver;
#[cfg(feature = "postgresql")]
mod tls;

use dbbridge_core::{connector_binding, BackendType, ConnectorBinding};

/// Registry bindings for every relational backend
///
/// Backends whose feature is off are still listed; binding them reports the
/// missing feature.
pub fn bindings() -> Vec<ConnectorBinding> {
    vec![
        connector_binding!("postgresql", BackendType::PostgreSql, |ctx| {
            crate::postgres::PostgresConnector::new(ctx)
        }),
        connector_binding!("redshift", BackendType::Redshift, |ctx| {
            crate::postgres::PostgresConnector::with_flavor(
                ctx,
                crate::postgres::PostgresFlavor::Redshift,
            )
        }),
        connector_binding!("heroku", BackendType::Heroku, |ctx| {
            crate::postgres::PostgresConnector::with_flavor(
                ctx,
                crate::postgres::PostgresFlavor::Heroku,
            )
        }),
        connector_binding!("neon", BackendType::Neon, |ctx| {
            crate::postgres::PostgresConnector::with_flavor(
                ctx,
                crate::postgres::PostgresFlavor::Neon,
            )
        }),
        connector_binding!("crunchybridge", BackendType::CrunchyBridge, |ctx| {
            crate::postgres::PostgresConnector::with_flavor(
                ctx,
                crate::postgres::PostgresFlavor::CrunchyBridge,
            )
        }),
        connector_binding!("mysql", BackendType::MySql, |ctx| {
            crate::mysql::MySqlConnector::new(ctx)
        }),
        connector_binding!("mariadb", BackendType::MariaDb, |ctx| {
            crate::mysql::MySqlConnector::with_flavor(ctx, crate::mysql::MySqlFlavor::MariaDb)
        }),
        connector_binding!("cloudsql", BackendType::CloudSql, |ctx| {
            crate::mysql::MySqlConnector::with_flavor(ctx, crate::mysql::MySqlFlavor::CloudSql)
        }),
        connector_binding!("sqlite", BackendType::Sqlite, |ctx| {
            crate::sqlite::SqliteConnector::new(ctx)
        }),
        connector_binding!("sqlserver", BackendType::SqlServer, |ctx| {
            crate::sqlserver::SqlServerConnector::new(ctx)
        }),
        connector_binding!("oracle", BackendType::Oracle, |ctx| {
            crate::oracle::OracleConnector::new(ctx)
        }),
        connector_binding!("db2", BackendType::Db2, |ctx| {
            crate::db2::Db2Connector::new(ctx)
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbbridge_core::{ConnectorRegistry, Credentials, ErrorKind};

    #[test]
    fn test_bindings_cover_relational_family() {
        let bindings = bindings();
        let backends: Vec<BackendType> = bindings.iter().map(|b| b.backend).collect();
        for backend in BackendType::ALL {
            if backend.family() == dbbridge_core::Family::Relational {
                assert!(backends.contains(&backend), "{} not bound", backend);
            }
        }
    }

    #[cfg(not(feature = "oracle"))]
    #[test]
    fn test_disabled_feature_is_dependency_error() {
        let registry = ConnectorRegistry::new().with_bindings(bindings());
        let err = registry
            .get_connector("oracle", Credentials::new())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::DependencyUnavailable);
        assert!(err.to_string().contains("`oracle` feature"));
    }
}
