//! NoSQL connectors
//!
//! MongoDB, DynamoDB and Elasticsearch take JSON operations; Redis takes
//! `{"command", "args"}`; Cassandra and Couchbase take CQL and N1QL text.
//! Every delete-style operation refuses to run without a filter, key or id.

#[cfg(feature = "cassandra")]
pub mod cassandra;
#[cfg(feature = "couchbase")]
pub mod couchbase;
#[cfg(feature = "dynamodb")]
pub mod dynamodb;
#[cfg(feature = "elasticsearch")]
pub mod elasticsearch;
#[cfg(feature = "mongodb")]
pub mod mongodb;
#[cfg(feature = "redis")]
pub mod redis;

use dbbridge_core::{connector_binding, BackendType, ConnectorBinding};

/// Registry bindings for the NoSQL family
pub fn bindings() -> Vec<ConnectorBinding> {
    vec![
        connector_binding!("mongodb", BackendType::MongoDb, |ctx| {
            crate::mongodb::MongoConnector::new(ctx)
        }),
        connector_binding!("cassandra", BackendType::Cassandra, |ctx| {
            crate::cassandra::CassandraConnector::new(ctx)
        }),
        connector_binding!("redis", BackendType::Redis, |ctx| {
            crate::redis::RedisConnector::new(ctx)
        }),
        connector_binding!("elasticsearch", BackendType::Elasticsearch, |ctx| {
            crate::elasticsearch::ElasticsearchConnector::new(ctx)
        }),
        connector_binding!("dynamodb", BackendType::DynamoDb, |ctx| {
            crate::dynamodb::DynamoDbConnector::new(ctx)
        }),
        connector_binding!("couchbase", BackendType::Couchbase, |ctx| {
            crate::couchbase::CouchbaseConnector::new(ctx)
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbbridge_core::Family;

    #[test]
    fn test_bindings_cover_nosql_family() {
        let backends: Vec<BackendType> = bindings().iter().map(|b| b.backend).collect();
        let expected: Vec<BackendType> = BackendType::ALL
            .iter()
            .copied()
            .filter(|b| b.family() == Family::NoSql)
            .collect();
        assert_eq!(backends.len(), expected.len());
        for backend in expected {
            assert!(backends.contains(&backend), "{} not bound", backend);
        }
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    async fn test_registry_builds_fresh_instances() {
        use dbbridge_core::{Connectable, Connector, ConnectorRegistry, Credentials};

        let registry = ConnectorRegistry::new().with_bindings(bindings());
        let mut first = registry.get_connector("REDIS", Credentials::new()).unwrap();
        let second = registry.get_connector("redis", Credentials::new()).unwrap();
        assert_eq!(first.backend(), BackendType::Redis);
        assert!(!first.is_connected() && !second.is_connected());

        let result = first.execute_query("{}").await;
        assert_eq!(result.error.as_deref(), Some("Query must specify a command"));
    }
}
