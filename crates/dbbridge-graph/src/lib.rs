//! Graph database connectors
//!
//! Neo4j speaks Bolt through `neo4rs` and takes Cypher text or
//! `{"cypher", "params"}`. TigerGraph is driven over REST++ and the GSQL
//! server and takes GSQL text or a JSON operation.

#[cfg(feature = "neo4j")]
pub mod neo4j;
#[cfg(feature = "tigergraph")]
pub mod tigergraph;

use dbbridge_core::{connector_binding, BackendType, ConnectorBinding};

/// Registry bindings for the graph family
pub fn bindings() -> Vec<ConnectorBinding> {
    vec![
        connector_binding!("neo4j", BackendType::Neo4j, |ctx| {
            crate::neo4j::Neo4jConnector::new(ctx)
        }),
        connector_binding!("tigergraph", BackendType::TigerGraph, |ctx| {
            crate::tigergraph::TigerGraphConnector::new(ctx)
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbbridge_core::Family;

    #[test]
    fn test_bindings_cover_graph_family() {
        let backends: Vec<BackendType> = bindings().iter().map(|b| b.backend).collect();
        assert_eq!(backends, vec![BackendType::Neo4j, BackendType::TigerGraph]);
        assert!(backends.iter().all(|b| b.family() == Family::Graph));
    }
}
