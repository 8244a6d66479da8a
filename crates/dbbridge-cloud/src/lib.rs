//! Managed cloud database connectors
//!
//! All three speak REST and take JSON operations. Cosmos DB signs each
//! request with the account master key, Firestore authenticates with a Google
//! service account and Supabase goes through its PostgREST API key.

#[cfg(feature = "cosmosdb")]
pub mod cosmosdb;
#[cfg(feature = "firestore")]
pub mod firestore;
#[cfg(feature = "supabase")]
pub mod supabase;

use dbbridge_core::{connector_binding, BackendType, ConnectorBinding};

/// Registry bindings for the cloud family
pub fn bindings() -> Vec<ConnectorBinding> {
    vec![
        connector_binding!("cosmosdb", BackendType::CosmosDb, |ctx| {
            crate::cosmosdb::CosmosDbConnector::new(ctx)
        }),
        connector_binding!("firestore", BackendType::Firestore, |ctx| {
            crate::firestore::FirestoreConnector::new(ctx)
        }),
        connector_binding!("supabase", BackendType::Supabase, |ctx| {
            crate::supabase::SupabaseConnector::new(ctx)
        }),
    ]
}
