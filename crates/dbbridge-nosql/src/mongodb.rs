//! MongoDB connector
//!
//! Queries are JSON operations:
//!
//! ```json
//! {"operation": "find", "database": "shop", "collection": "orders",
//!  "filter": {"status": "open"}, "projection": {"total": 1}, "limit": 10}
//! ```
//!
//! Schema lists databases, their collections and the fields of one sampled
//! document per collection.

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use dbbridge_core::operation::{require_filters, require_non_empty};
use dbbridge_core::{
    decode_operation, BackendType, Connectable, ConnectorContext, ConnectorError, CredentialSpec,
    FieldSpec, OperationSet, Queryable, Result, SchemaIntrospectable, UrlSpec,
};
use futures::TryStreamExt;
use mongodb::options::{ClientOptions, Credential, ServerAddress};
use mongodb::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};

const MONGO_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::MongoDb,
    url: Some(UrlSpec::complete(&["connection_string", "uri"]).env("MONGO_URI")),
    fields: &[
        FieldSpec::optional("host")
            .aliases(&["hostname"])
            .env("MONGO_HOST")
            .default_value("localhost"),
        FieldSpec::optional("port").default_value("27017"),
        FieldSpec::optional("username").aliases(&["user"]),
        FieldSpec::optional("password").secret(),
        FieldSpec::optional("auth_db")
            .aliases(&["auth_source", "authSource"])
            .default_value("admin"),
        FieldSpec::optional("database").aliases(&["database_name", "db_name"]),
    ],
};

#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
enum MongoOperation {
    Find {
        database: String,
        collection: String,
        #[serde(default)]
        filter: Option<Value>,
        #[serde(default)]
        projection: Option<Value>,
        #[serde(default)]
        limit: Option<i64>,
    },
    Insert {
        database: String,
        collection: String,
        documents: Vec<Value>,
    },
    Update {
        database: String,
        collection: String,
        filter: Value,
        update: Value,
    },
    Delete {
        database: String,
        collection: String,
        #[serde(default)]
        filter: Option<Value>,
    },
}

impl MongoOperation {
    fn target(&self) -> (&str, &str) {
        match self {
            MongoOperation::Find {
                database,
                collection,
                ..
            }
            | MongoOperation::Insert {
                database,
                collection,
                ..
            }
            | MongoOperation::Update {
                database,
                collection,
                ..
            }
            | MongoOperation::Delete {
                database,
                collection,
                ..
            } => (database, collection),
        }
    }
}

impl OperationSet for MongoOperation {
    const OPERATIONS: &'static [&'static str] = &["find", "insert", "update", "delete"];

    fn validate(&self) -> Result<()> {
        let (database, collection) = self.target();
        require_non_empty("database", database)?;
        require_non_empty("collection", collection)?;
        match self {
            MongoOperation::Insert { documents, .. } if documents.is_empty() => Err(
                ConnectorError::invalid_request("Insert operation requires at least one document"),
            ),
            MongoOperation::Delete { filter, .. } => require_filters(filter.as_ref()),
            _ => Ok(()),
        }
    }
}

pub struct MongoConnector {
    ctx: ConnectorContext,
    client: Option<Client>,
    /// Database named in the credentials or the URL path; limits schema listing
    database: Option<String>,
}

impl MongoConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self {
            ctx,
            client: None,
            database: None,
        }
    }

    /// Driver options from a connection string or from individual fields
    async fn client_options(&self) -> Result<(ClientOptions, Option<String>)> {
        let params = self.ctx.resolve(&MONGO_SPEC)?;
        let timeout = self.ctx.connect_timeout();

        let mut options = match params.url() {
            Some(url) => ClientOptions::parse(url).await.map_err(|e| {
                error!("Failed to parse MongoDB URL: {}", e);
                ConnectorError::connection("MongoDB", format!("Failed to parse MongoDB URL: {}", e))
            })?,
            None => {
                let mut options = ClientOptions::builder()
                    .hosts(vec![ServerAddress::Tcp {
                        host: params.require("host")?.to_string(),
                        port: Some(params.port("port", 27017)?),
                    }])
                    .build();
                if let (Some(username), Some(password)) =
                    (params.get("username"), params.get("password"))
                {
                    let mut credential = Credential::default();
                    credential.username = Some(username.to_string());
                    credential.password = Some(password.to_string());
                    credential.source = params.get("auth_db").map(str::to_string);
                    options.credential = Some(credential);
                }
                options
            }
        };

        options.app_name = Some("dbbridge".to_string());
        options.connect_timeout = Some(timeout);
        options.server_selection_timeout = Some(timeout);

        let database = params
            .get("database")
            .map(str::to_string)
            .or_else(|| options.default_database.clone());
        Ok((options, database))
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| ConnectorError::connection("MongoDB", "not connected"))
    }

    async fn database_names(&self) -> Result<Vec<String>> {
        if let Some(database) = &self.database {
            return Ok(vec![database.clone()]);
        }
        self.client()?
            .list_database_names()
            .await
            .map_err(ConnectorError::query)
    }
}

#[async_trait]
impl Connectable for MongoConnector {
    fn backend(&self) -> BackendType {
        BackendType::MongoDb
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        let (options, database) = self.client_options().await?;
        debug!("Connecting to MongoDB hosts {:?}", options.hosts);

        let client = Client::with_options(options)
            .map_err(|e| ConnectorError::connection("MongoDB", e))?;

        // Server selection is lazy; force a round trip
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| {
                error!("MongoDB ping failed: {}", e);
                ConnectorError::connection("MongoDB", e)
            })?;

        self.client = Some(client);
        self.database = database;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client.shutdown().await;
        }
        Ok(())
    }
}

#[async_trait]
impl Queryable for MongoConnector {
    fn prepare(&self, query: &str) -> Result<()> {
        decode_operation::<MongoOperation>(query).map(|_| ())
    }

    async fn run_query(&mut self, query: &str) -> Result<Value> {
        let operation: MongoOperation = decode_operation(query)?;
        let (database, collection) = operation.target();
        let collection = self
            .client()?
            .database(database)
            .collection::<Document>(collection);

        match operation {
            MongoOperation::Find {
                filter,
                projection,
                limit,
                ..
            } => {
                let mut find = collection.find(to_document("filter", filter)?);
                if let Some(projection) = projection {
                    find = find.projection(to_document("projection", Some(projection))?);
                }
                if let Some(limit) = limit.filter(|l| *l > 0) {
                    find = find.limit(limit);
                }
                let documents: Vec<Document> = find
                    .await
                    .map_err(ConnectorError::query)?
                    .try_collect()
                    .await
                    .map_err(ConnectorError::query)?;
                Ok(Value::Array(
                    documents.into_iter().map(document_to_json).collect(),
                ))
            }
            MongoOperation::Insert { documents, .. } => {
                let documents = documents
                    .into_iter()
                    .map(|d| to_document("documents", Some(d)))
                    .collect::<Result<Vec<_>>>()?;
                let result = collection
                    .insert_many(documents)
                    .await
                    .map_err(ConnectorError::query)?;

                let mut ids: Vec<(usize, Bson)> = result.inserted_ids.into_iter().collect();
                ids.sort_by_key(|(idx, _)| *idx);
                let ids: Vec<Value> = ids.into_iter().map(|(_, id)| id_to_json(id)).collect();
                Ok(json!({ "inserted_ids": ids }))
            }
            MongoOperation::Update { filter, update, .. } => {
                let result = collection
                    .update_many(
                        to_document("filter", Some(filter))?,
                        to_document("update", Some(update))?,
                    )
                    .await
                    .map_err(ConnectorError::query)?;
                Ok(json!({
                    "matched_count": result.matched_count,
                    "modified_count": result.modified_count,
                }))
            }
            MongoOperation::Delete { filter, .. } => {
                let result = collection
                    .delete_many(to_document("filter", filter)?)
                    .await
                    .map_err(ConnectorError::query)?;
                Ok(json!({ "deleted_count": result.deleted_count }))
            }
        }
    }
}

#[async_trait]
impl SchemaIntrospectable for MongoConnector {
    async fn fetch_schema(&mut self) -> Result<Value> {
        let client = self.client()?.clone();
        let mut databases = Vec::new();

        for db_name in self.database_names().await? {
            let db = client.database(&db_name);
            let mut collections = Vec::new();

            let names = match db.list_collection_names().await {
                Ok(names) => names,
                Err(e) => {
                    warn!("Skipping database {}: {}", db_name, e);
                    continue;
                }
            };
            for name in names {
                let sample = db
                    .collection::<Document>(&name)
                    .find_one(doc! {})
                    .await
                    .map_err(ConnectorError::query)?;
                let fields: Vec<Value> = sample
                    .iter()
                    .flat_map(|d| d.iter())
                    .map(|(key, value)| json!({ "name": key, "type": bson_type_name(value) }))
                    .collect();
                collections.push(json!({ "name": name, "fields": fields }));
            }

            databases.push(json!({ "name": db_name, "collections": collections }));
        }

        Ok(json!({ "databases": databases }))
    }
}

/// Decode a JSON value (including extended JSON like `{"$oid": ...}`) as a document
fn to_document(field: &str, value: Option<Value>) -> Result<Document> {
    let value = match value {
        None | Some(Value::Null) => return Ok(Document::new()),
        Some(value) => value,
    };
    match Bson::try_from(value) {
        Ok(Bson::Document(document)) => Ok(document),
        Ok(_) => Err(ConnectorError::invalid_request(format!(
            "Field '{}' must be a JSON object",
            field
        ))),
        Err(e) => Err(ConnectorError::invalid_request(format!(
            "Field '{}' is not valid extended JSON: {}",
            field, e
        ))),
    }
}

fn id_to_json(id: Bson) -> Value {
    match id {
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        other => bson_to_json(other),
    }
}

fn document_to_json(document: Document) -> Value {
    let map: Map<String, Value> = document
        .into_iter()
        .map(|(key, value)| {
            let value = if key == "_id" {
                id_to_json(value)
            } else {
                bson_to_json(value)
            };
            (key, value)
        })
        .collect();
    Value::Object(map)
}

fn bson_to_json(value: Bson) -> Value {
    match value {
        Bson::Document(document) => document_to_json(document),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_json).collect()),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .map(Value::String)
            .unwrap_or_else(|_| json!(dt.timestamp_millis())),
        Bson::Decimal128(d) => Value::String(d.to_string()),
        Bson::Int32(i) => json!(i),
        Bson::Int64(i) => json!(i),
        other => other.into_relaxed_extjson(),
    }
}

fn bson_type_name(value: &Bson) -> &'static str {
    match value {
        Bson::String(_) => "string",
        Bson::Int32(_) => "int32",
        Bson::Int64(_) => "int64",
        Bson::Double(_) => "double",
        Bson::Decimal128(_) => "decimal",
        Bson::Boolean(_) => "boolean",
        Bson::DateTime(_) | Bson::Timestamp(_) => "date",
        Bson::Array(_) => "array",
        Bson::Document(_) => "object",
        Bson::ObjectId(_) => "objectId",
        Bson::Binary(_) => "binData",
        Bson::Null => "null",
        _ => "unknown",
    }
}
