//! Neo4j connector over Bolt
//!
//! Accepts Cypher text or `{"cypher": "...", "params": {...}}`. Nodes come
//! back as their properties plus `_id` and `_labels`; relationships carry
//! `_id`, `_type`, `_start` and `_end`. Paths become `{"nodes", "relationships"}`
//! and temporal values ISO-8601 strings.

use async_trait::async_trait;
use dbbridge_core::{
    BackendType, Connectable, ConnectorContext, ConnectorError, CredentialSpec, FieldSpec,
    QueryInput, Queryable, Result, SchemaIntrospectable, UrlSpec,
};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use neo4rs::{query, BoltList, BoltMap, BoltNull, BoltString, BoltType, ConfigBuilder, Graph, Query};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, warn};

const NEO4J_SPEC: CredentialSpec = CredentialSpec {
    backend: BackendType::Neo4j,
    url: Some(UrlSpec::field("uri", &["connection_string", "bolt_url"]).env("NEO4J_URI")),
    fields: &[
        FieldSpec::optional("uri").default_value("bolt://localhost:7687"),
        FieldSpec::required("username")
            .aliases(&["user"])
            .env("NEO4J_USERNAME"),
        FieldSpec::required("password").env("NEO4J_PASSWORD").secret(),
        FieldSpec::optional("database").env("NEO4J_DATABASE"),
    ],
};

const NODE_PROPERTIES_CYPHER: &str = "CALL db.schema.nodeTypeProperties() \
     YIELD nodeType, propertyName, propertyTypes \
     RETURN nodeType AS name, collect({name: propertyName, types: propertyTypes}) AS properties";

const REL_PROPERTIES_CYPHER: &str = "CALL db.schema.relTypeProperties() \
     YIELD relType, propertyName, propertyTypes \
     RETURN relType AS name, collect({name: propertyName, types: propertyTypes}) AS properties";

pub struct Neo4jConnector {
    ctx: ConnectorContext,
    graph: Option<Graph>,
}

impl Neo4jConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx, graph: None }
    }

    fn graph(&self) -> Result<&Graph> {
        self.graph
            .as_ref()
            .ok_or_else(|| ConnectorError::connection("Neo4j", "not connected"))
    }

    async fn rows(&self, q: Query) -> Result<Vec<Value>> {
        let mut stream = self.graph()?.execute(q).await.map_err(|e| {
            error!("Cypher execution failed: {}", e);
            ConnectorError::query(e)
        })?;

        let mut out = Vec::new();
        while let Some(row) = stream.next().await.map_err(ConnectorError::query)? {
            let record: HashMap<String, BoltType> = row.to().map_err(ConnectorError::query)?;
            let object: Map<String, Value> = record
                .into_iter()
                .map(|(key, value)| (key, bolt_to_json(value)))
                .collect();
            out.push(Value::Object(object));
        }
        Ok(out)
    }
}

#[async_trait]
impl Connectable for Neo4jConnector {
    fn backend(&self) -> BackendType {
        BackendType::Neo4j
    }

    fn is_connected(&self) -> bool {
        self.graph.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        let params = self.ctx.resolve(&NEO4J_SPEC)?;
        let uri = params.require("uri")?;
        debug!("Connecting to Neo4j at {}", uri);

        let mut builder = ConfigBuilder::default()
            .uri(uri)
            .user(params.require("username")?)
            .password(params.require("password")?);
        if let Some(database) = params.get("database") {
            builder = builder.db(database);
        }
        let config = builder.build().map_err(|e| {
            ConnectorError::connection("Neo4j", format!("Failed to build Neo4j config: {}", e))
        })?;

        let timeout = self.ctx.connect_timeout();
        let graph = tokio::time::timeout(timeout, Graph::connect(config))
            .await
            .map_err(|_| {
                ConnectorError::connection("Neo4j", format!("timed out after {:?}", timeout))
            })?
            .map_err(|e| {
                error!("Neo4j connection failed: {}", e);
                ConnectorError::connection("Neo4j", e)
            })?;

        // Bolt handshakes lazily; force a round trip
        let mut check = graph
            .execute(query("RETURN 1 AS ok"))
            .await
            .map_err(|e| ConnectorError::connection("Neo4j", e))?;
        check
            .next()
            .await
            .map_err(|e| ConnectorError::connection("Neo4j", e))?;

        self.graph = Some(graph);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.graph = None;
        Ok(())
    }
}

#[async_trait]
impl Queryable for Neo4jConnector {
    async fn run_query(&mut self, query: &str) -> Result<Value> {
        let q = cypher_query(query)?;
        Ok(Value::Array(self.rows(q).await?))
    }
}

#[async_trait]
impl SchemaIntrospectable for Neo4jConnector {
    /// Property schema per label and relationship type; servers without the
    /// `db.schema.*` procedures only report label and type names.
    async fn fetch_schema(&mut self) -> Result<Value> {
        let properties = async {
            let nodes = self.rows(query(NODE_PROPERTIES_CYPHER)).await?;
            let relationships = self.rows(query(REL_PROPERTIES_CYPHER)).await?;
            Ok::<_, ConnectorError>((nodes, relationships))
        };

        match properties.await {
            Ok((nodes, relationships)) => Ok(json!({
                "nodes": type_properties(&nodes),
                "relationships": type_properties(&relationships),
            })),
            Err(e) => {
                warn!("Neo4j schema procedures unavailable, listing names only: {}", e);
                let labels = self.rows(query("CALL db.labels()")).await?;
                let types = self.rows(query("CALL db.relationshipTypes()")).await?;
                Ok(json!({
                    "node_labels": column(&labels, "label"),
                    "relationship_types": column(&types, "relationshipType"),
                }))
            }
        }
    }
}

/// Cypher text or `{"cypher", "params"}`
fn cypher_query(input: &str) -> Result<Query> {
    match QueryInput::parse(input) {
        QueryInput::Text(cypher) => {
            if cypher.is_empty() {
                return Err(ConnectorError::invalid_request("Query is empty"));
            }
            Ok(query(&cypher))
        }
        QueryInput::Json(value) => {
            let cypher = match value.get("cypher") {
                Some(Value::String(cypher)) if !cypher.trim().is_empty() => cypher,
                _ => {
                    return Err(ConnectorError::invalid_request(
                        "Query must include a 'cypher' field",
                    ))
                }
            };
            let mut q = query(cypher);
            match value.get("params") {
                None | Some(Value::Null) => {}
                Some(Value::Object(params)) => {
                    for (name, param) in params {
                        q = q.param(name, json_to_bolt(param));
                    }
                }
                Some(_) => {
                    return Err(ConnectorError::invalid_request(
                        "Field 'params' must be an object",
                    ))
                }
            }
            Ok(q)
        }
    }
}

/// `{type: {"properties": [...]}}` from procedure rows; label-only rows
/// report a single null property and are kept with no fields
fn type_properties(rows: &[Value]) -> Value {
    let mut types: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for row in rows {
        let Some(name) = row.get("name").and_then(Value::as_str) else {
            continue;
        };
        let properties: Vec<Value> = row
            .get("properties")
            .and_then(Value::as_array)
            .map(|props| {
                props
                    .iter()
                    .filter(|p| p.get("name").is_some_and(|n| !n.is_null()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        types.entry(name.to_string()).or_default().extend(properties);
    }

    let map: Map<String, Value> = types
        .into_iter()
        .map(|(name, properties)| (name, json!({ "properties": properties })))
        .collect();
    Value::Object(map)
}

fn column(rows: &[Value], key: &str) -> Vec<Value> {
    rows.iter().filter_map(|row| row.get(key).cloned()).collect()
}

fn bolt_map_to_json(map: BoltMap) -> Map<String, Value> {
    map.value
        .into_iter()
        .map(|(key, value)| (key.value, bolt_to_json(value)))
        .collect()
}

fn bolt_to_json(value: BoltType) -> Value {
    match value {
        BoltType::Null(_) => Value::Null,
        BoltType::String(s) => Value::String(s.value),
        BoltType::Boolean(b) => Value::Bool(b.value),
        BoltType::Integer(i) => json!(i.value),
        BoltType::Float(f) => json!(f.value),
        BoltType::List(list) => Value::Array(list.value.into_iter().map(bolt_to_json).collect()),
        BoltType::Map(map) => Value::Object(bolt_map_to_json(map)),
        BoltType::Node(node) => {
            let labels: Vec<Value> = node.labels.value.into_iter().map(bolt_to_json).collect();
            let mut object = bolt_map_to_json(node.properties);
            object.insert("_id".to_string(), json!(node.id.value));
            object.insert("_labels".to_string(), Value::Array(labels));
            Value::Object(object)
        }
        BoltType::Relation(rel) => {
            let mut object = bolt_map_to_json(rel.properties);
            object.insert("_id".to_string(), json!(rel.id.value));
            object.insert("_type".to_string(), Value::String(rel.typ.value));
            object.insert("_start".to_string(), json!(rel.start_node_id.value));
            object.insert("_end".to_string(), json!(rel.end_node_id.value));
            Value::Object(object)
        }
        BoltType::UnboundedRelation(rel) => {
            let mut object = bolt_map_to_json(rel.properties);
            object.insert("_id".to_string(), json!(rel.id.value));
            object.insert("_type".to_string(), Value::String(rel.typ.value));
            Value::Object(object)
        }
        BoltType::Path(path) => json!({
            "nodes": path.nodes.value.into_iter().map(bolt_to_json).collect::<Vec<_>>(),
            "relationships": path.rels.value.into_iter().map(bolt_to_json).collect::<Vec<_>>(),
        }),
        BoltType::Point2D(point) => json!({
            "srid": point.sr_id.value,
            "x": point.x.value,
            "y": point.y.value,
        }),
        BoltType::Point3D(point) => json!({
            "srid": point.sr_id.value,
            "x": point.x.value,
            "y": point.y.value,
            "z": point.z.value,
        }),
        BoltType::Bytes(bytes) => Value::Array(bytes.value.iter().map(|b| json!(b)).collect()),
        temporal => temporal_to_json(temporal),
    }
}

/// Dates, times and durations as ISO-8601 strings
fn temporal_to_json(value: BoltType) -> Value {
    let iso = match &value {
        BoltType::Date(_) => NaiveDate::try_from(value.clone())
            .ok()
            .map(|date| date.to_string()),
        BoltType::LocalTime(time) => Some(NaiveTime::from(time).to_string()),
        BoltType::Time(_) => <(NaiveTime, Option<FixedOffset>)>::try_from(value.clone())
            .ok()
            .map(|(time, offset)| match offset {
                Some(offset) => format!("{}{}", time, offset),
                None => time.to_string(),
            }),
        BoltType::LocalDateTime(_) => NaiveDateTime::try_from(value.clone())
            .ok()
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        BoltType::DateTime(_) | BoltType::DateTimeZoneId(_) => {
            DateTime::<FixedOffset>::try_from(value.clone())
                .ok()
                .map(|dt| dt.to_rfc3339())
        }
        BoltType::Duration(_) => std::time::Duration::try_from(value.clone())
            .ok()
            .map(iso_duration),
        _ => None,
    };

    match iso {
        Some(iso) => Value::String(iso),
        None => {
            warn!("Unconvertible Neo4j value, returning its debug form");
            Value::String(format!("{:?}", value))
        }
    }
}

fn iso_duration(duration: std::time::Duration) -> String {
    match duration.subsec_nanos() {
        0 => format!("PT{}S", duration.as_secs()),
        nanos => {
            let fraction = format!("{:09}", nanos);
            format!("PT{}.{}S", duration.as_secs(), fraction.trim_end_matches('0'))
        }
    }
}

fn json_to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull),
        Value::Bool(b) => BoltType::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => BoltType::from(i),
            None => BoltType::from(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => BoltType::from(s.as_str()),
        Value::Array(items) => {
            BoltType::List(BoltList::from(items.iter().map(json_to_bolt).collect::<Vec<_>>()))
        }
        Value::Object(map) => {
            let mut bolt = BoltMap::new();
            for (key, item) in map {
                bolt.put(BoltString::from(key.as_str()), json_to_bolt(item));
            }
            BoltType::Map(bolt)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbbridge_core::{normalize, Connector, Credentials, EntityKind, ErrorKind};
    use neo4rs::{BoltInteger, BoltNode, BoltPath, BoltUnboundedRelation};

    #[test]
    fn test_json_params_round_into_bolt() {
        let bolt = json_to_bolt(&json!({"name": "Ada", "age": 36, "tags": ["x"], "score": 1.5}));
        assert_eq!(
            bolt_to_json(bolt),
            json!({"name": "Ada", "age": 36, "tags": ["x"], "score": 1.5})
        );
        assert_eq!(bolt_to_json(json_to_bolt(&Value::Null)), Value::Null);
    }

    #[test]
    fn test_cypher_input_forms() {
        assert!(cypher_query("MATCH (n) RETURN n LIMIT 1").is_ok());
        assert!(cypher_query(r#"{"cypher": "MATCH (n {name: $name}) RETURN n", "params": {"name": "Ada"}}"#).is_ok());

        let err = cypher_query(r#"{"params": {}}"#).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidOperationRequest);
        let err = cypher_query(r#"{"cypher": "RETURN 1", "params": [1]}"#).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidOperationRequest);
        assert!(cypher_query("   ").is_err());
    }

    #[test]
    fn test_type_properties_normalize() {
        let nodes = vec![
            json!({"name": ":`Person`", "properties": [
                {"name": "name", "types": ["String"]},
                {"name": "born", "types": ["Long"]}
            ]}),
            json!({"name": ":`Empty`", "properties": [{"name": null, "types": null}]}),
        ];
        let rels = vec![json!({"name": ":`ACTED_IN`", "properties": [{"name": "roles", "types": ["StringArray"]}]})];
        let schema = json!({
            "nodes": type_properties(&nodes),
            "relationships": type_properties(&rels),
        });

        let tree = normalize("neo4j", &schema);
        let person = tree.entity("Person").unwrap();
        assert_eq!(person.kind, EntityKind::Node);
        assert_eq!(person.fields.len(), 2);
        assert!(tree.entity("Empty").unwrap().fields.is_empty());
        assert_eq!(tree.entity("ACTED_IN").unwrap().kind, EntityKind::Relationship);
    }

    #[tokio::test]
    async fn test_missing_password_is_reported() {
        let creds = Credentials::new().with("username", "neo4j");
        let mut neo4j = Neo4jConnector::new(ConnectorContext::with_env(
            creds,
            std::sync::Arc::new(HashMap::<String, String>::new()),
        ));
        let result = neo4j.execute_query("RETURN 1").await;
        assert!(!result.success);
        assert_eq!(result.kind, Some(ErrorKind::MissingCredential));
        assert!(!neo4j.is_connected());
    }

    #[test]
    fn test_path_becomes_nodes_and_relationships() {
        let node = |id: i64, name: &str| {
            let mut properties = BoltMap::new();
            properties.put(BoltString::from("name"), BoltType::from(name));
            BoltType::Node(BoltNode::new(
                BoltInteger::new(id),
                BoltList::from(vec![BoltType::from("Person")]),
                properties,
            ))
        };
        let knows = BoltType::UnboundedRelation(BoltUnboundedRelation::new(
            BoltInteger::new(7),
            BoltString::from("KNOWS"),
            BoltMap::new(),
        ));
        let path = BoltType::Path(BoltPath {
            nodes: BoltList::from(vec![node(1, "Ada"), node(2, "Alan")]),
            rels: BoltList::from(vec![knows]),
            indices: BoltList::from(vec![BoltType::from(1i64), BoltType::from(1i64)]),
        });

        assert_eq!(
            bolt_to_json(path),
            json!({
                "nodes": [
                    {"name": "Ada", "_id": 1, "_labels": ["Person"]},
                    {"name": "Alan", "_id": 2, "_labels": ["Person"]}
                ],
                "relationships": [{"_id": 7, "_type": "KNOWS"}]
            })
        );
    }

    #[test]
    fn test_temporal_values_are_iso_strings() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(bolt_to_json(BoltType::from(date)), json!("2024-03-01"));

        let local = date.and_hms_opt(9, 30, 0).unwrap();
        assert_eq!(bolt_to_json(BoltType::from(local)), json!("2024-03-01T09:30:00"));

        let zoned = DateTime::parse_from_rfc3339("2024-03-01T09:30:00+02:00").unwrap();
        assert_eq!(
            bolt_to_json(BoltType::from(zoned)),
            json!("2024-03-01T09:30:00+02:00")
        );

        let duration = std::time::Duration::from_secs(90);
        assert_eq!(bolt_to_json(BoltType::from(duration)), json!("PT90S"));
        assert_eq!(iso_duration(std::time::Duration::from_millis(1500)), "PT1.5S");
    }
}
