//! Schema normalization
//!
//! Connectors return schema in whatever shape their native metadata has:
//! dict-of-tables with dict- or list-of-columns, lists of table objects,
//! namespaces (schemas, databases, keyspaces, buckets) wrapping any of those,
//! and separate node/relationship maps for graph stores. [`normalize`] turns all
//! of them into a flat [`SchemaTree`], inspecting each level for sequence vs
//! mapping rather than trusting the backend family.

use crate::backend::{BackendType, Family};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Table,
    Collection,
    Node,
    Relationship,
    Measurement,
    Unknown,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Table => write!(f, "table"),
            EntityKind::Collection => write!(f, "collection"),
            EntityKind::Node => write!(f, "node"),
            EntityKind::Relationship => write!(f, "relationship"),
            EntityKind::Measurement => write!(f, "measurement"),
            EntityKind::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub foreign_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
}

impl SchemaField {
    fn named(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            primary_key: false,
            foreign_key: false,
            reference: None,
            nullable: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntity {
    pub name: String,
    pub kind: EntityKind,
    pub fields: Vec<SchemaField>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<SchemaField>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaTree {
    pub entities: Vec<SchemaEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SchemaTree {
    pub fn entity(&self, name: &str) -> Option<&SchemaEntity> {
        self.entities.iter().find(|e| e.name == name)
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

const ENTITY_CONTAINERS: &[&str] = &[
    "tables",
    "collections",
    "measurements",
    "hypertables",
    "indices",
    "views",
];
const NAMESPACE_CONTAINERS: &[&str] = &["schemas", "databases", "keyspaces", "buckets", "datasets"];
const NODE_CONTAINERS: &[&str] = &["nodes", "vertices", "vertex_types", "node_labels", "labels"];
const RELATIONSHIP_CONTAINERS: &[&str] = &[
    "relationships",
    "edges",
    "edge_types",
    "relationship_types",
];
const FIELD_CONTAINERS: &[&str] = &[
    "columns",
    "fields",
    "field_keys",
    "attributes",
    "Attributes",
    "properties",
];
const TAG_CONTAINERS: &[&str] = &["tags", "tag_keys"];
/// Keys a single column definition may carry besides its name and type
const COLUMN_ATTRIBUTE_KEYS: &[&str] = &[
    "nullable",
    "is_nullable",
    "primary_key",
    "is_primary_key",
    "pk",
    "foreign_key",
    "reference",
    "references",
    "mode",
    "default",
    "description",
    "is_time_column",
    "ordinal_position",
];
const META_KEYS: &[&str] = &["error", "message", "limited", "warning"];

const ENTITY_NAME_KEYS: &[&str] = &[
    "name",
    "Name",
    "table_name",
    "TableName",
    "collection",
    "index",
    "measurement",
    "label",
    "type",
];
const FIELD_NAME_KEYS: &[&str] = &[
    "name",
    "Name",
    "column_name",
    "field",
    "attributeName",
    "AttributeName",
    "property",
    "key",
];
const FIELD_TYPE_KEYS: &[&str] = &[
    "type",
    "data_type",
    "dataType",
    "column_type",
    "attributeType",
    "AttributeType",
    "types",
    "propertyTypes",
];

/// Normalize a raw schema. Never fails; unknown shapes yield fewer entities.
pub fn normalize(backend: &str, raw: &Value) -> SchemaTree {
    let family = backend.parse::<BackendType>().ok().map(|b| b.family());
    normalize_family(family, raw)
}

pub fn normalize_for(backend: BackendType, raw: &Value) -> SchemaTree {
    normalize_family(Some(backend.family()), raw)
}

fn normalize_family(family: Option<Family>, raw: &Value) -> SchemaTree {
    let walk = Walk {
        default_kind: family.map(family_kind).unwrap_or(EntityKind::Unknown),
    };
    let mut tree = SchemaTree::default();

    match raw {
        Value::Object(map) => {
            tree.error = map.get("error").and_then(value_as_string);
            tree.message = map.get("message").and_then(value_as_string);

            if !walk.object(map, None, &mut tree.entities) {
                let rest: Map<String, Value> = map
                    .iter()
                    .filter(|(k, _)| !META_KEYS.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                walk.entities(&Value::Object(rest), walk.default_kind, None, &mut tree.entities);
            }
        }
        Value::Array(_) => walk.entities(raw, walk.default_kind, None, &mut tree.entities),
        Value::Null => {}
        other => {
            tree.message = Some(format!("Unrecognized schema format: {}", other));
        }
    }

    tree
}

fn family_kind(family: Family) -> EntityKind {
    match family {
        Family::Relational | Family::Warehouse => EntityKind::Table,
        Family::NoSql | Family::Cloud => EntityKind::Collection,
        Family::Graph => EntityKind::Node,
        Family::TimeSeries => EntityKind::Measurement,
    }
}

struct Walk {
    default_kind: EntityKind,
}

impl Walk {
    /// Walk recognized container keys. Returns false when none were present.
    fn object(&self, map: &Map<String, Value>, prefix: Option<&str>, out: &mut Vec<SchemaEntity>) -> bool {
        let mut found = false;
        for (key, value) in map {
            let key = key.as_str();
            if !is_entity_container(value) {
                continue;
            }
            if NODE_CONTAINERS.contains(&key) {
                self.entities(value, EntityKind::Node, prefix, out);
            } else if RELATIONSHIP_CONTAINERS.contains(&key) {
                self.entities(value, EntityKind::Relationship, prefix, out);
            } else if ENTITY_CONTAINERS.contains(&key) {
                self.entities(value, self.default_kind, prefix, out);
            } else if NAMESPACE_CONTAINERS.contains(&key) {
                self.namespaces(value, prefix, out);
            } else {
                continue;
            }
            found = true;
        }
        found
    }

    fn namespaces(&self, value: &Value, prefix: Option<&str>, out: &mut Vec<SchemaEntity>) {
        match value {
            Value::Object(map) => {
                for (ns, inner) in map {
                    let qualified = qualify(prefix, ns);
                    match inner {
                        Value::Object(inner_map) => {
                            if !self.object(inner_map, Some(&qualified), out) {
                                self.entities(inner, self.default_kind, Some(&qualified), out);
                            }
                        }
                        Value::Array(_) => {
                            self.entities(inner, self.default_kind, Some(&qualified), out)
                        }
                        _ => {}
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    if let Value::Object(obj) = item {
                        let qualified = entity_name(obj).map(|ns| qualify(prefix, &ns));
                        self.object(obj, qualified.as_deref().or(prefix), out);
                    }
                }
            }
            _ => {}
        }
    }

    fn entities(&self, value: &Value, kind: EntityKind, prefix: Option<&str>, out: &mut Vec<SchemaEntity>) {
        match value {
            Value::Object(map) => {
                for (name, def) in map {
                    let qualified = qualify(prefix, &clean_name(name, kind));
                    match def {
                        Value::Object(inner) if is_namespace_like(inner) => {
                            self.object(inner, Some(&qualified), out);
                        }
                        _ => out.push(entity(qualified, kind, def, true)),
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::String(name) => {
                            let name = qualify(prefix, &clean_name(name, kind));
                            out.push(entity(name, kind, &Value::Null, false));
                        }
                        Value::Object(obj) => {
                            if let Some(name) = entity_name(obj) {
                                let name = qualify(prefix, &clean_name(&name, kind));
                                out.push(entity(name, kind, item, false));
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
}

fn qualify(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{}.{}", prefix, name),
        _ => name.to_string(),
    }
}

/// Strip Cypher label decoration such as ":`Person`"
fn clean_name(name: &str, kind: EntityKind) -> String {
    match kind {
        EntityKind::Node | EntityKind::Relationship => name
            .split(':')
            .filter(|part| !part.is_empty())
            .map(|part| part.trim_matches('`'))
            .collect::<Vec<_>>()
            .join(":"),
        _ => name.to_string(),
    }
}

fn is_namespace_like(map: &Map<String, Value>) -> bool {
    let has = |keys: &[&str]| {
        keys.iter()
            .any(|k| map.get(*k).is_some_and(is_entity_container))
    };
    let has_fields = FIELD_CONTAINERS
        .iter()
        .any(|k| map.get(*k).is_some_and(is_field_container));
    !has_fields
        && (has(ENTITY_CONTAINERS) || has(NAMESPACE_CONTAINERS) || has(NODE_CONTAINERS)
            || has(RELATIONSHIP_CONTAINERS))
}

/// One column given as a bare type or as an object of column attributes
fn is_column_def(value: &Value) -> bool {
    match value {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => true,
        Value::Object(obj) => {
            FIELD_TYPE_KEYS.iter().any(|k| obj.contains_key(*k))
                && obj.keys().all(|k| {
                    let k = k.as_str();
                    FIELD_TYPE_KEYS.contains(&k)
                        || FIELD_NAME_KEYS.contains(&k)
                        || COLUMN_ATTRIBUTE_KEYS.contains(&k)
                })
        }
        _ => false,
    }
}

/// A list of entities, or a map from entity name to definition. A map of
/// column types is a table that happens to share a container's name.
fn is_entity_container(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.iter().all(|item| match item {
            Value::String(_) => true,
            Value::Object(_) => !is_column_def(item),
            _ => false,
        }),
        Value::Object(map) => map
            .values()
            .all(|def| matches!(def, Value::Object(_) | Value::Array(_)) && !is_column_def(def)),
        _ => false,
    }
}

/// A list of columns, or a map from column name to definition
fn is_field_container(value: &Value) -> bool {
    match value {
        Value::Array(_) => true,
        Value::Object(_) => !is_column_def(value),
        _ => false,
    }
}

fn entity_name(obj: &Map<String, Value>) -> Option<String> {
    ENTITY_NAME_KEYS
        .iter()
        .find_map(|key| obj.get(*key).and_then(value_as_string))
}

/// `keyed` is true when the entity name came from a map key rather than the object itself
fn entity(name: String, kind: EntityKind, def: &Value, keyed: bool) -> SchemaEntity {
    let measurement = kind == EntityKind::Measurement;
    let (fields, tags) = match def {
        Value::Object(obj) if measurement => (entity_fields(obj, keyed, true), tag_fields(obj)),
        Value::Object(obj) => (entity_fields(obj, keyed, false), Vec::new()),
        Value::Array(_) => (fields_from(def), Vec::new()),
        _ => (Vec::new(), Vec::new()),
    };
    SchemaEntity {
        name,
        kind,
        fields,
        tags,
    }
}

fn entity_fields(obj: &Map<String, Value>, keyed: bool, measurement: bool) -> Vec<SchemaField> {
    if let Some(definitions) = obj.get("attribute_definitions") {
        return key_schema_fields(definitions, obj.get("key_schema"));
    }

    if let Some(properties) = obj.get("mappings").and_then(|m| m.get("properties")) {
        return fields_from(properties);
    }

    if let Some(container) = FIELD_CONTAINERS
        .iter()
        .filter_map(|key| obj.get(*key))
        .find(|value| is_field_container(value))
    {
        return fields_from(container);
    }

    if !keyed {
        // Listed entity object without any column listing
        return Vec::new();
    }

    // Dict of columns with the entity as the key
    obj.iter()
        .filter(|(name, _)| !(measurement && TAG_CONTAINERS.contains(&name.as_str())))
        .map(|(name, value)| field_from(name, value))
        .collect()
}

fn tag_fields(obj: &Map<String, Value>) -> Vec<SchemaField> {
    TAG_CONTAINERS
        .iter()
        .filter_map(|key| obj.get(*key))
        .find(|value| is_field_container(value))
        .map(|tags| {
            fields_from(tags)
                .into_iter()
                .map(|mut tag| {
                    if tag.field_type == "unknown" {
                        tag.field_type = "tag".to_string();
                    }
                    tag
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Key attributes come from `key_schema`; the rest of the definitions are plain fields
fn key_schema_fields(definitions: &Value, key_schema: Option<&Value>) -> Vec<SchemaField> {
    let keys: Vec<String> = key_schema
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    item.get("AttributeName")
                        .or_else(|| item.get("attribute_name"))
                        .and_then(value_as_string)
                })
                .collect()
        })
        .unwrap_or_default();

    fields_from(definitions)
        .into_iter()
        .map(|mut field| {
            field.primary_key = keys.contains(&field.name);
            field
        })
        .collect()
}

fn fields_from(container: &Value) -> Vec<SchemaField> {
    match container {
        Value::Object(map) => map
            .iter()
            .map(|(name, value)| field_from(name, value))
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(name) => Some(SchemaField::named(name.as_str(), "unknown")),
                Value::Object(obj) => FIELD_NAME_KEYS
                    .iter()
                    .find_map(|key| obj.get(*key).and_then(value_as_string))
                    .map(|name| field_from(&name, item)),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn field_from(name: &str, value: &Value) -> SchemaField {
    let mut field = SchemaField::named(name, "unknown");

    match value {
        Value::String(t) => field.field_type = t.clone(),
        Value::Array(_) => {
            if let Some(t) = type_name(value) {
                field.field_type = t;
            }
        }
        Value::Object(obj) => {
            if let Some(t) = FIELD_TYPE_KEYS
                .iter()
                .find_map(|key| obj.get(*key).and_then(type_name))
            {
                field.field_type = t;
            } else if obj.contains_key("properties") {
                field.field_type = "object".to_string();
            }

            field.nullable = nullable(obj);
            field.primary_key = ["primary_key", "is_primary_key", "pk"]
                .iter()
                .any(|key| obj.get(*key).map(truthy).unwrap_or(false));

            match obj.get("foreign_key") {
                Some(Value::String(target)) if !target.is_empty() => {
                    field.foreign_key = true;
                    field.reference = Some(target.clone());
                }
                Some(Value::Object(target)) => {
                    field.foreign_key = true;
                    field.reference = reference_of(target);
                }
                Some(other) => field.foreign_key = truthy(other),
                None => {}
            }

            let reference = obj
                .get("reference")
                .or_else(|| obj.get("references"))
                .and_then(|r| match r {
                    Value::Object(target) => reference_of(target),
                    other => value_as_string(other),
                });
            if reference.is_some() {
                field.foreign_key = true;
                field.reference = reference;
            }
        }
        _ => {}
    }

    field
}

fn reference_of(target: &Map<String, Value>) -> Option<String> {
    let table = target
        .get("table")
        .or_else(|| target.get("foreign_table"))
        .and_then(value_as_string)?;
    match target
        .get("column")
        .or_else(|| target.get("foreign_column"))
        .and_then(value_as_string)
    {
        Some(column) => Some(format!("{}.{}", table, column)),
        None => Some(table),
    }
}

fn type_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(obj) => obj
            .get("name")
            .or_else(|| obj.get("Name"))
            .and_then(value_as_string),
        Value::Array(items) => {
            let names: Vec<String> = items.iter().filter_map(type_name).collect();
            (!names.is_empty()).then(|| names.join("|"))
        }
        _ => None,
    }
}

fn nullable(obj: &Map<String, Value>) -> Option<bool> {
    if let Some(value) = obj.get("nullable").or_else(|| obj.get("is_nullable")) {
        return match value {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.to_ascii_uppercase().as_str() {
                "YES" | "TRUE" | "Y" => Some(true),
                "NO" | "FALSE" | "N" => Some(false),
                _ => None,
            },
            _ => None,
        };
    }
    match obj.get("mode").and_then(Value::as_str) {
        Some(mode) if mode.eq_ignore_ascii_case("NULLABLE") => Some(true),
        Some(mode) if mode.eq_ignore_ascii_case("REQUIRED") => Some(false),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().map(|n| n != 0).unwrap_or(false),
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "yes" | "y" | "1"),
        _ => false,
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn content(tree: &SchemaTree) -> BTreeSet<(String, String, String, String)> {
        tree.entities
            .iter()
            .flat_map(|e| {
                e.fields.iter().map(move |f| {
                    (
                        e.name.clone(),
                        e.kind.to_string(),
                        f.name.clone(),
                        f.field_type.clone(),
                    )
                })
            })
            .collect()
    }

    #[test]
    fn test_relational_shapes_agree() {
        let dict_of_dicts = json!({
            "users": { "id": "integer", "email": "text" },
            "orders": { "id": "integer", "user_id": "integer" }
        });
        let dict_of_lists = json!({
            "users": [ {"name": "id", "type": "integer"}, {"name": "email", "type": "text"} ],
            "orders": { "columns": [ {"column_name": "id", "data_type": "integer"}, {"column_name": "user_id", "data_type": "integer"} ] }
        });
        let list_of_lists = json!({
            "tables": [
                { "name": "orders", "columns": [ {"name": "user_id", "type": "integer"}, {"name": "id", "type": "integer"} ] },
                { "name": "users", "columns": [ {"name": "email", "type": "text"}, {"name": "id", "type": "integer"} ] }
            ]
        });
        let bare_list = json!([
            { "table_name": "users", "columns": { "id": "integer", "email": "text" } },
            { "table_name": "orders", "columns": { "id": "integer", "user_id": "integer" } }
        ]);

        let expected = content(&normalize("postgresql", &dict_of_dicts));
        assert_eq!(expected.len(), 4);
        for shape in [dict_of_lists, list_of_lists, bare_list] {
            assert_eq!(content(&normalize("postgresql", &shape)), expected);
        }
    }

    #[test]
    fn test_relational_keys_and_nullability() {
        let raw = json!({
            "tables": [{
                "name": "orders",
                "columns": [
                    {"name": "id", "type": "integer", "primary_key": true, "nullable": false},
                    {"name": "user_id", "type": "integer", "foreign_key": true, "reference": "users.id", "is_nullable": "YES"}
                ]
            }]
        });
        let tree = normalize("mysql", &raw);
        let orders = tree.entity("orders").unwrap();
        assert_eq!(orders.kind, EntityKind::Table);
        assert!(orders.fields[0].primary_key);
        assert_eq!(orders.fields[0].nullable, Some(false));
        assert!(orders.fields[1].foreign_key);
        assert_eq!(orders.fields[1].reference.as_deref(), Some("users.id"));
        assert_eq!(orders.fields[1].nullable, Some(true));
    }

    #[test]
    fn test_namespaces_are_qualified() {
        let raw = json!({
            "schemas": {
                "public": { "tables": [ {"name": "users", "columns": [{"name": "id", "type": "NUMBER"}]} ] },
                "analytics": [ {"name": "events", "columns": [{"name": "ts", "type": "TIMESTAMP_NTZ"}]} ]
            }
        });
        let tree = normalize("snowflake", &raw);
        assert!(tree.entity("public.users").is_some());
        assert_eq!(tree.entity("analytics.events").unwrap().fields[0].field_type, "TIMESTAMP_NTZ");

        let mongo = json!({
            "databases": [
                { "name": "shop", "collections": [ {"name": "carts", "fields": ["_id", "items"]} ] }
            ]
        });
        let tree = normalize("mongodb", &mongo);
        let carts = tree.entity("shop.carts").unwrap();
        assert_eq!(carts.kind, EntityKind::Collection);
        assert_eq!(carts.fields.len(), 2);
    }

    #[test]
    fn test_graph_nodes_and_relationships() {
        let raw = json!({
            "nodes": { ":`Person`": { "properties": { "name": "String", "age": ["Long"] } } },
            "relationships": [ { "type": "KNOWS", "properties": [ {"property": "since", "propertyTypes": ["Date"]} ] } ]
        });
        let tree = normalize("neo4j", &raw);
        let person = tree.entity("Person").unwrap();
        assert_eq!(person.kind, EntityKind::Node);
        assert_eq!(person.fields.len(), 2);
        let knows = tree.entity("KNOWS").unwrap();
        assert_eq!(knows.kind, EntityKind::Relationship);
        assert_eq!(knows.fields[0].field_type, "Date");

        let tiger = json!({
            "vertex_types": [ { "Name": "Account", "Attributes": [ {"AttributeName": "balance", "AttributeType": {"Name": "DOUBLE"}} ] } ],
            "edge_types": [ { "Name": "transfer", "Attributes": [] } ]
        });
        let tree = normalize("tigergraph", &tiger);
        assert_eq!(tree.entity("Account").unwrap().fields[0].field_type, "DOUBLE");
        assert_eq!(tree.entity("transfer").unwrap().kind, EntityKind::Relationship);
    }

    #[test]
    fn test_measurements_keep_fields_and_tags() {
        let raw = json!({
            "buckets": {
                "telemetry": {
                    "measurements": {
                        "cpu": { "fields": ["usage_user", "usage_system"], "tags": ["host", "region"] }
                    }
                }
            }
        });
        let tree = normalize("influxdb", &raw);
        let cpu = tree.entity("telemetry.cpu").unwrap();
        assert_eq!(cpu.kind, EntityKind::Measurement);
        assert_eq!(cpu.fields.len(), 2);
        assert_eq!(cpu.tags.len(), 2);
        assert_eq!(cpu.tags[0].field_type, "tag");
    }

    #[test]
    fn test_dynamodb_key_schema() {
        let raw = json!({
            "tables": [{
                "name": "orders",
                "key_schema": [ {"AttributeName": "pk", "KeyType": "HASH"} ],
                "attribute_definitions": [
                    {"AttributeName": "pk", "AttributeType": "S"},
                    {"AttributeName": "created", "AttributeType": "N"}
                ]
            }]
        });
        let tree = normalize("dynamodb", &raw);
        let orders = tree.entity("orders").unwrap();
        assert!(orders.fields[0].primary_key);
        assert!(!orders.fields[1].primary_key);
        assert_eq!(orders.fields[1].field_type, "N");
    }

    #[test]
    fn test_elasticsearch_mappings() {
        let raw = json!({
            "indices": { "logs": { "mappings": { "properties": {
                "message": {"type": "text"},
                "http": {"properties": {"status": {"type": "long"}}}
            } } } }
        });
        let tree = normalize("elasticsearch", &raw);
        let logs = tree.entity("logs").unwrap();
        assert_eq!(logs.kind, EntityKind::Collection);
        assert_eq!(logs.fields.len(), 2);
        assert!(logs.fields.iter().any(|f| f.name == "http" && f.field_type == "object"));
    }

    #[test]
    fn test_bigquery_mode() {
        let raw = json!({
            "datasets": { "sales": { "tables": { "orders": { "columns": [
                {"name": "id", "type": "INTEGER", "mode": "REQUIRED"},
                {"name": "note", "type": "STRING", "mode": "NULLABLE"}
            ] } } } }
        });
        let tree = normalize("bigquery", &raw);
        let orders = tree.entity("sales.orders").unwrap();
        assert_eq!(orders.fields[0].nullable, Some(false));
        assert_eq!(orders.fields[1].nullable, Some(true));
    }

    #[test]
    fn test_markers_and_degenerate_input() {
        let tree = normalize("cosmosdb", &json!({"limited": true, "message": "limited"}));
        assert!(tree.entities.is_empty());
        assert_eq!(tree.message.as_deref(), Some("limited"));

        let tree = normalize("postgresql", &json!({"error": "Error getting schema: boom"}));
        assert!(tree.entities.is_empty());
        assert!(tree.error.is_some());

        for raw in [json!(null), json!(42), json!("text"), json!([1, 2, null]), json!({"a": 1})] {
            let _ = normalize("redis", &raw);
        }
    }

    #[test]
    fn test_unknown_backend_uses_unknown_kind() {
        let tree = normalize("not_a_real_db", &json!({"things": {"a": "int"}}));
        assert_eq!(tree.entity("things").unwrap().kind, EntityKind::Unknown);
        assert_eq!(tree.entity("things").unwrap().fields[0].field_type, "int");
    }

    #[test]
    fn test_columns_named_like_containers_survive() {
        let dict_of_dicts = json!({
            "posts": { "id": "integer", "tags": "text", "title": "text" },
            "products": { "id": "integer", "properties": "jsonb", "columns": {"type": "text[]"} }
        });
        let list_of_lists = json!({
            "tables": [
                { "name": "posts", "columns": [
                    {"name": "id", "type": "integer"}, {"name": "tags", "type": "text"}, {"name": "title", "type": "text"}
                ] },
                { "name": "products", "columns": [
                    {"name": "id", "type": "integer"}, {"name": "properties", "type": "jsonb"}, {"name": "columns", "type": "text[]"}
                ] }
            ]
        });

        let expected = content(&normalize("postgresql", &list_of_lists));
        assert_eq!(expected.len(), 6);
        assert_eq!(content(&normalize("postgresql", &dict_of_dicts)), expected);
        assert!(normalize("postgresql", &dict_of_dicts)
            .entity("posts")
            .unwrap()
            .tags
            .is_empty());
    }

    #[test]
    fn test_tables_named_like_containers_survive() {
        let raw = json!({
            "users": { "id": "integer" },
            "labels": { "id": "integer", "name": "text" },
            "nodes": { "id": { "type": "integer", "nullable": false } }
        });
        let tree = normalize("postgresql", &raw);
        assert_eq!(tree.entities.len(), 3);
        for name in ["users", "labels", "nodes"] {
            assert_eq!(tree.entity(name).unwrap().kind, EntityKind::Table);
        }
        assert_eq!(tree.entity("labels").unwrap().fields.len(), 2);
        assert_eq!(tree.entity("nodes").unwrap().fields[0].nullable, Some(false));

        let nested = json!({ "schemas": { "public": { "tables": { "id": "uuid" }, "users": { "id": "integer" } } } });
        let tree = normalize("snowflake", &nested);
        assert_eq!(tree.entity("public.tables").unwrap().fields[0].field_type, "uuid");
        assert!(tree.entity("public.users").is_some());
    }
}
