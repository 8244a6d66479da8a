//! Shapes shared by the SQL connectors' results and schema output

use dbbridge_core::sql::is_read_statement;
use serde_json::{json, Map, Value};

/// One column row from an information-schema style catalog query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnInfo {
    pub schema: Option<String>,
    pub table: String,
    pub name: String,
    pub data_type: String,
    pub nullable: Option<bool>,
    pub primary_key: bool,
    /// `table.column` this column references
    pub reference: Option<String>,
}

impl ColumnInfo {
    fn to_json(&self) -> Value {
        let mut column = Map::new();
        column.insert("name".into(), json!(self.name));
        column.insert("type".into(), json!(self.data_type));
        if let Some(nullable) = self.nullable {
            column.insert("nullable".into(), json!(nullable));
        }
        column.insert("primary_key".into(), json!(self.primary_key));
        column.insert("foreign_key".into(), json!(self.reference.is_some()));
        if let Some(reference) = &self.reference {
            column.insert("reference".into(), json!(reference));
        }
        Value::Object(column)
    }
}

/// `{"tables": [{"name", "columns": [...]}]}`, keeping catalog order
///
/// Tables outside `default_schema` are named `schema.table`.
pub fn tables_value(columns: &[ColumnInfo], default_schema: Option<&str>) -> Value {
    let mut tables: Vec<(String, Vec<Value>)> = Vec::new();
    for column in columns {
        let name = match (&column.schema, default_schema) {
            (Some(schema), Some(default)) if schema.eq_ignore_ascii_case(default) => {
                column.table.clone()
            }
            (Some(schema), _) => format!("{}.{}", schema, column.table),
            (None, _) => column.table.clone(),
        };
        push_column(&mut tables, name, column.to_json());
    }

    json!({
        "tables": tables
            .into_iter()
            .map(|(name, columns)| json!({ "name": name, "columns": columns }))
            .collect::<Vec<_>>()
    })
}

/// `{"schemas": {"<schema>": {"tables": [...]}}}` for warehouse-style output
pub fn schemas_value(columns: &[ColumnInfo]) -> Value {
    let mut schemas: Vec<(String, Vec<(String, Vec<Value>)>)> = Vec::new();
    for column in columns {
        let schema = column.schema.clone().unwrap_or_default();
        let idx = match schemas.iter().position(|(name, _)| *name == schema) {
            Some(idx) => idx,
            None => {
                schemas.push((schema, Vec::new()));
                schemas.len() - 1
            }
        };
        push_column(&mut schemas[idx].1, column.table.clone(), column.to_json());
    }

    let mut out = Map::new();
    for (schema, tables) in schemas {
        let tables: Vec<Value> = tables
            .into_iter()
            .map(|(name, columns)| json!({ "name": name, "columns": columns }))
            .collect();
        out.insert(schema, json!({ "tables": tables }));
    }
    json!({ "schemas": out })
}

fn push_column(tables: &mut Vec<(String, Vec<Value>)>, table: String, column: Value) {
    match tables.last_mut() {
        Some((name, columns)) if *name == table => columns.push(column),
        _ => match tables.iter_mut().find(|(name, _)| *name == table) {
            Some((_, columns)) => columns.push(column),
            None => tables.push((table, vec![column])),
        },
    }
}

/// Result of a write statement
pub fn affected_rows(count: u64) -> Value {
    json!({ "affected_rows": count })
}

/// Folds a multi-statement result stream into one value
///
/// The last read statement's rows win; when there is none, the write counts
/// are summed into `affected_rows`.
#[derive(Debug, Default)]
pub struct BatchResult {
    reads: Vec<bool>,
    position: usize,
    current: Vec<Value>,
    last_rows: Option<Vec<Value>>,
    affected: u64,
}

impl BatchResult {
    pub fn new(statements: &[String]) -> Self {
        Self {
            reads: statements.iter().map(|s| is_read_statement(s)).collect(),
            ..Self::default()
        }
    }

    pub fn row(&mut self, row: Value) {
        self.current.push(row);
    }

    /// Marks the end of the current statement
    pub fn statement_done(&mut self, affected: u64) {
        let read = self
            .reads
            .get(self.position)
            .copied()
            .unwrap_or(!self.current.is_empty());
        if read {
            self.last_rows = Some(std::mem::take(&mut self.current));
        } else {
            self.current.clear();
            self.affected += affected;
        }
        self.position += 1;
    }

    pub fn finish(self) -> Value {
        match self.last_rows {
            Some(rows) => Value::Array(rows),
            None => affected_rows(self.affected),
        }
    }
}

/// `"YES"` / `"NO"` catalog flags
pub fn yes_no(value: &str) -> Option<bool> {
    match value.trim().to_ascii_uppercase().as_str() {
        "YES" | "Y" | "TRUE" | "1" => Some(true),
        "NO" | "N" | "FALSE" | "0" => Some(false),
        _ => None,
    }
}
