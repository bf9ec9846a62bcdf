//! Table layout of a provider cache.
//!
//! Every kind is stored in its own table with the fixed columns
//! `id`, `name`, `revision` and `object`, plus the change-detection
//! columns declared here. Declared columns are indexed so predicates
//! over them run in SQL.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::error::{Result, StoreError};
use crate::resource::Resource;

/// Scalar value of a column or predicate operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Convert a JSON scalar. Arrays and objects have no scalar form.
    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            Json::String(s) => Value::Text(s.clone()),
            Json::Array(_) | Json::Object(_) => Value::Null,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Ordering between comparable values. Integers and floats compare
    /// numerically; mismatched types are unordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Text,
    Bool,
}

impl ColumnType {
    fn sql(self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Bool => "INTEGER",
            ColumnType::Text => "TEXT",
        }
    }
}

/// A change-detection column and the document keys it is read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    /// Candidate document paths, first present one wins.
    pub sources: Vec<String>,
}

impl Column {
    pub fn new(name: &str, ty: ColumnType, sources: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            ty,
            sources: sources.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn integer(name: &str, sources: &[&str]) -> Self {
        Self::new(name, ColumnType::Integer, sources)
    }

    pub fn text(name: &str, sources: &[&str]) -> Self {
        Self::new(name, ColumnType::Text, sources)
    }

    pub fn boolean(name: &str, sources: &[&str]) -> Self {
        Self::new(name, ColumnType::Bool, sources)
    }

    /// Extract and coerce the column value from a document.
    pub fn extract(&self, doc: &Json) -> Value {
        let Some(raw) = self.sources.iter().find_map(|path| lookup(doc, path)) else {
            return Value::Null;
        };
        match (self.ty, raw) {
            (ColumnType::Integer, Json::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Value::Int)
                .unwrap_or(Value::Null),
            (ColumnType::Integer, Json::String(s)) => {
                s.parse().map(Value::Int).unwrap_or(Value::Null)
            }
            (ColumnType::Bool, Json::Bool(b)) => Value::Bool(*b),
            (ColumnType::Text, Json::String(s)) => Value::Text(s.clone()),
            (ColumnType::Text, Json::Number(n)) => Value::Text(n.to_string()),
            (ColumnType::Text, Json::Bool(b)) => Value::Text(b.to_string()),
            _ => Value::Null,
        }
    }
}

/// Resolve a dotted path inside a JSON document.
pub fn lookup<'a>(doc: &'a Json, path: &str) -> Option<&'a Json> {
    path.split('.').try_fold(doc, |node, key| match node {
        Json::Object(map) => map.get(key),
        Json::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Why an upstream document could not become a resource.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("document is not an object")]
    NotObject,
    #[error("document has no string id")]
    MissingId,
    #[error("document {0} has no string name")]
    MissingName(String),
}

/// Layout of one kind's table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindSpec {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<Column>,
}

impl KindSpec {
    pub fn new(name: &str, columns: Vec<Column>) -> Self {
        Self {
            name: name.to_string(),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether a predicate field maps to a real SQL column.
    pub fn has_field(&self, field: &str) -> bool {
        matches!(field, "id" | "name" | "revision") || self.column(field).is_some()
    }

    /// Build a resource from an upstream document. The document body is
    /// kept verbatim; `id` and `name` must be strings.
    pub fn resource(&self, doc: &Json) -> std::result::Result<Resource, DocumentError> {
        let map = doc.as_object().ok_or(DocumentError::NotObject)?;
        let id = map
            .get("id")
            .and_then(Json::as_str)
            .filter(|id| !id.is_empty())
            .ok_or(DocumentError::MissingId)?;
        let name = map
            .get("name")
            .and_then(Json::as_str)
            .ok_or_else(|| DocumentError::MissingName(id.to_string()))?;
        let columns: BTreeMap<String, Value> = self
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.extract(doc)))
            .collect();

        Ok(Resource {
            kind: self.name.clone(),
            id: id.to_string(),
            name: name.to_string(),
            revision: 0,
            object: doc.to_string(),
            columns,
        })
    }

    pub(crate) fn select_list(&self, with_object: bool) -> String {
        let mut fields = vec![
            "id".to_string(),
            "name".to_string(),
            "revision".to_string(),
            if with_object {
                "object".to_string()
            } else {
                "'null' AS object".to_string()
            },
        ];
        fields.extend(self.columns.iter().map(|c| quote(&c.name)));
        fields.join(", ")
    }

    pub(crate) fn ddl(&self) -> Vec<String> {
        let table = quote(&self.name);
        let mut columns = vec![
            "id TEXT PRIMARY KEY NOT NULL".to_string(),
            "name TEXT NOT NULL".to_string(),
            "revision INTEGER NOT NULL".to_string(),
            "object TEXT NOT NULL".to_string(),
        ];
        columns.extend(
            self.columns
                .iter()
                .map(|c| format!("{} {}", quote(&c.name), c.ty.sql())),
        );

        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            table,
            columns.join(", ")
        )];
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (name)",
            quote(&format!("{}_name", self.name)),
            table
        ));
        for c in &self.columns {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote(&format!("{}_{}", self.name, c.name)),
                table,
                quote(&c.name)
            ));
        }
        statements
    }
}

/// The set of kinds cached for one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub kinds: Vec<KindSpec>,
}

impl Schema {
    pub fn new(kinds: Vec<KindSpec>) -> Self {
        Self { kinds }
    }

    pub fn kind(&self, name: &str) -> Result<&KindSpec> {
        self.kinds
            .iter()
            .find(|k| k.name == name)
            .ok_or_else(|| StoreError::UnknownKind(name.to_string()))
    }

    /// Reject names that cannot be used as SQL identifiers.
    pub fn validate(&self) -> Result<()> {
        for kind in &self.kinds {
            if !is_identifier(&kind.name) {
                return Err(StoreError::InvalidSchema(format!(
                    "kind name {:?}",
                    kind.name
                )));
            }
            for c in &kind.columns {
                if !is_identifier(&c.name) || kind.has_fixed(&c.name) {
                    return Err(StoreError::InvalidSchema(format!(
                        "column {:?} of {}",
                        c.name, kind.name
                    )));
                }
            }
        }
        let mut names: Vec<&str> = self.kinds.iter().map(|k| k.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(StoreError::InvalidSchema("duplicate kind".to_string()));
        }
        Ok(())
    }
}

impl KindSpec {
    fn has_fixed(&self, name: &str) -> bool {
        matches!(name, "id" | "name" | "revision" | "object")
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

pub(crate) fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier)
}
