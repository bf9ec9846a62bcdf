use serde::Serialize;
use serde_json::Value as Json;
use std::collections::BTreeMap;

use crate::schema::{Value, lookup};

/// A cached row: one provider entity of one kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    pub kind: String,
    pub id: String,
    pub name: String,
    /// 1 on insert, incremented by every update.
    pub revision: i64,
    /// Provider document, JSON text.
    pub object: String,
    /// Change-detection column values.
    pub columns: BTreeMap<String, Value>,
}

impl Resource {
    /// Decode the stored document.
    pub fn document(&self) -> Result<Json, serde_json::Error> {
        serde_json::from_str(&self.object)
    }

    /// Deep equality of the documents, ignoring key order and formatting.
    /// An undecodable side never compares equal.
    pub fn same_document(&self, other: &Resource) -> bool {
        match (self.document(), other.document()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// Names of change-detection columns whose values differ.
    pub fn changed_columns(&self, other: &Resource) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|(name, value)| other.columns.get(name.as_str()) != Some(*value))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Value of a field: fixed columns, declared columns, then the
    /// document itself (dotted paths allowed).
    pub fn field(&self, field: &str, doc: Option<&Json>) -> Value {
        match field {
            "id" => Value::Text(self.id.clone()),
            "name" => Value::Text(self.name.clone()),
            "revision" => Value::Int(self.revision),
            _ => match self.columns.get(field) {
                Some(v) => v.clone(),
                None => doc
                    .and_then(|d| lookup(d, field))
                    .map(Value::from_json)
                    .unwrap_or(Value::Null),
            },
        }
    }
}
