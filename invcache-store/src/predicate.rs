//! List predicates.
//!
//! A predicate over `id`, `name`, `revision` and declared columns only is
//! compiled to SQL. Anything that references the document body is
//! evaluated after decoding each row.

use serde_json::Value as Json;
use std::cmp::Ordering;

use crate::resource::Resource;
use crate::schema::{KindSpec, Value, quote};

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, Value),
    Neq(String, Value),
    Gt(String, Value),
    Lt(String, Value),
    In(String, Vec<Value>),
    /// Substring match on a text field.
    Contains(String, String),
    /// Prefix match on a text field.
    Prefix(String, String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Predicate::Eq(field.to_string(), value.into())
    }

    pub fn neq(field: &str, value: impl Into<Value>) -> Self {
        Predicate::Neq(field.to_string(), value.into())
    }

    pub fn gt(field: &str, value: impl Into<Value>) -> Self {
        Predicate::Gt(field.to_string(), value.into())
    }

    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Predicate::Lt(field.to_string(), value.into())
    }

    pub fn contains(field: &str, needle: &str) -> Self {
        Predicate::Contains(field.to_string(), needle.to_string())
    }

    pub fn prefix(field: &str, prefix: &str) -> Self {
        Predicate::Prefix(field.to_string(), prefix.to_string())
    }

    /// Conjunction; collapses to the single element when there is one.
    pub fn all(mut predicates: Vec<Predicate>) -> Option<Self> {
        match predicates.len() {
            0 => None,
            1 => predicates.pop(),
            _ => Some(Predicate::And(predicates)),
        }
    }

    /// Whether every referenced field is a SQL column of the kind.
    pub fn is_sql(&self, spec: &KindSpec) -> bool {
        match self {
            Predicate::Eq(f, _)
            | Predicate::Neq(f, _)
            | Predicate::Gt(f, _)
            | Predicate::Lt(f, _)
            | Predicate::In(f, _)
            | Predicate::Contains(f, _)
            | Predicate::Prefix(f, _) => spec.has_field(f),
            Predicate::And(ps) | Predicate::Or(ps) => ps.iter().all(|p| p.is_sql(spec)),
            Predicate::Not(p) => p.is_sql(spec),
        }
    }

    /// Render as a SQL condition, pushing bind arguments in order.
    /// Returns `None` when a field is not a column.
    pub(crate) fn to_sql(&self, spec: &KindSpec, args: &mut Vec<Value>) -> Option<String> {
        if !self.is_sql(spec) {
            return None;
        }
        Some(self.render(args))
    }

    fn render(&self, args: &mut Vec<Value>) -> String {
        match self {
            Predicate::Eq(f, Value::Null) => format!("{} IS NULL", quote(f)),
            Predicate::Neq(f, Value::Null) => format!("{} IS NOT NULL", quote(f)),
            Predicate::Eq(f, v) => {
                args.push(v.clone());
                format!("{} = ?", quote(f))
            }
            Predicate::Neq(f, v) => {
                args.push(v.clone());
                format!("({} IS NULL OR {} != ?)", quote(f), quote(f))
            }
            Predicate::Gt(f, v) => {
                args.push(v.clone());
                format!("{} > ?", quote(f))
            }
            Predicate::Lt(f, v) => {
                args.push(v.clone());
                format!("{} < ?", quote(f))
            }
            Predicate::In(_, values) if values.is_empty() => "0".to_string(),
            Predicate::In(f, values) => {
                args.extend(values.iter().cloned());
                let marks = vec!["?"; values.len()].join(", ");
                format!("{} IN ({})", quote(f), marks)
            }
            // instr() and substr() are case-sensitive, LIKE is not.
            Predicate::Contains(f, needle) => {
                args.push(Value::Text(needle.clone()));
                format!("instr({}, ?) > 0", quote(f))
            }
            Predicate::Prefix(f, prefix) => {
                args.push(Value::Int(prefix.chars().count() as i64));
                args.push(Value::Text(prefix.clone()));
                format!("substr({}, 1, ?) = ?", quote(f))
            }
            Predicate::And(ps) if ps.is_empty() => "1".to_string(),
            Predicate::Or(ps) if ps.is_empty() => "0".to_string(),
            Predicate::And(ps) => join(ps, " AND ", args),
            Predicate::Or(ps) => join(ps, " OR ", args),
            Predicate::Not(p) => format!("NOT ({})", p.render(args)),
        }
    }

    /// Evaluate against a decoded row.
    pub fn matches(&self, resource: &Resource, doc: Option<&Json>) -> bool {
        let field = |f: &str| resource.field(f, doc);
        match self {
            Predicate::Eq(f, v) => field(f).compare(v) == Some(Ordering::Equal),
            Predicate::Neq(f, v) => field(f).compare(v) != Some(Ordering::Equal),
            Predicate::Gt(f, v) => field(f).compare(v) == Some(Ordering::Greater),
            Predicate::Lt(f, v) => field(f).compare(v) == Some(Ordering::Less),
            Predicate::In(f, values) => {
                let actual = field(f);
                values
                    .iter()
                    .any(|v| actual.compare(v) == Some(Ordering::Equal))
            }
            Predicate::Contains(f, needle) => field(f)
                .as_str()
                .is_some_and(|s| s.contains(needle.as_str())),
            Predicate::Prefix(f, prefix) => field(f)
                .as_str()
                .is_some_and(|s| s.starts_with(prefix.as_str())),
            Predicate::And(ps) => ps.iter().all(|p| p.matches(resource, doc)),
            Predicate::Or(ps) => ps.iter().any(|p| p.matches(resource, doc)),
            Predicate::Not(p) => !p.matches(resource, doc),
        }
    }
}

fn join(predicates: &[Predicate], separator: &str, args: &mut Vec<Value>) -> String {
    let parts: Vec<String> = predicates
        .iter()
        .map(|p| format!("({})", p.render(args)))
        .collect();
    parts.join(separator)
}
