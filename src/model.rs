//! # Data Model
//!
//! Core data structures for hierarchical upserts: dimension keys, typed metric
//! values, table schemas, and the flattened rows produced during a flush.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// A dimension value. Part of a row's identity, so it must hash and compare.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Key {
    Int(i64),
    Text(String),
}

impl Key {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::Text(s) => Some(s),
            Key::Int(_) => None,
        }
    }

    /// Integers and strings are valid keys; anything else is not an identity.
    pub fn from_json(value: &serde_json::Value) -> Option<Key> {
        match value {
            serde_json::Value::String(s) => Some(Key::Text(s.clone())),
            serde_json::Value::Number(n) => n.as_i64().map(Key::Int),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(v) => write!(f, "{v}"),
            Key::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Text(value)
    }
}

impl From<&String> for Key {
    fn from(value: &String) -> Self {
        Key::Text(value.clone())
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Key::Int(value as i64)
    }
}

impl From<u32> for Key {
    fn from(value: u32) -> Self {
        Key::Int(value as i64)
    }
}

/// A metric value in its natural type. Formatting is left to the store.
///
/// `Null` is the explicit absence marker and never equals `Int(0)`,
/// `Float(0.0)` or `Text("")`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the value. Numeric text is parsed since most sources
    /// deliver observations as strings.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            Value::Null | Value::Bool(_) => None,
        }
    }
}

impl Value {
    /// Converts a JSON scalar. Arrays and objects have no metric form.
    pub fn from_json(value: &serde_json::Value) -> Option<Value> {
        match value {
            serde_json::Value::Null => Some(Value::Null),
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Value::Int(i)),
                None => n.as_f64().map(Value::Float),
            },
            serde_json::Value::String(s) => Some(Value::Text(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<&Key> for Value {
    fn from(key: &Key) -> Self {
        match key {
            Key::Int(v) => Value::Int(*v),
            Key::Text(s) => Value::Text(s.clone()),
        }
    }
}

/// Longest field name a schema accepts, in bytes. Store keys length-prefix
/// field names with a `u16`.
pub const MAX_FIELD_NAME_LEN: usize = u16::MAX as usize;

/// Table layout shared by the accumulator and the store.
///
/// Dimensions are ordered and define the nesting order of the record tree.
/// Metrics keep their declared order, which is also the insert column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    table: String,
    dimensions: Vec<String>,
    metrics: Vec<String>,
}

impl TableSchema {
    pub fn new<D, M>(table: impl Into<String>, dimensions: D, metrics: M) -> Result<Self>
    where
        D: IntoIterator,
        D::Item: Into<String>,
        M: IntoIterator,
        M::Item: Into<String>,
    {
        let table = table.into();
        let dimensions: Vec<String> = dimensions.into_iter().map(Into::into).collect();
        let metrics: Vec<String> = metrics.into_iter().map(Into::into).collect();

        if table.is_empty() {
            bail!("table name must not be empty");
        }
        if dimensions.is_empty() {
            bail!("table {table} needs at least one dimension");
        }
        let mut seen = HashSet::new();
        for field in dimensions.iter().chain(metrics.iter()) {
            if field.is_empty() {
                bail!("table {table} has an empty field name");
            }
            if field.len() > MAX_FIELD_NAME_LEN {
                bail!(
                    "table {table} has a field name of {} bytes, the limit is {MAX_FIELD_NAME_LEN}",
                    field.len()
                );
            }
            if !seen.insert(field.as_str()) {
                bail!("table {table} declares field {field} more than once");
            }
        }

        Ok(Self {
            table,
            dimensions,
            metrics,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn dimensions(&self) -> &[String] {
        &self.dimensions
    }

    pub fn metrics(&self) -> &[String] {
        &self.metrics
    }

    pub fn depth(&self) -> usize {
        self.dimensions.len()
    }

    pub fn has_metric(&self, name: &str) -> bool {
        self.metrics.iter().any(|m| m == name)
    }

    /// Dimensions plus metrics; the number of placeholders one row occupies.
    pub fn field_count(&self) -> usize {
        self.dimensions.len() + self.metrics.len()
    }

    /// Column names in insert order: dimensions, then metrics.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.dimensions
            .iter()
            .chain(self.metrics.iter())
            .map(String::as_str)
    }

    /// Equality predicate over every dimension of `row`.
    pub fn identity_predicate(&self, row: &Row) -> Predicate {
        Predicate::new(
            self.dimensions
                .iter()
                .cloned()
                .zip(row.dimensions.iter().cloned())
                .collect(),
        )
    }

    /// Assignments for every declared metric of `row`, nulls included.
    pub fn metric_assignments(&self, row: &Row) -> Vec<Assignment> {
        self.metrics
            .iter()
            .map(|name| Assignment {
                field: name.clone(),
                value: row.metrics.get(name).cloned().unwrap_or_default(),
            })
            .collect()
    }
}

/// One root-to-leaf path of the record tree, flattened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Dimension values in dimension order.
    pub dimensions: Vec<Key>,
    /// Every declared metric, null-filled.
    pub metrics: BTreeMap<String, Value>,
}

impl Row {
    pub fn new(dimensions: Vec<Key>, metrics: BTreeMap<String, Value>) -> Self {
        Self {
            dimensions,
            metrics,
        }
    }

    pub fn metric(&self, name: &str) -> Option<&Value> {
        self.metrics.get(name)
    }

    /// `dim=value` pairs, used to name the row in logs and failure reports.
    pub fn identity(&self, schema: &TableSchema) -> String {
        schema
            .dimensions()
            .iter()
            .zip(self.dimensions.iter())
            .map(|(name, key)| format!("{name}={key}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Values in the schema's column order.
    pub fn values(&self, schema: &TableSchema) -> Vec<Value> {
        let mut values: Vec<Value> = self.dimensions.iter().map(Value::from).collect();
        values.extend(
            schema
                .metrics()
                .iter()
                .map(|name| self.metrics.get(name).cloned().unwrap_or_default()),
        );
        values
    }
}

/// The unit of work a record source yields: set `metric` at `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    pub path: Vec<Key>,
    pub metric: String,
    pub value: Value,
}

impl Triple {
    pub fn new(path: Vec<Key>, metric: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            path,
            metric: metric.into(),
            value: value.into(),
        }
    }
}

/// Ordered equality predicate: every `(field, key)` pair must match.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Predicate {
    pub terms: Vec<(String, Key)>,
}

impl Predicate {
    pub fn new(terms: Vec<(String, Key)>) -> Self {
        Self { terms }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&Key> {
        self.terms
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, key)| key)
    }
}

/// `field = value` for an update. Values stay typed all the way to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub field: String,
    pub value: Value,
}

impl Assignment {
    pub fn new(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn economy() -> TableSchema {
        TableSchema::new("economy", ["date"], ["unemployment", "gdp"]).unwrap()
    }

    #[test]
    fn test_schema_rejects_missing_dimensions() {
        let empty: [&str; 0] = [];
        assert!(TableSchema::new("economy", empty, ["gdp"]).is_err());
    }

    #[test]
    fn test_schema_rejects_duplicate_fields() {
        assert!(TableSchema::new("economy", ["date"], ["gdp", "gdp"]).is_err());
        assert!(TableSchema::new("economy", ["date"], ["date"]).is_err());
    }

    #[test]
    fn test_schema_rejects_oversized_field_name() {
        let long = "m".repeat(MAX_FIELD_NAME_LEN + 1);
        assert!(TableSchema::new("economy", ["date"], [long.as_str()]).is_err());
        assert!(TableSchema::new("economy", [long.as_str()], ["gdp"]).is_err());

        let longest = "m".repeat(MAX_FIELD_NAME_LEN);
        assert!(TableSchema::new("economy", ["date"], [longest.as_str()]).is_ok());
    }

    #[test]
    fn test_field_count_and_columns() {
        let schema = economy();
        assert_eq!(schema.field_count(), 3);
        let columns: Vec<&str> = schema.columns().collect();
        assert_eq!(columns, vec!["date", "unemployment", "gdp"]);
    }

    #[test]
    fn test_null_is_distinct_from_zero_and_empty() {
        assert_ne!(Value::Null, Value::Int(0));
        assert_ne!(Value::Null, Value::Float(0.0));
        assert_ne!(Value::Null, Value::Text(String::new()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn test_numeric_text_parses() {
        assert_eq!(Value::from("3.5").as_f64(), Some(3.5));
        assert_eq!(Value::from(".").as_f64(), None);
        assert_eq!(Value::Null.as_f64(), None);
    }

    #[test]
    fn test_row_values_follow_column_order() {
        let schema = economy();
        let mut metrics = BTreeMap::new();
        metrics.insert("unemployment".to_string(), Value::from("3.5"));
        metrics.insert("gdp".to_string(), Value::Null);
        let row = Row::new(vec![Key::from("2020-01-01")], metrics);

        assert_eq!(
            row.values(&schema),
            vec![Value::from("2020-01-01"), Value::from("3.5"), Value::Null]
        );
        assert_eq!(row.identity(&schema), "date=2020-01-01");
    }

    #[test]
    fn test_identity_predicate_covers_every_dimension() {
        let schema = TableSchema::new("ipmetrics", ["industryCode", "date"], ["laborCostMil"])
            .unwrap();
        let row = Row::new(
            vec![Key::from("3111"), Key::from("2012-01-01")],
            BTreeMap::new(),
        );
        let predicate = schema.identity_predicate(&row);
        assert_eq!(predicate.terms.len(), 2);
        assert_eq!(predicate.get("date"), Some(&Key::from("2012-01-01")));
    }
}
