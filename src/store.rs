//! # Store Module
//!
//! The persistent-store seam: a connector hands out exclusively-owned
//! connections, and a connection answers equality reads, metric updates, and
//! bulk inserts. Also provides an in-memory table store.

use crate::model::{Assignment, Key, Predicate, Row, TableSchema, Value};
use anyhow::{anyhow, bail, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Scoped store acquisition. A connection is released when dropped, so every
/// exit path of its owner closes it.
pub trait StoreConnector {
    type Connection: StoreConnection;

    fn connect(&self) -> Result<Self::Connection>;
}

/// Operations one flush issues against the store.
pub trait StoreConnection {
    /// Number of rows in `table` matching every predicate term.
    fn count_matching(&mut self, table: &str, predicate: &Predicate) -> Result<usize>;

    /// Apply `assignments` to every matching row and return how many matched.
    fn update_matching(
        &mut self,
        table: &str,
        predicate: &Predicate,
        assignments: &[Assignment],
    ) -> Result<usize>;

    /// Insert `rows` as one atomic statement.
    fn insert_batch(&mut self, schema: &TableSchema, rows: &[Row]) -> Result<()>;

    /// Every row of the schema's table.
    fn scan(&mut self, schema: &TableSchema) -> Result<Vec<Row>>;
}

pub(crate) type StoredRow = BTreeMap<String, Value>;

/// Counters over statements issued against a [`MemoryStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreMetrics {
    pub connections_opened: usize,
    pub selects: usize,
    pub updates: usize,
    pub insert_statements: usize,
    pub inserted_rows: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, Vec<StoredRow>>,
    metrics: StoreMetrics,
    open_connections: usize,
}

/// In-memory table store. Cloning shares the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Create a new, empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rows without going through a connection or the counters.
    pub fn seed(&self, schema: &TableSchema, rows: Vec<Row>) -> Result<()> {
        let mut state = self.state.lock();
        let table = state.tables.entry(schema.table().to_string()).or_default();
        for row in rows {
            table.push(store_row(schema, &row)?);
        }
        Ok(())
    }

    /// Copy of every stored row of `table`, keyed by field name.
    pub fn table_rows(&self, table: &str) -> Vec<BTreeMap<String, Value>> {
        self.state
            .lock()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self, table: &str) -> usize {
        self.state.lock().tables.get(table).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    pub fn metrics(&self) -> StoreMetrics {
        self.state.lock().metrics
    }

    pub fn reset_metrics(&self) {
        self.state.lock().metrics = StoreMetrics::default();
    }

    /// Connections currently held. Zero once every flush has finished.
    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections
    }
}

impl StoreConnector for MemoryStore {
    type Connection = MemoryConnection;

    fn connect(&self) -> Result<MemoryConnection> {
        let mut state = self.state.lock();
        state.open_connections += 1;
        state.metrics.connections_opened += 1;
        Ok(MemoryConnection {
            state: Arc::clone(&self.state),
        })
    }
}

/// Connection handle into a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
}

impl StoreConnection for MemoryConnection {
    fn count_matching(&mut self, table: &str, predicate: &Predicate) -> Result<usize> {
        let mut state = self.state.lock();
        state.metrics.selects += 1;
        Ok(state
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|row| matches(row, predicate)).count())
            .unwrap_or(0))
    }

    fn update_matching(
        &mut self,
        table: &str,
        predicate: &Predicate,
        assignments: &[Assignment],
    ) -> Result<usize> {
        let mut state = self.state.lock();
        state.metrics.updates += 1;
        let Some(rows) = state.tables.get_mut(table) else {
            return Ok(0);
        };
        let mut matched = 0;
        for row in rows.iter_mut().filter(|row| matches(row, predicate)) {
            for assignment in assignments {
                row.insert(assignment.field.clone(), assignment.value.clone());
            }
            matched += 1;
        }
        Ok(matched)
    }

    fn insert_batch(&mut self, schema: &TableSchema, rows: &[Row]) -> Result<()> {
        let stored = rows
            .iter()
            .map(|row| store_row(schema, row))
            .collect::<Result<Vec<_>>>()?;

        let mut state = self.state.lock();
        state.metrics.insert_statements += 1;
        state.metrics.inserted_rows += stored.len();
        state
            .tables
            .entry(schema.table().to_string())
            .or_default()
            .extend(stored);
        Ok(())
    }

    fn scan(&mut self, schema: &TableSchema) -> Result<Vec<Row>> {
        let state = self.state.lock();
        let Some(rows) = state.tables.get(schema.table()) else {
            return Ok(Vec::new());
        };
        rows.iter().map(|row| load_row(schema, row)).collect()
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.open_connections = state.open_connections.saturating_sub(1);
    }
}

pub(crate) fn matches(row: &StoredRow, predicate: &Predicate) -> bool {
    predicate
        .terms
        .iter()
        .all(|(field, key)| row.get(field).is_some_and(|value| *value == Value::from(key)))
}

pub(crate) fn store_row(schema: &TableSchema, row: &Row) -> Result<StoredRow> {
    if row.dimensions.len() != schema.depth() {
        bail!(
            "row has {} dimension values, table {} expects {}",
            row.dimensions.len(),
            schema.table(),
            schema.depth()
        );
    }
    Ok(schema
        .columns()
        .map(str::to_string)
        .zip(row.values(schema))
        .collect())
}

pub(crate) fn load_row(schema: &TableSchema, stored: &StoredRow) -> Result<Row> {
    let dimensions = schema
        .dimensions()
        .iter()
        .map(|name| match stored.get(name) {
            Some(Value::Text(s)) => Ok(Key::Text(s.clone())),
            Some(Value::Int(i)) => Ok(Key::Int(*i)),
            other => Err(anyhow!("dimension {name} holds {other:?}")),
        })
        .collect::<Result<Vec<_>>>()?;
    let metrics = schema
        .metrics()
        .iter()
        .map(|name| (name.clone(), stored.get(name).cloned().unwrap_or_default()))
        .collect();
    Ok(Row::new(dimensions, metrics))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn economy() -> TableSchema {
        TableSchema::new("economy", ["date"], ["unemployment", "gdp"]).unwrap()
    }

    fn row(date: &str, unemployment: Value) -> Row {
        let mut metrics = BTreeMap::new();
        metrics.insert("unemployment".to_string(), unemployment);
        metrics.insert("gdp".to_string(), Value::Null);
        Row::new(vec![Key::from(date)], metrics)
    }

    fn by_date(date: &str) -> Predicate {
        Predicate::new(vec![("date".to_string(), Key::from(date))])
    }

    #[test]
    fn test_store_creation() {
        let store = MemoryStore::new();
        assert!(store.is_empty("economy"));
        assert_eq!(store.open_connections(), 0);
    }

    #[test]
    fn test_connection_released_on_drop() {
        let store = MemoryStore::new();
        let conn = store.connect().unwrap();
        assert_eq!(store.open_connections(), 1);
        drop(conn);
        assert_eq!(store.open_connections(), 0);
        assert_eq!(store.metrics().connections_opened, 1);
    }

    #[test]
    fn test_insert_then_count() {
        let store = MemoryStore::new();
        let schema = economy();
        let mut conn = store.connect().unwrap();
        conn.insert_batch(&schema, &[row("2020-01-01", Value::from("3.5"))])
            .unwrap();

        assert_eq!(conn.count_matching("economy", &by_date("2020-01-01")).unwrap(), 1);
        assert_eq!(conn.count_matching("economy", &by_date("2021-01-01")).unwrap(), 0);
        assert_eq!(store.metrics().insert_statements, 1);
    }

    #[test]
    fn test_null_is_stored_as_null() {
        let store = MemoryStore::new();
        let schema = economy();
        store
            .seed(&schema, vec![row("2020-01-01", Value::from("3.5"))])
            .unwrap();

        let rows = store.table_rows("economy");
        assert_eq!(rows[0].get("gdp"), Some(&Value::Null));
        assert_ne!(rows[0].get("gdp"), Some(&Value::Text("NULL".to_string())));
    }

    #[test]
    fn test_update_touches_only_matching_rows() {
        let store = MemoryStore::new();
        let schema = economy();
        store
            .seed(
                &schema,
                vec![
                    row("2020-01-01", Value::from("3.5")),
                    row("2021-01-01", Value::from("4.0")),
                ],
            )
            .unwrap();

        let mut conn = store.connect().unwrap();
        let matched = conn
            .update_matching(
                "economy",
                &by_date("2020-01-01"),
                &[Assignment::new("unemployment", "3.7")],
            )
            .unwrap();
        assert_eq!(matched, 1);

        let rows = conn.scan(&schema).unwrap();
        let updated = rows
            .iter()
            .find(|r| r.dimensions == vec![Key::from("2020-01-01")])
            .unwrap();
        let untouched = rows
            .iter()
            .find(|r| r.dimensions == vec![Key::from("2021-01-01")])
            .unwrap();
        assert_eq!(updated.metric("unemployment"), Some(&Value::from("3.7")));
        assert_eq!(untouched.metric("unemployment"), Some(&Value::from("4.0")));
    }

    #[test]
    fn test_insert_rejects_short_rows() {
        let store = MemoryStore::new();
        let schema = TableSchema::new("ipmetrics", ["industryCode", "date"], ["x"]).unwrap();
        let mut conn = store.connect().unwrap();
        let short = Row::new(vec![Key::from("3111")], BTreeMap::new());
        assert!(conn.insert_batch(&schema, &[short]).is_err());
        assert!(store.is_empty("ipmetrics"));
    }
}
