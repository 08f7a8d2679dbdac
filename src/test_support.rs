use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::model::{Assignment, Key, Predicate, Row, TableSchema, Triple, Value};
use crate::store::{MemoryConnection, MemoryStore, StoreConnection, StoreConnector};

pub const IP_METRICS: [&str; 6] = [
    "laborCostMil",
    "capitalCostMil",
    "intermediateCostMil",
    "combinedCostMil",
    "employmentIndex",
    "multifactorProductivity",
];

pub fn economy_schema() -> TableSchema {
    TableSchema::new("economy", ["date"], ["unemployment", "gdp"]).expect("valid schema")
}

pub fn ipmetrics_schema() -> TableSchema {
    TableSchema::new("ipmetrics", ["industryCode", "date"], IP_METRICS).expect("valid schema")
}

/// Sparse triples over `industries x years`, one per metric with probability
/// `density`. Deterministic for a given seed.
pub fn generate_triples(industries: u32, years: u32, density: f64, seed: u64) -> Vec<Triple> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut triples = Vec::new();
    for industry in 0..industries {
        let code = format!("{:04}", 3111 + industry);
        for year in 0..years {
            let date = format!("{}-01-01", 2006 + year);
            for metric in IP_METRICS {
                if rng.random_bool(density) {
                    let value = format!("{:.1}", rng.random_range(1.0..500.0));
                    triples.push(Triple::new(
                        vec![Key::from(code.as_str()), Key::from(date.as_str())],
                        metric,
                        value,
                    ));
                }
            }
        }
    }
    triples
}

/// Failures to inject into a [`FaultyStore`].
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    pub refuse_connect: bool,
    /// Zero-based insert statement that fails
    pub fail_insert_statement: Option<usize>,
    /// Existence checks whose predicate mentions this key fail
    pub fail_check_for: Option<Key>,
    /// Updates whose predicate mentions this key fail
    pub fail_update_for: Option<Key>,
}

/// A [`MemoryStore`] that fails on demand.
#[derive(Debug, Clone, Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    pub plan: FaultPlan,
}

impl FaultyStore {
    pub fn new(inner: MemoryStore, plan: FaultPlan) -> Self {
        Self { inner, plan }
    }
}

impl StoreConnector for FaultyStore {
    type Connection = FaultyConnection;

    fn connect(&self) -> Result<FaultyConnection> {
        if self.plan.refuse_connect {
            bail!("connection refused");
        }
        Ok(FaultyConnection {
            inner: self.inner.connect()?,
            plan: self.plan.clone(),
            insert_statements: 0,
        })
    }
}

pub struct FaultyConnection {
    inner: MemoryConnection,
    plan: FaultPlan,
    insert_statements: usize,
}

fn mentions(predicate: &Predicate, key: &Option<Key>) -> bool {
    key.as_ref()
        .is_some_and(|key| predicate.terms.iter().any(|(_, k)| k == key))
}

impl StoreConnection for FaultyConnection {
    fn count_matching(&mut self, table: &str, predicate: &Predicate) -> Result<usize> {
        if mentions(predicate, &self.plan.fail_check_for) {
            bail!("injected select failure");
        }
        self.inner.count_matching(table, predicate)
    }

    fn update_matching(
        &mut self,
        table: &str,
        predicate: &Predicate,
        assignments: &[Assignment],
    ) -> Result<usize> {
        if mentions(predicate, &self.plan.fail_update_for) {
            bail!("injected update failure");
        }
        self.inner.update_matching(table, predicate, assignments)
    }

    fn insert_batch(&mut self, schema: &TableSchema, rows: &[Row]) -> Result<()> {
        let statement = self.insert_statements;
        self.insert_statements += 1;
        if self.plan.fail_insert_statement == Some(statement) {
            bail!("injected insert failure on statement {statement}");
        }
        self.inner.insert_batch(schema, rows)
    }

    fn scan(&mut self, schema: &TableSchema) -> Result<Vec<Row>> {
        self.inner.scan(schema)
    }
}

/// Stored value of `field` for the row whose dimensions equal `dims`.
pub fn stored_value(store: &MemoryStore, schema: &TableSchema, dims: &[Key], field: &str) -> Option<Value> {
    store
        .table_rows(schema.table())
        .into_iter()
        .find(|row| {
            schema
                .dimensions()
                .iter()
                .zip(dims)
                .all(|(name, key)| row.get(name) == Some(&Value::from(key)))
        })
        .and_then(|row| row.get(field).cloned())
}
