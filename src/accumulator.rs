//! # Accumulator
//!
//! Gathers sparse records from any number of sources into one record tree,
//! then reconciles the tree against a store in a single flush:
//!
//! 1. check that one row fits under the placeholder ceiling, then acquire
//!    one connection (released on every exit path),
//! 2. flatten the tree into rows, rejecting a mis-shaped tree before any write,
//! 3. per row, check existence on the full dimension identity; update metrics
//!    of existing rows, buffer the rest,
//! 4. write the buffered rows as bulk inserts under the placeholder ceiling.
//!
//! An accumulator is single-use: `flush` consumes it.

use crate::batch::{BatchLimits, InsertBuffer};
use crate::config::FlushConfig;
use crate::error::{FlushError, RowFailure, RowStage};
use crate::model::{Key, Row, TableSchema, Triple, Value};
use crate::source::RecordSource;
use crate::store::{StoreConnection, StoreConnector};
use crate::tree::RecordTree;
use anyhow::{bail, Result};
use tracing::{debug, error, info, instrument, warn};

/// Flush tuning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOptions {
    pub limits: BatchLimits,
}

impl From<&FlushConfig> for FlushOptions {
    fn from(config: &FlushConfig) -> Self {
        Self {
            limits: config.limits(),
        }
    }
}

/// What a flush did.
#[derive(Debug, Clone, Default)]
pub struct FlushReport {
    /// Leaves turned into rows
    pub rows_visited: usize,
    /// Rows that existed and had their metrics updated
    pub updated: usize,
    /// Rows written by bulk insert
    pub inserted: usize,
    /// Bulk insert statements committed
    pub insert_statements: usize,
    /// Rows whose existence check or update failed
    pub failed_rows: Vec<RowFailure>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed_rows.is_empty()
    }
}

/// Outcome of draining one or more sources.
#[derive(Debug, Clone, Default)]
pub struct GatherReport {
    pub merged: usize,
    pub rejected: usize,
    /// `(source name, error)` for sources that failed outright
    pub failed_sources: Vec<(String, String)>,
}

enum RowOutcome {
    Updated,
    Missing,
}

/// Hierarchical upsert accumulator for one table.
#[derive(Debug, Clone)]
pub struct Accumulator {
    schema: TableSchema,
    tree: RecordTree,
}

impl Accumulator {
    pub fn new(schema: TableSchema) -> Self {
        let tree = RecordTree::new(schema.depth());
        Self { schema, tree }
    }

    /// Wrap a tree built elsewhere. Its shape is checked at flush.
    pub fn from_tree(schema: TableSchema, tree: RecordTree) -> Self {
        Self { schema, tree }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn tree(&self) -> &RecordTree {
        &self.tree
    }

    pub fn leaf_count(&self) -> usize {
        self.tree.leaf_count()
    }

    /// Set `metric` at `path`. Metrics already merged at the same path are kept.
    pub fn merge(&mut self, path: &[Key], metric: &str, value: impl Into<Value>) -> Result<()> {
        if !self.schema.has_metric(metric) {
            bail!(
                "metric {metric} is not declared for table {}",
                self.schema.table()
            );
        }
        self.tree.merge(path, metric, value.into())
    }

    pub fn merge_triple(&mut self, triple: Triple) -> Result<()> {
        self.merge(&triple.path, &triple.metric, triple.value)
    }

    /// Drop a path before flushing, e.g. an entry a later lookup invalidated.
    pub fn remove(&mut self, path: &[Key]) -> bool {
        self.tree.remove(path)
    }

    /// Drain one source. Triples that do not fit the schema are logged and
    /// skipped; a source that cannot produce triples is an error.
    #[instrument(skip(self, source), fields(source = %source.name()), level = "debug")]
    pub fn gather(&mut self, source: &mut dyn RecordSource) -> Result<GatherReport> {
        let triples = source.triples()?;
        let mut report = GatherReport::default();
        for triple in triples {
            let path = triple.path.clone();
            match self.merge_triple(triple) {
                Ok(()) => report.merged += 1,
                Err(e) => {
                    warn!(source = %source.name(), ?path, error = %e, "triple rejected");
                    report.rejected += 1;
                }
            }
        }
        debug!(merged = report.merged, rejected = report.rejected, "source gathered");
        Ok(report)
    }

    /// Drain every source in order. A failing source is logged and skipped;
    /// it is picked up again on the next run.
    pub fn gather_all(&mut self, sources: &mut [Box<dyn RecordSource>]) -> GatherReport {
        let mut total = GatherReport::default();
        for source in sources.iter_mut() {
            match self.gather(source.as_mut()) {
                Ok(report) => {
                    total.merged += report.merged;
                    total.rejected += report.rejected;
                }
                Err(e) => {
                    warn!(source = %source.name(), error = %e, "source failed");
                    total
                        .failed_sources
                        .push((source.name().to_string(), format!("{e:#}")));
                }
            }
        }
        total
    }

    /// Reconcile the accumulated tree against the store.
    #[instrument(skip(self, connector, options), fields(table = %self.schema.table()), level = "debug")]
    pub fn flush<C: StoreConnector>(
        self,
        connector: &C,
        options: &FlushOptions,
    ) -> Result<FlushReport, FlushError> {
        let field_count = self.schema.field_count();
        let rows_per_statement = options.limits.rows_per_statement(field_count).ok_or(
            FlushError::CeilingTooSmall {
                max_placeholders: options.limits.max_placeholders,
                field_count,
            },
        )?;

        let mut conn = connector.connect().map_err(FlushError::Connect)?;

        let rows = self.tree.rows(&self.schema)?;
        let mut report = FlushReport {
            rows_visited: rows.len(),
            ..Default::default()
        };

        let mut pending = InsertBuffer::new();
        for row in rows {
            match self.check_and_update(&mut conn, &row) {
                Ok(RowOutcome::Updated) => report.updated += 1,
                Ok(RowOutcome::Missing) => pending.push(row),
                Err((stage, e)) => {
                    warn!(
                        row = %row.identity(&self.schema),
                        %stage,
                        error = %e,
                        "row skipped"
                    );
                    report.failed_rows.push(RowFailure {
                        row,
                        stage,
                        message: format!("{e:#}"),
                    });
                }
            }
        }

        let report = self.insert_pending(&mut conn, &pending, rows_per_statement, report)?;
        drop(conn);

        info!(
            table = %self.schema.table(),
            rows = report.rows_visited,
            updated = report.updated,
            inserted = report.inserted,
            statements = report.insert_statements,
            failed = report.failed_rows.len(),
            "flush complete"
        );
        Ok(report)
    }

    fn check_and_update<S: StoreConnection>(
        &self,
        conn: &mut S,
        row: &Row,
    ) -> Result<RowOutcome, (RowStage, anyhow::Error)> {
        let table = self.schema.table();
        let predicate = self.schema.identity_predicate(row);

        let existing = conn
            .count_matching(table, &predicate)
            .map_err(|e| (RowStage::ExistenceCheck, e))?;
        if existing == 0 {
            return Ok(RowOutcome::Missing);
        }

        let assignments = self.schema.metric_assignments(row);
        conn.update_matching(table, &predicate, &assignments)
            .map_err(|e| (RowStage::Update, e))?;
        Ok(RowOutcome::Updated)
    }

    fn insert_pending<S: StoreConnection>(
        &self,
        conn: &mut S,
        pending: &InsertBuffer,
        rows_per_statement: usize,
        mut report: FlushReport,
    ) -> Result<FlushReport, FlushError> {
        if pending.is_empty() {
            return Ok(report);
        }
        let plan = pending.stats(rows_per_statement);
        debug!(
            rows = plan.rows,
            statements = plan.statements,
            rows_per_statement = plan.rows_per_statement,
            "bulk insert planned"
        );

        let mut written = 0;
        for (batch_index, batch) in pending.batches(rows_per_statement).enumerate() {
            if let Err(source) = conn.insert_batch(&self.schema, batch) {
                error!(
                    table = %self.schema.table(),
                    batch = batch_index,
                    error = %source,
                    "insert batch failed"
                );
                return Err(FlushError::BatchInsert {
                    batch_index,
                    source,
                    not_persisted: pending.tail(written),
                    report,
                });
            }
            written += batch.len();
            report.inserted += batch.len();
            report.insert_statements += 1;
        }
        Ok(report)
    }
}
