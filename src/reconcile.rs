//! Post-flush gap filling for metrics bound by a sum identity.
//!
//! Some sources publish a total and its components as separate series, and
//! either side may be missing for a given row. With `total = sum(parts)`, a
//! row holding every part gets its total recomputed, and a row holding the
//! total and all but one part gets the missing part derived. This runs against
//! the store after a flush and is independent of the accumulator.

use crate::model::{Assignment, Row, TableSchema, Value};
use crate::store::{StoreConnection, StoreConnector};
use anyhow::{bail, Result};
use tracing::{debug, info};

const EPSILON: f64 = 1e-9;

/// `total = parts[0] + parts[1] + ...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SumRule {
    pub total: String,
    pub parts: Vec<String>,
}

impl SumRule {
    pub fn new<P>(total: impl Into<String>, parts: P) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Self {
            total: total.into(),
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }

    fn validate(&self, schema: &TableSchema) -> Result<()> {
        if self.parts.is_empty() {
            bail!("sum rule for {} has no parts", self.total);
        }
        for field in std::iter::once(&self.total).chain(self.parts.iter()) {
            if !schema.has_metric(field) {
                bail!("sum rule field {field} is not a metric of {}", schema.table());
            }
        }
        Ok(())
    }

    /// The single assignment this rule implies for `row`, if any.
    ///
    /// A computed total takes the representation of the first part, and a
    /// derived part that of the total, so a column written as text by its
    /// source stays text.
    pub fn fill(&self, row: &Row) -> Option<Assignment> {
        let numeric = |name: &str| row.metric(name).and_then(Value::as_f64);
        let parts: Vec<Option<f64>> = self.parts.iter().map(|p| numeric(p.as_str())).collect();
        let total = numeric(self.total.as_str());

        if parts.iter().all(Option::is_some) {
            let sum: f64 = parts.iter().flatten().sum();
            return match total {
                Some(t) if (t - sum).abs() < EPSILON => None,
                _ => {
                    let template = row.metric(self.parts.first()?.as_str())?;
                    Some(Assignment::new(self.total.clone(), shaped_like(template, sum)))
                }
            };
        }

        let total_value = total?;
        let mut missing = parts.iter().enumerate().filter(|(_, v)| v.is_none());
        let (index, _) = missing.next()?;
        if missing.next().is_some() {
            return None;
        }
        let known: f64 = parts.iter().flatten().sum();
        let template = row.metric(self.total.as_str())?;
        Some(Assignment::new(
            self.parts[index].clone(),
            shaped_like(template, total_value - known),
        ))
    }
}

/// `n` in the same variant as `template`. Integers stay integers only while
/// the result is whole.
fn shaped_like(template: &Value, n: f64) -> Value {
    match template {
        Value::Int(_) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => Value::Int(n as i64),
        Value::Text(_) => Value::Text(n.to_string()),
        _ => Value::Float(n),
    }
}

/// What a reconcile pass wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub rows_scanned: usize,
    pub totals_written: usize,
    pub parts_derived: usize,
}

/// Apply `rules` to every row of the schema's table.
///
/// Rules run in order and see the effect of earlier rules on the same row.
pub fn reconcile<C: StoreConnector>(
    connector: &C,
    schema: &TableSchema,
    rules: &[SumRule],
) -> Result<ReconcileReport> {
    for rule in rules {
        rule.validate(schema)?;
    }
    let mut conn = connector.connect()?;
    let rows = conn.scan(schema)?;
    let mut report = ReconcileReport {
        rows_scanned: rows.len(),
        ..Default::default()
    };

    for mut row in rows {
        let mut assignments = Vec::new();
        for rule in rules {
            if let Some(assignment) = rule.fill(&row) {
                if assignment.field == rule.total {
                    report.totals_written += 1;
                } else {
                    report.parts_derived += 1;
                }
                row.metrics
                    .insert(assignment.field.clone(), assignment.value.clone());
                assignments.push(assignment);
            }
        }
        if assignments.is_empty() {
            continue;
        }
        debug!(row = %row.identity(schema), fields = assignments.len(), "gaps filled");
        conn.update_matching(schema.table(), &schema.identity_predicate(&row), &assignments)?;
    }

    info!(
        table = %schema.table(),
        rows = report.rows_scanned,
        totals = report.totals_written,
        parts = report.parts_derived,
        "reconcile complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Key;
    use std::collections::BTreeMap;

    fn cost_rule() -> SumRule {
        SumRule::new(
            "combinedCostMil",
            ["laborCostMil", "capitalCostMil", "intermediateCostMil"],
        )
    }

    fn row(values: &[(&str, Value)]) -> Row {
        let mut metrics = BTreeMap::new();
        for name in [
            "laborCostMil",
            "capitalCostMil",
            "intermediateCostMil",
            "combinedCostMil",
        ] {
            metrics.insert(name.to_string(), Value::Null);
        }
        for (name, value) in values {
            metrics.insert(name.to_string(), value.clone());
        }
        Row::new(vec![Key::from("3111"), Key::from("2012-01-01")], metrics)
    }

    #[test]
    fn test_total_from_complete_parts() {
        let r = row(&[
            ("laborCostMil", Value::from("10")),
            ("capitalCostMil", Value::from("5")),
            ("intermediateCostMil", Value::Int(5)),
        ]);
        let assignment = cost_rule().fill(&r).unwrap();
        assert_eq!(assignment.field, "combinedCostMil");
        assert_eq!(assignment.value, Value::from("20"));
    }

    #[test]
    fn test_consistent_total_is_left_alone() {
        let r = row(&[
            ("laborCostMil", Value::Int(10)),
            ("capitalCostMil", Value::Int(5)),
            ("intermediateCostMil", Value::Int(5)),
            ("combinedCostMil", Value::from("20")),
        ]);
        assert!(cost_rule().fill(&r).is_none());
    }

    #[test]
    fn test_single_missing_part_is_derived() {
        let r = row(&[
            ("laborCostMil", Value::Int(10)),
            ("intermediateCostMil", Value::Int(5)),
            ("combinedCostMil", Value::Int(20)),
        ]);
        let assignment = cost_rule().fill(&r).unwrap();
        assert_eq!(assignment.field, "capitalCostMil");
        assert_eq!(assignment.value, Value::Int(5));
    }

    #[test]
    fn test_derived_values_keep_the_column_type() {
        let text = row(&[
            ("laborCostMil", Value::from("12")),
            ("intermediateCostMil", Value::from("6.5")),
            ("combinedCostMil", Value::from("25")),
        ]);
        assert_eq!(cost_rule().fill(&text).unwrap().value, Value::from("6.5"));

        let fractional = row(&[
            ("laborCostMil", Value::Int(1)),
            ("capitalCostMil", Value::Float(0.5)),
            ("intermediateCostMil", Value::Int(1)),
        ]);
        assert_eq!(cost_rule().fill(&fractional).unwrap().value, Value::Float(2.5));

        let floats = row(&[
            ("laborCostMil", Value::Float(1.5)),
            ("capitalCostMil", Value::Float(1.0)),
            ("intermediateCostMil", Value::Float(0.5)),
        ]);
        assert_eq!(cost_rule().fill(&floats).unwrap().value, Value::Float(3.0));
    }

    #[test]
    fn test_two_missing_parts_stay_null() {
        let r = row(&[
            ("laborCostMil", Value::Int(10)),
            ("combinedCostMil", Value::Int(20)),
        ]);
        assert!(cost_rule().fill(&r).is_none());
    }

    #[test]
    fn test_missing_total_and_part_stay_null() {
        let r = row(&[
            ("laborCostMil", Value::Int(10)),
            ("capitalCostMil", Value::Int(5)),
        ]);
        assert!(cost_rule().fill(&r).is_none());
    }
}
