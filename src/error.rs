//! Typed outcomes of a flush.
//!
//! Store and source plumbing reports through `anyhow`; the flush itself
//! surfaces a closed set of fatal conditions so callers can decide what to
//! re-derive on the next run.

use crate::accumulator::FlushReport;
use crate::model::{Key, Row};
use std::fmt;

/// Where a per-row failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStage {
    ExistenceCheck,
    Update,
}

impl fmt::Display for RowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowStage::ExistenceCheck => write!(f, "existence check"),
            RowStage::Update => write!(f, "update"),
        }
    }
}

/// A row whose existence check or update failed. The flush carried on.
#[derive(Debug, Clone)]
pub struct RowFailure {
    pub row: Row,
    pub stage: RowStage,
    pub message: String,
}

/// Fatal flush conditions.
#[derive(Debug)]
pub enum FlushError {
    /// One row binds more placeholders than a statement may hold.
    /// Checked before the store is touched.
    CeilingTooSmall {
        max_placeholders: usize,
        field_count: usize,
    },
    /// The store could not be acquired; nothing was traversed.
    Connect(anyhow::Error),
    /// A leaf sits above the configured depth or a branch continues past it.
    /// Detected before any write.
    MalformedTree {
        path: Vec<Key>,
        expected_depth: usize,
    },
    /// A bulk insert statement failed. Earlier batches stay committed;
    /// `not_persisted` holds the failing batch and every row after it.
    BatchInsert {
        batch_index: usize,
        source: anyhow::Error,
        not_persisted: Vec<Row>,
        report: FlushReport,
    },
}

impl fmt::Display for FlushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushError::CeilingTooSmall {
                max_placeholders,
                field_count,
            } => write!(
                f,
                "placeholder ceiling {max_placeholders} cannot fit one row of {field_count} fields"
            ),
            FlushError::Connect(e) => write!(f, "store connection failed: {e}"),
            FlushError::MalformedTree {
                path,
                expected_depth,
            } => {
                let rendered = path
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("/");
                write!(
                    f,
                    "malformed record tree at [{rendered}]: depth {} does not match {expected_depth} dimensions",
                    path.len()
                )
            }
            FlushError::BatchInsert {
                batch_index,
                source,
                not_persisted,
                ..
            } => write!(
                f,
                "insert batch {batch_index} failed ({} rows not persisted): {source}",
                not_persisted.len()
            ),
        }
    }
}

impl std::error::Error for FlushError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FlushError::Connect(e) => Some(&**e),
            FlushError::BatchInsert { source, .. } => Some(&**source),
            FlushError::CeilingTooSmall { .. } | FlushError::MalformedTree { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_tree_names_path() {
        let err = FlushError::MalformedTree {
            path: vec![Key::from("3111"), Key::from(2012)],
            expected_depth: 3,
        };
        let message = err.to_string();
        assert!(message.contains("[3111/2012]"));
        assert!(message.contains("depth 2"));
    }

    #[test]
    fn test_connect_error_exposes_source() {
        let err = FlushError::Connect(anyhow::anyhow!("refused"));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "store connection failed: refused");
    }
}
