//! # Insert Batching
//!
//! Rows found missing from the store are buffered for the whole flush and then
//! written as bulk inserts. Each statement binds one placeholder per field, so
//! the number of rows per statement is bounded by the placeholder ceiling
//! divided by the row width.

use crate::config::DEFAULT_MAX_PLACEHOLDERS;
use crate::model::Row;

/// Size ceiling for a single insert statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Maximum bound values per statement
    pub max_placeholders: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_placeholders: DEFAULT_MAX_PLACEHOLDERS,
        }
    }
}

impl BatchLimits {
    pub fn with_max_placeholders(max_placeholders: usize) -> Self {
        Self { max_placeholders }
    }

    /// Rows that fit in one statement when each row binds `field_count` values.
    /// `None` when a single row is wider than the ceiling.
    pub fn rows_per_statement(&self, field_count: usize) -> Option<usize> {
        match self.max_placeholders / field_count.max(1) {
            0 => None,
            rows => Some(rows),
        }
    }
}

/// Ordered buffer of rows pending insert.
#[derive(Debug, Clone, Default)]
pub struct InsertBuffer {
    rows: Vec<Row>,
}

impl InsertBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Consecutive slices of at most `rows_per_statement` rows, in buffer order.
    ///
    /// # Panics
    /// If `rows_per_statement` is zero.
    pub fn batches(&self, rows_per_statement: usize) -> std::slice::Chunks<'_, Row> {
        self.rows.chunks(rows_per_statement)
    }

    /// Rows from `start` onward; what remains unwritten after a failed batch.
    pub fn tail(&self, start: usize) -> Vec<Row> {
        self.rows.get(start..).map(<[Row]>::to_vec).unwrap_or_default()
    }

    /// Statistics for the planned statements.
    pub fn stats(&self, rows_per_statement: usize) -> InsertStats {
        let rows_per_statement = rows_per_statement.max(1);
        InsertStats {
            rows: self.rows.len(),
            rows_per_statement,
            statements: self.rows.len().div_ceil(rows_per_statement),
        }
    }
}

/// Plan of the bulk insert for a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertStats {
    pub rows: usize,
    pub rows_per_statement: usize,
    pub statements: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Key;
    use std::collections::BTreeMap;

    fn buffer_of(count: usize) -> InsertBuffer {
        let mut buffer = InsertBuffer::new();
        for i in 0..count {
            buffer.push(Row::new(vec![Key::Int(i as i64)], BTreeMap::new()));
        }
        buffer
    }

    #[test]
    fn test_default_ceiling_matches_sixteen_bit_placeholders() {
        let limits = BatchLimits::default();
        assert_eq!(limits.max_placeholders, 65535);
        assert_eq!(limits.rows_per_statement(3), Some(21845));
        assert_eq!(limits.rows_per_statement(8), Some(8191));
    }

    #[test]
    fn test_row_wider_than_ceiling_has_no_statement_size() {
        assert_eq!(BatchLimits::with_max_placeholders(4).rows_per_statement(10), None);
        assert_eq!(BatchLimits::with_max_placeholders(2).rows_per_statement(3), None);
        assert_eq!(BatchLimits::with_max_placeholders(0).rows_per_statement(1), None);
        assert_eq!(BatchLimits::with_max_placeholders(3).rows_per_statement(3), Some(1));
    }

    #[test]
    fn test_batches_respect_ceiling_and_order() {
        let limits = BatchLimits::with_max_placeholders(10);
        let buffer = buffer_of(7);
        let per_statement = limits.rows_per_statement(3).unwrap();
        let batches: Vec<&[Row]> = buffer.batches(per_statement).collect();

        assert_eq!(batches.len(), 3);
        for batch in &batches {
            assert!(batch.len() * 3 <= 10);
        }
        let flattened: Vec<Key> = batches
            .iter()
            .flat_map(|b| b.iter().map(|r| r.dimensions[0].clone()))
            .collect();
        let expected: Vec<Key> = (0..7).map(Key::Int).collect();
        assert_eq!(flattened, expected);
    }

    #[test]
    fn test_stats_and_tail() {
        let limits = BatchLimits::with_max_placeholders(6);
        let buffer = buffer_of(5);
        let stats = buffer.stats(limits.rows_per_statement(2).unwrap());
        assert_eq!(stats.rows_per_statement, 3);
        assert_eq!(stats.statements, 2);
        assert_eq!(buffer.tail(3).len(), 2);
        assert!(buffer.tail(9).is_empty());
    }
}
