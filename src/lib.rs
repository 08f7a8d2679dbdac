//! # Upsertree
//!
//! A sparse hierarchical record accumulator with differential upsert.
//!
//! Records from independently paginated sources are merged into a tree keyed
//! by an ordered tuple of dimension values. A single flush then walks the tree
//! once, checks each row's existence in the store, updates rows that exist,
//! and bulk inserts the rest in as few statements as the placeholder ceiling
//! allows.
//!
//! ```no_run
//! use upsertree::{Accumulator, FlushOptions, Key, MemoryStore, TableSchema};
//!
//! # fn main() -> anyhow::Result<()> {
//! let schema = TableSchema::new("economy", ["date"], ["unemployment", "gdp"])?;
//! let mut acc = Accumulator::new(schema);
//! acc.merge(&[Key::from("2020-01-01")], "unemployment", "3.5")?;
//!
//! let store = MemoryStore::new();
//! let report = acc.flush(&store, &FlushOptions::default())?;
//! assert_eq!(report.inserted, 1);
//! # Ok(())
//! # }
//! ```

pub mod accumulator;
pub mod batch;
pub mod config;
pub mod error;
pub mod model;
pub mod persistence;
pub mod reconcile;
pub mod source;
pub mod store;
pub mod test_support;
pub mod tree;

// Re-export main types for convenience
pub use accumulator::{Accumulator, FlushOptions, FlushReport, GatherReport};
pub use batch::{BatchLimits, InsertBuffer};
pub use config::{StoreConfig, UpsertConfig};
pub use error::{FlushError, RowFailure, RowStage};
pub use model::{Assignment, Key, Predicate, Row, TableSchema, Triple, Value};
pub use persistence::PersistentStore;
pub use reconcile::{reconcile, ReconcileReport, SumRule};
pub use source::{NestedSource, RecordSource, SeriesSource, VecSource};
pub use store::{MemoryStore, StoreConnection, StoreConnector, StoreMetrics};
pub use tree::RecordTree;
