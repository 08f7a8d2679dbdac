//! RocksDB-backed table store.
//!
//! Rows of every table share one column family. A row key is the table name
//! followed by its dimension terms in schema order, so an equality predicate
//! over leading dimensions is a prefix scan and a full-identity predicate hits
//! at most one key. Table schemas are kept in the metadata column family.

use crate::config::{StoreConfig, STORAGE_FORMAT_VERSION};
use crate::model::{Assignment, Key, Predicate, Row, TableSchema};
use crate::store::{load_row, matches, store_row, StoreConnection, StoreConnector, StoredRow};
use anyhow::{anyhow, bail, Context, Result};
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use tracing::debug;

const CF_ROWS: &str = "rows";
const CF_METADATA: &str = "metadata";

const KEY_MANIFEST: &[u8] = b"manifest";
const SCHEMA_KEY_PREFIX: &[u8] = b"schema\0";

const TAG_INT: u8 = 0x01;
const TAG_TEXT: u8 = 0x02;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

/// Connector for the RocksDB store. Each connection opens the database and
/// closes it again when dropped.
#[derive(Debug, Clone)]
pub struct PersistentStore {
    config: StoreConfig,
}

impl PersistentStore {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

impl StoreConnector for PersistentStore {
    type Connection = PersistentConnection;

    fn connect(&self) -> Result<PersistentConnection> {
        let path = self.config.data_dir.as_path();
        if self.config.repair {
            repair_db(path)?;
        }
        let db = open_db(path, self.config.create_if_missing)
            .with_context(|| format!("opening store at {}", path.display()))?;
        validate_or_init_manifest(&db)?;
        debug!(path = %path.display(), "store connection opened");
        Ok(PersistentConnection { db })
    }
}

/// An open RocksDB handle.
pub struct PersistentConnection {
    db: DB,
}

impl PersistentConnection {
    fn load_schema(&self, table: &str) -> Result<Option<TableSchema>> {
        let metadata_cf = self
            .db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| anyhow!("missing metadata column family"))?;
        match self.db.get_cf(metadata_cf, schema_key(table))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn register_schema(&self, schema: &TableSchema, batch: &mut WriteBatch) -> Result<()> {
        match self.load_schema(schema.table())? {
            Some(existing) if existing == *schema => Ok(()),
            Some(existing) => bail!(
                "table {} already stored with dimensions {:?} and metrics {:?}",
                schema.table(),
                existing.dimensions(),
                existing.metrics()
            ),
            None => {
                let metadata_cf = self
                    .db
                    .cf_handle(CF_METADATA)
                    .ok_or_else(|| anyhow!("missing metadata column family"))?;
                batch.put_cf(metadata_cf, schema_key(schema.table()), bincode::serialize(schema)?);
                Ok(())
            }
        }
    }

    /// Rows matching `predicate`, with their keys. Scans the longest leading
    /// run of dimension terms as a key prefix, then checks the rest.
    fn matching_rows(&self, table: &str, predicate: &Predicate) -> Result<Vec<(Vec<u8>, StoredRow)>> {
        let Some(schema) = self.load_schema(table)? else {
            return Ok(Vec::new());
        };
        let rows_cf = self
            .db
            .cf_handle(CF_ROWS)
            .ok_or_else(|| anyhow!("missing rows column family"))?;

        let mut prefix = encode_table_prefix(table);
        for dimension in schema.dimensions() {
            match predicate.get(dimension) {
                Some(key) => encode_term(&mut prefix, dimension, key)?,
                None => break,
            }
        }

        let mut found = Vec::new();
        for entry in self
            .db
            .iterator_cf(rows_cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            let row: StoredRow = bincode::deserialize(&value)?;
            if matches(&row, predicate) {
                found.push((key.to_vec(), row));
            }
        }
        Ok(found)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl StoreConnection for PersistentConnection {
    fn count_matching(&mut self, table: &str, predicate: &Predicate) -> Result<usize> {
        Ok(self.matching_rows(table, predicate)?.len())
    }

    fn update_matching(
        &mut self,
        table: &str,
        predicate: &Predicate,
        assignments: &[Assignment],
    ) -> Result<usize> {
        if let Some(schema) = self.load_schema(table)? {
            if let Some(a) = assignments
                .iter()
                .find(|a| schema.dimensions().contains(&a.field))
            {
                bail!("dimension {} of table {table} cannot be updated", a.field);
            }
        }
        let rows_cf = self
            .db
            .cf_handle(CF_ROWS)
            .ok_or_else(|| anyhow!("missing rows column family"))?;

        let matched = self.matching_rows(table, predicate)?;
        if matched.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::default();
        for (key, mut row) in matched.iter().cloned() {
            for assignment in assignments {
                row.insert(assignment.field.clone(), assignment.value.clone());
            }
            batch.put_cf(rows_cf, key, bincode::serialize(&row)?);
        }
        self.db.write(batch)?;
        Ok(matched.len())
    }

    fn insert_batch(&mut self, schema: &TableSchema, rows: &[Row]) -> Result<()> {
        let rows_cf = self
            .db
            .cf_handle(CF_ROWS)
            .ok_or_else(|| anyhow!("missing rows column family"))?;

        let mut batch = WriteBatch::default();
        self.register_schema(schema, &mut batch)?;
        for row in rows {
            let stored = store_row(schema, row)?;
            batch.put_cf(rows_cf, encode_row_key(schema, row)?, bincode::serialize(&stored)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn scan(&mut self, schema: &TableSchema) -> Result<Vec<Row>> {
        self.matching_rows(schema.table(), &Predicate::default())?
            .iter()
            .map(|(_, stored)| load_row(schema, stored))
            .collect()
    }
}

impl Drop for PersistentConnection {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn open_db(path: &Path, create_if_missing: bool) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(create_if_missing);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);
    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_ROWS, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

fn repair_db(path: &Path) -> Result<()> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DB::repair(&options, path)?;
    Ok(())
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: StorageManifest = bincode::deserialize(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let bytes = bincode::serialize(&manifest)?;
    db.put_cf(metadata_cf, KEY_MANIFEST, bytes)?;
    Ok(())
}

fn schema_key(table: &str) -> Vec<u8> {
    let mut key = SCHEMA_KEY_PREFIX.to_vec();
    key.extend_from_slice(table.as_bytes());
    key
}

fn encode_table_prefix(table: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(table.len() + 1);
    key.extend_from_slice(table.as_bytes());
    key.push(0);
    key
}

/// Appends one `(field, key)` term. Every part is length-prefixed or fixed
/// width, so a key never prefixes a different term sequence. Lengths that do
/// not fit their prefix are rejected rather than truncated.
fn encode_term(buf: &mut Vec<u8>, field: &str, key: &Key) -> Result<()> {
    let field_len = u16::try_from(field.len())
        .map_err(|_| anyhow!("field name of {} bytes is too long for a row key", field.len()))?;
    buf.extend_from_slice(&field_len.to_be_bytes());
    buf.extend_from_slice(field.as_bytes());
    match key {
        Key::Int(v) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes());
        }
        Key::Text(s) => {
            let text_len = u32::try_from(s.len())
                .map_err(|_| anyhow!("key of {} bytes in {field} is too long", s.len()))?;
            buf.push(TAG_TEXT);
            buf.extend_from_slice(&text_len.to_be_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
    }
    Ok(())
}

fn encode_row_key(schema: &TableSchema, row: &Row) -> Result<Vec<u8>> {
    let mut key = encode_table_prefix(schema.table());
    for (field, value) in schema.dimensions().iter().zip(row.dimensions.iter()) {
        encode_term(&mut key, field, value)?;
    }
    Ok(key)
}
