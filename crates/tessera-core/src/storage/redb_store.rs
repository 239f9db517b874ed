//! # redb-backed Store
//!
//! A disk-backed [`DataChannel`] using the redb embedded database.
//!
//! One unit of work is one redb write transaction, so a commit either lands
//! completely or not at all, and survives a crash once `execute` returns.
//!
//! ## Tables
//!
//! | Table       | Key                                  | Value             |
//! |-------------|--------------------------------------|-------------------|
//! | `rows`      | encoded id                           | encoded row       |
//! | `arcs`      | encoded (source, relationship, target) | encoded target id |
//! | `sequences` | `"Entity.COLUMN"`                    | next key value    |
//!
//! Ids encode with their entity name first, so all rows of one entity share
//! a key prefix; arcs of one (source, relationship) pair do too.

use super::{Columns, qualifies, sequence_name, unmatched};
use crate::channel::{
    ArcChange, DataChannel, DataRow, Query, RowOperation, RowResult, UnitOfWork,
};
use crate::formats::{id_from_bytes, key_to_bytes, row_from_bytes, row_to_bytes};
use crate::metadata::EntityDescriptor;
use crate::{ObjectId, TesseraError, Value};
use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, Table, TableDefinition,
    WriteTransaction,
};
use std::path::Path;

/// Rows: encoded ObjectId -> encoded column map.
const ROWS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("rows");

/// Arcs: encoded (source, relationship, target) -> encoded target id.
const ARCS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("arcs");

/// Key generator state: sequence name -> next value.
const SEQUENCES: TableDefinition<&str, i64> = TableDefinition::new("sequences");

fn io(e: impl std::fmt::Display) -> TesseraError {
    TesseraError::IoError(e.to_string())
}

/// A disk-backed data channel.
pub struct RedbStore {
    db: Database,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TesseraError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        // Create tables up front so readers never see a missing table.
        let txn = db.begin_write().map_err(io)?;
        {
            txn.open_table(ROWS).map_err(io)?;
            txn.open_table(ARCS).map_err(io)?;
            txn.open_table(SEQUENCES).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db })
    }

    /// Number of stored rows.
    pub fn row_count(&self) -> Result<u64, TesseraError> {
        let txn = self.db.begin_read().map_err(io)?;
        let rows = txn.open_table(ROWS).map_err(io)?;
        rows.len().map_err(io)
    }

    /// Stored row for an id.
    pub fn row(&self, id: &ObjectId) -> Result<Option<Columns>, TesseraError> {
        let txn = self.db.begin_read().map_err(io)?;
        let rows = txn.open_table(ROWS).map_err(io)?;
        Self::read_row(&rows, &key_to_bytes(id)?)
    }

    fn read_row<T>(table: &T, key: &[u8]) -> Result<Option<Columns>, TesseraError>
    where
        T: ReadableTable<&'static [u8], &'static [u8]>,
    {
        table
            .get(key)
            .map_err(io)?
            .map(|bytes| row_from_bytes(bytes.value()))
            .transpose()
    }

    fn apply(txn: &WriteTransaction, work: &UnitOfWork) -> Result<Vec<RowResult>, TesseraError> {
        let mut rows = txn.open_table(ROWS).map_err(io)?;
        let mut arcs = txn.open_table(ARCS).map_err(io)?;
        let mut results = Vec::with_capacity(work.rows.len());

        for operation in &work.rows {
            let affected = match operation {
                RowOperation::Insert { id, values } => {
                    let key = key_to_bytes(id)?;
                    if rows.get(key.as_slice()).map_err(io)?.is_some() {
                        return Err(TesseraError::StoreError(format!("duplicate key {id}")));
                    }
                    let bytes = row_to_bytes(values)?;
                    rows.insert(key.as_slice(), bytes.as_slice()).map_err(io)?;
                    1
                }
                RowOperation::Update {
                    id,
                    values,
                    qualifier,
                } => {
                    let key = key_to_bytes(id)?;
                    match Self::read_row(&rows, &key)? {
                        Some(mut row) if qualifies(&row, qualifier) => {
                            for (column, value) in values {
                                if value.is_null() {
                                    row.remove(column);
                                } else {
                                    row.insert(column.clone(), value.clone());
                                }
                            }
                            let bytes = row_to_bytes(&row)?;
                            rows.insert(key.as_slice(), bytes.as_slice()).map_err(io)?;
                            1
                        }
                        _ => unmatched(id, qualifier)?,
                    }
                }
                RowOperation::Delete { id, qualifier } => {
                    let key = key_to_bytes(id)?;
                    match Self::read_row(&rows, &key)? {
                        Some(row) if qualifies(&row, qualifier) => {
                            rows.remove(key.as_slice()).map_err(io)?;
                            Self::remove_arcs_of(&mut arcs, id)?;
                            1
                        }
                        _ => unmatched(id, qualifier)?,
                    }
                }
            };
            results.push(RowResult {
                id: operation.id().clone(),
                affected,
            });
        }

        for arc in &work.arcs {
            let key = key_to_bytes(&(&arc.source, arc.relationship.as_str(), &arc.target))?;
            match arc.change {
                ArcChange::Create => {
                    let target = key_to_bytes(&arc.target)?;
                    arcs.insert(key.as_slice(), target.as_slice()).map_err(io)?;
                }
                ArcChange::Delete => {
                    arcs.remove(key.as_slice()).map_err(io)?;
                }
            }
        }
        Ok(results)
    }

    /// Drop every arc that starts or ends at `id`.
    fn remove_arcs_of(
        arcs: &mut Table<'_, &'static [u8], &'static [u8]>,
        id: &ObjectId,
    ) -> Result<(), TesseraError> {
        let prefix = key_to_bytes(id)?;
        let mut doomed = Vec::new();
        for entry in arcs.iter().map_err(io)? {
            let (key, target) = entry.map_err(io)?;
            if key.value().starts_with(&prefix) || id_from_bytes(target.value())? == *id {
                doomed.push(key.value().to_vec());
            }
        }
        for key in doomed {
            arcs.remove(key.as_slice()).map_err(io)?;
        }
        Ok(())
    }
}

// =============================================================================
// DATA CHANNEL IMPLEMENTATION
// =============================================================================

impl DataChannel for RedbStore {
    fn execute(&self, work: &UnitOfWork) -> Result<Vec<RowResult>, TesseraError> {
        let txn = self.db.begin_write().map_err(io)?;
        match Self::apply(&txn, work) {
            Ok(results) => {
                txn.commit().map_err(io)?;
                tracing::debug!(rows = work.rows.len(), arcs = work.arcs.len(), "redb store committed unit of work");
                Ok(results)
            }
            Err(error) => {
                txn.abort().map_err(io)?;
                Err(error)
            }
        }
    }

    fn fetch(&self, query: &Query) -> Result<Vec<DataRow>, TesseraError> {
        let txn = self.db.begin_read().map_err(io)?;
        let rows = txn.open_table(ROWS).map_err(io)?;
        let mut out = Vec::new();

        match query {
            Query::ObjectById(id) => {
                if let Some(values) = Self::read_row(&rows, &key_to_bytes(id)?)? {
                    out.push(DataRow::new(id.clone(), values));
                }
            }
            Query::Relationship {
                source,
                relationship,
            } => {
                let arcs = txn.open_table(ARCS).map_err(io)?;
                let prefix = key_to_bytes(&(source, relationship.as_str()))?;
                for entry in arcs.range::<&[u8]>(prefix.as_slice()..).map_err(io)? {
                    let (key, target) = entry.map_err(io)?;
                    if !key.value().starts_with(&prefix) {
                        break;
                    }
                    let target = id_from_bytes(target.value())?;
                    if let Some(values) = Self::read_row(&rows, &key_to_bytes(&target)?)? {
                        out.push(DataRow::new(target, values));
                    }
                }
            }
            Query::Select { entity, matching } => {
                let prefix = key_to_bytes(entity.as_str())?;
                for entry in rows.range::<&[u8]>(prefix.as_slice()..).map_err(io)? {
                    let (key, value) = entry.map_err(io)?;
                    if !key.value().starts_with(&prefix) {
                        break;
                    }
                    let id = id_from_bytes(key.value())?;
                    if id.entity() != entity {
                        continue;
                    }
                    let values = row_from_bytes(value.value())?;
                    if qualifies(&values, matching) {
                        out.push(DataRow::new(id, values));
                    }
                }
            }
        }
        Ok(out)
    }

    fn generate_key(&self, entity: &EntityDescriptor, column: &str) -> Result<Value, TesseraError> {
        let name = sequence_name(entity.name(), column);
        let txn = self.db.begin_write().map_err(io)?;
        let value = {
            let mut sequences = txn.open_table(SEQUENCES).map_err(io)?;
            let current = sequences
                .get(name.as_str())
                .map_err(io)?
                .map(|v| v.value())
                .unwrap_or(1);
            sequences
                .insert(name.as_str(), current.saturating_add(1))
                .map_err(io)?;
            current
        };
        txn.commit().map_err(io)?;
        Ok(Value::Int(value))
    }
}

// =============================================================================
// TESTS
// =============================================================================
