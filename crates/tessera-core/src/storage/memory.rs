//! # In-Memory Store
//!
//! A [`DataChannel`] over in-process tables.
//!
//! Every unit of work runs against a copy of the tables; the copy replaces
//! the live tables only if every row and arc operation succeeded. Useful as
//! a test double and as a parent store for several contexts in one process.

use super::{Columns, qualifies, sequence_name, unmatched};
use crate::channel::{
    ArcChange, DataChannel, DataRow, Query, RowOperation, RowResult, UnitOfWork,
};
use crate::metadata::EntityDescriptor;
use crate::{ObjectId, TesseraError, Value};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

type ArcKey = (ObjectId, String, ObjectId);

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: BTreeMap<ObjectId, Columns>,
    arcs: BTreeSet<ArcKey>,
    sequences: BTreeMap<String, i64>,
}

impl Tables {
    fn apply(&mut self, work: &UnitOfWork) -> Result<Vec<RowResult>, TesseraError> {
        let mut results = Vec::with_capacity(work.rows.len());
        for operation in &work.rows {
            let affected = match operation {
                RowOperation::Insert { id, values } => {
                    if self.rows.contains_key(id) {
                        return Err(TesseraError::StoreError(format!("duplicate key {id}")));
                    }
                    self.rows.insert(id.clone(), values.clone());
                    1
                }
                RowOperation::Update {
                    id,
                    values,
                    qualifier,
                } => match self.rows.get_mut(id) {
                    Some(row) if qualifies(row, qualifier) => {
                        for (column, value) in values {
                            if value.is_null() {
                                row.remove(column);
                            } else {
                                row.insert(column.clone(), value.clone());
                            }
                        }
                        1
                    }
                    _ => unmatched(id, qualifier)?,
                },
                RowOperation::Delete { id, qualifier } => match self.rows.get(id) {
                    Some(row) if qualifies(row, qualifier) => {
                        self.rows.remove(id);
                        self.arcs.retain(|(s, _, t)| s != id && t != id);
                        1
                    }
                    _ => unmatched(id, qualifier)?,
                },
            };
            results.push(RowResult {
                id: operation.id().clone(),
                affected,
            });
        }

        for arc in &work.arcs {
            let entry = (arc.source.clone(), arc.relationship.clone(), arc.target.clone());
            match arc.change {
                ArcChange::Create => {
                    self.arcs.insert(entry);
                }
                ArcChange::Delete => {
                    self.arcs.remove(&entry);
                }
            }
        }
        Ok(results)
    }
}

/// In-memory data channel.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    /// Error to return from the next `execute`, for failure injection.
    fail_next: Mutex<Option<TesseraError>>,
    executed: Mutex<usize>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row outside any unit of work.
    pub fn insert_row(&self, id: ObjectId, values: Columns) {
        self.tables.lock().rows.insert(id, values);
    }

    /// Seed an arc outside any unit of work.
    pub fn insert_arc(&self, source: ObjectId, relationship: &str, target: ObjectId) {
        self.tables
            .lock()
            .arcs
            .insert((source, relationship.to_string(), target));
    }

    /// Stored row for an id.
    #[must_use]
    pub fn row(&self, id: &ObjectId) -> Option<Columns> {
        self.tables.lock().rows.get(id).cloned()
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.tables.lock().rows.len()
    }

    #[must_use]
    pub fn has_arc(&self, source: &ObjectId, relationship: &str, target: &ObjectId) -> bool {
        self.tables
            .lock()
            .arcs
            .contains(&(source.clone(), relationship.to_string(), target.clone()))
    }

    /// Units of work that reached `execute`, including failed ones.
    #[must_use]
    pub fn executed_units(&self) -> usize {
        *self.executed.lock()
    }

    /// Make the next `execute` fail with `error` without touching any table.
    pub fn fail_next_execute(&self, error: TesseraError) {
        *self.fail_next.lock() = Some(error);
    }
}

impl DataChannel for MemoryStore {
    fn execute(&self, work: &UnitOfWork) -> Result<Vec<RowResult>, TesseraError> {
        *self.executed.lock() += 1;
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }
        let mut tables = self.tables.lock();
        let mut staged = tables.clone();
        let results = staged.apply(work)?;
        *tables = staged;
        tracing::debug!(rows = work.rows.len(), arcs = work.arcs.len(), "memory store applied unit of work");
        Ok(results)
    }

    fn fetch(&self, query: &Query) -> Result<Vec<DataRow>, TesseraError> {
        let tables = self.tables.lock();
        let row = |id: &ObjectId| {
            tables
                .rows
                .get(id)
                .map(|values| DataRow::new(id.clone(), values.clone()))
        };
        let rows = match query {
            Query::ObjectById(id) => row(id).into_iter().collect(),
            Query::Relationship {
                source,
                relationship,
            } => tables
                .arcs
                .iter()
                .filter(|(s, r, _)| s == source && r == relationship)
                .filter_map(|(_, _, target)| row(target))
                .collect(),
            Query::Select { entity, matching } => tables
                .rows
                .iter()
                .filter(|(id, values)| id.entity() == entity && qualifies(values, matching))
                .map(|(id, values)| DataRow::new(id.clone(), values.clone()))
                .collect(),
        };
        Ok(rows)
    }

    fn generate_key(&self, entity: &EntityDescriptor, column: &str) -> Result<Value, TesseraError> {
        let mut tables = self.tables.lock();
        let next = tables
            .sequences
            .entry(sequence_name(entity.name(), column))
            .or_insert(1);
        let value = *next;
        *next = next.saturating_add(1);
        Ok(Value::Int(value))
    }
}

// =============================================================================
// TESTS
// =============================================================================
