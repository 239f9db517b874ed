//! # Data Channel
//!
//! The storage contract the core dispatches to.
//!
//! A [`DataChannel`] is whatever sits between the object graph and stored
//! rows: a SQL translation layer over a connection, a parent cache, or one of
//! the reference stores in [`crate::storage`]. The core hands it one
//! [`UnitOfWork`] per commit and expects all-or-nothing execution.
//!
//! Row values are keyed by column name, never by attribute name.

use crate::metadata::EntityDescriptor;
use crate::{ObjectId, TesseraError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// ROWS AND QUERIES
// =============================================================================

/// One stored row: its id and column values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRow {
    pub id: ObjectId,
    pub values: BTreeMap<String, Value>,
}

impl DataRow {
    #[must_use]
    pub fn new(id: ObjectId, values: BTreeMap<String, Value>) -> Self {
        Self { id, values }
    }

    /// Column values translated to attribute names.
    ///
    /// Columns the entity does not map as attributes are dropped.
    #[must_use]
    pub fn attributes(&self, entity: &EntityDescriptor) -> BTreeMap<String, Value> {
        entity
            .attributes()
            .filter_map(|a| {
                self.values
                    .get(&a.column)
                    .filter(|v| !v.is_null())
                    .map(|v| (a.name.clone(), v.clone()))
            })
            .collect()
    }
}

/// The fetches the core issues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Query {
    /// The row for one id (resolves hollow objects).
    ObjectById(ObjectId),
    /// Rows related to `source` through `relationship` (resolves faults).
    Relationship {
        source: ObjectId,
        relationship: String,
    },
    /// Rows of an entity whose columns equal every value in `matching`.
    Select {
        entity: String,
        matching: BTreeMap<String, Value>,
    },
}

// =============================================================================
// UNIT OF WORK
// =============================================================================

/// One row-level change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowOperation {
    Insert {
        id: ObjectId,
        values: BTreeMap<String, Value>,
    },
    /// `values` holds only changed columns. A non-empty `qualifier` must
    /// match the stored row for the update to apply.
    Update {
        id: ObjectId,
        values: BTreeMap<String, Value>,
        qualifier: BTreeMap<String, Value>,
    },
    Delete {
        id: ObjectId,
        qualifier: BTreeMap<String, Value>,
    },
}

impl RowOperation {
    #[must_use]
    pub fn id(&self) -> &ObjectId {
        match self {
            Self::Insert { id, .. } | Self::Update { id, .. } | Self::Delete { id, .. } => id,
        }
    }
}

/// Direction of an arc change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ArcChange {
    Create,
    Delete,
}

/// One relationship-level change.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArcOperation {
    pub change: ArcChange,
    pub source: ObjectId,
    pub target: ObjectId,
    pub relationship: String,
}

/// Everything one commit sends to the store, in execution order:
/// row operations first (inserts, updates, deletes), then arcs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnitOfWork {
    pub rows: Vec<RowOperation>,
    pub arcs: Vec<ArcOperation>,
}

impl UnitOfWork {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.arcs.is_empty()
    }

    pub fn inserts(&self) -> impl Iterator<Item = &RowOperation> {
        self.rows
            .iter()
            .filter(|r| matches!(r, RowOperation::Insert { .. }))
    }

    pub fn updates(&self) -> impl Iterator<Item = &RowOperation> {
        self.rows
            .iter()
            .filter(|r| matches!(r, RowOperation::Update { .. }))
    }

    pub fn deletes(&self) -> impl Iterator<Item = &RowOperation> {
        self.rows
            .iter()
            .filter(|r| matches!(r, RowOperation::Delete { .. }))
    }
}

/// Per-row outcome reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowResult {
    pub id: ObjectId,
    pub affected: u64,
}

// =============================================================================
// CHANNEL TRAIT
// =============================================================================

/// The store-side collaborator.
///
/// All methods are blocking. Implementations must apply a unit of work
/// atomically: either every row and arc change lands, or none does.
pub trait DataChannel: Send + Sync {
    /// Execute a unit of work, returning one result per row operation.
    fn execute(&self, work: &UnitOfWork) -> Result<Vec<RowResult>, TesseraError>;

    /// Run a query.
    fn fetch(&self, query: &Query) -> Result<Vec<DataRow>, TesseraError>;

    /// Produce a value for an ungenerated key column.
    fn generate_key(&self, entity: &EntityDescriptor, column: &str) -> Result<Value, TesseraError>;
}

// =============================================================================
// TESTS
// =============================================================================
