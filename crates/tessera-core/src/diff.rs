//! # Graph Diffs
//!
//! Every structural change to the object graph is recorded as a
//! [`GraphOperation`]. An ordered sequence of them is a [`GraphDiff`], which
//! can be replayed forward (`apply`) or backward (`undo`) through any
//! [`GraphChangeHandler`].
//!
//! Diffs are plain data: they serialize with serde so a transport can carry
//! them between contexts.

use crate::{ObjectId, TesseraError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// HANDLER
// =============================================================================

/// Receiver of replayed graph operations.
pub trait GraphChangeHandler {
    fn node_created(&mut self, id: &ObjectId) -> Result<(), TesseraError>;

    fn node_removed(&mut self, id: &ObjectId) -> Result<(), TesseraError>;

    fn node_id_changed(&mut self, old: &ObjectId, new: &ObjectId) -> Result<(), TesseraError>;

    fn node_property_changed(
        &mut self,
        id: &ObjectId,
        property: &str,
        old: &Value,
        new: &Value,
    ) -> Result<(), TesseraError>;

    fn arc_created(
        &mut self,
        source: &ObjectId,
        target: &ObjectId,
        relationship: &str,
    ) -> Result<(), TesseraError>;

    fn arc_deleted(
        &mut self,
        source: &ObjectId,
        target: &ObjectId,
        relationship: &str,
    ) -> Result<(), TesseraError>;
}

// =============================================================================
// OPERATION
// =============================================================================

/// One recorded graph mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphOperation {
    NodeCreate(ObjectId),
    NodeDelete(ObjectId),
    NodeIdChange {
        old: ObjectId,
        new: ObjectId,
    },
    NodePropertyChange {
        id: ObjectId,
        property: String,
        old: Value,
        new: Value,
    },
    ArcCreate {
        source: ObjectId,
        target: ObjectId,
        relationship: String,
    },
    ArcDelete {
        source: ObjectId,
        target: ObjectId,
        relationship: String,
    },
}

impl GraphOperation {
    /// Replay this operation forward.
    pub fn apply(&self, handler: &mut dyn GraphChangeHandler) -> Result<(), TesseraError> {
        match self {
            Self::NodeCreate(id) => handler.node_created(id),
            Self::NodeDelete(id) => handler.node_removed(id),
            Self::NodeIdChange { old, new } => handler.node_id_changed(old, new),
            Self::NodePropertyChange {
                id,
                property,
                old,
                new,
            } => handler.node_property_changed(id, property, old, new),
            Self::ArcCreate {
                source,
                target,
                relationship,
            } => handler.arc_created(source, target, relationship),
            Self::ArcDelete {
                source,
                target,
                relationship,
            } => handler.arc_deleted(source, target, relationship),
        }
    }

    /// Replay the inverse of this operation.
    pub fn undo(&self, handler: &mut dyn GraphChangeHandler) -> Result<(), TesseraError> {
        match self {
            Self::NodeCreate(id) => handler.node_removed(id),
            Self::NodeDelete(id) => handler.node_created(id),
            Self::NodeIdChange { old, new } => handler.node_id_changed(new, old),
            Self::NodePropertyChange {
                id,
                property,
                old,
                new,
            } => handler.node_property_changed(id, property, new, old),
            Self::ArcCreate {
                source,
                target,
                relationship,
            } => handler.arc_deleted(source, target, relationship),
            Self::ArcDelete {
                source,
                target,
                relationship,
            } => handler.arc_created(source, target, relationship),
        }
    }
}

// =============================================================================
// DIFF
// =============================================================================

/// An ordered, replayable sequence of graph operations.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GraphDiff {
    operations: Vec<GraphOperation>,
}

impl GraphDiff {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_operations(operations: Vec<GraphOperation>) -> Self {
        Self { operations }
    }

    /// A diff holding a single operation.
    #[must_use]
    pub fn single(operation: GraphOperation) -> Self {
        Self {
            operations: vec![operation],
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn operations(&self) -> &[GraphOperation] {
        &self.operations
    }

    pub fn push(&mut self, operation: GraphOperation) {
        self.operations.push(operation);
    }

    /// Append every operation of `other`, preserving order.
    pub fn extend(&mut self, other: GraphDiff) {
        self.operations.extend(other.operations);
    }

    #[must_use]
    pub fn into_operations(self) -> Vec<GraphOperation> {
        self.operations
    }

    /// Replay in recorded order. Stops at the first handler error.
    pub fn apply(&self, handler: &mut dyn GraphChangeHandler) -> Result<(), TesseraError> {
        for op in &self.operations {
            op.apply(handler)?;
        }
        Ok(())
    }

    /// Replay inverses in reverse order. Stops at the first handler error.
    pub fn undo(&self, handler: &mut dyn GraphChangeHandler) -> Result<(), TesseraError> {
        for op in self.operations.iter().rev() {
            op.undo(handler)?;
        }
        Ok(())
    }

    /// Temporary -> permanent id swaps contained in this diff.
    #[must_use]
    pub fn id_changes(&self) -> BTreeMap<ObjectId, ObjectId> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                GraphOperation::NodeIdChange { old, new } => Some((old.clone(), new.clone())),
                _ => None,
            })
            .collect()
    }
}

// =============================================================================
// TESTS
// =============================================================================
