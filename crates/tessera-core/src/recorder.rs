//! # Operation Recorder
//!
//! The ordered log of graph operations accumulated since the last commit or
//! rollback. Named markers split the log without discarding history:
//! a flush moves the `flush` marker, a commit sets the `commit` marker so
//! that operations recorded while it runs can be told apart.

use crate::diff::{GraphDiff, GraphOperation};
use std::collections::BTreeMap;

/// Ordered operation log with named checkpoints.
#[derive(Debug, Clone, Default)]
pub struct OperationRecorder {
    operations: Vec<GraphOperation>,
    /// Marker name -> index of the first operation recorded after it.
    markers: BTreeMap<String, usize>,
}

impl OperationRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation.
    pub fn add(&mut self, operation: GraphOperation) {
        self.operations.push(operation);
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.operations.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Every recorded operation, in order.
    #[must_use]
    pub fn diffs(&self) -> GraphDiff {
        GraphDiff::from_operations(self.operations.clone())
    }

    /// Place (or move) a marker at the current end of the log.
    pub fn set_marker(&mut self, name: &str) {
        self.markers.insert(name.to_string(), self.operations.len());
    }

    pub fn remove_marker(&mut self, name: &str) {
        self.markers.remove(name);
    }

    #[must_use]
    pub fn has_marker(&self, name: &str) -> bool {
        self.markers.contains_key(name)
    }

    /// Operations recorded since the marker; the whole log if it is unset.
    #[must_use]
    pub fn size_after_marker(&self, name: &str) -> usize {
        self.operations.len() - self.marker_index(name)
    }

    /// Copy of the operations recorded since the marker.
    #[must_use]
    pub fn diffs_after_marker(&self, name: &str) -> GraphDiff {
        let start = self.marker_index(name);
        GraphDiff::from_operations(self.operations[start..].to_vec())
    }

    /// Remove and return the operations recorded since the marker.
    ///
    /// Other markers past the cut are pulled back to the new end of the log.
    pub fn take_after_marker(&mut self, name: &str) -> GraphDiff {
        let start = self.marker_index(name);
        let taken = self.operations.split_off(start);
        for index in self.markers.values_mut() {
            if *index > start {
                *index = start;
            }
        }
        GraphDiff::from_operations(taken)
    }

    /// Drop every operation and marker.
    pub fn reset(&mut self) {
        self.operations.clear();
        self.markers.clear();
    }

    fn marker_index(&self, name: &str) -> usize {
        self.markers
            .get(name)
            .copied()
            .unwrap_or(0)
            .min(self.operations.len())
    }
}

// =============================================================================
// TESTS
// =============================================================================
