//! # Merge
//!
//! Applies a diff that came from somewhere else (a peer context's commit,
//! or the store) to this context.
//!
//! Merged changes are not local edits: nothing is recorded, object states do
//! not move to modified, and no events are published while the merge runs.
//! A property change only lands when the local value still equals the
//! diff's old value, so unsaved local edits win over incoming ones.
//!
//! Each operation is applied on its own. A failing operation is logged and
//! counted; the rest of the diff still applies.

use crate::context::GraphState;
use crate::diff::{GraphChangeHandler, GraphDiff};
use crate::metadata::PropertyKind;
use crate::object::PersistentObject;
use crate::{ObjectId, PersistenceState, TesseraError, Value};
use std::collections::BTreeMap;

/// Outcome of a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeReport {
    /// Operations that changed local state.
    pub applied: usize,
    /// Operations about objects or holders this context does not have loaded,
    /// or property changes that lost to a local edit.
    pub ignored: usize,
    /// Operations that raised an error.
    pub failed: usize,
}

/// Whether an operation touched local state.
enum Outcome {
    Applied,
    Ignored,
}

/// Applies foreign operations to a context.
pub(crate) struct MergeHandler<'a> {
    state: &'a mut GraphState,
    last: Outcome,
}

impl MergeHandler<'_> {
    /// Apply every operation of `diff` to `state`.
    pub(crate) fn merge(state: &mut GraphState, diff: &GraphDiff) -> MergeReport {
        let mut report = MergeReport::default();
        let mut quiet = state.suppress_events();
        let mut handler = MergeHandler {
            state: &mut *quiet,
            last: Outcome::Ignored,
        };

        for operation in diff.operations() {
            handler.last = Outcome::Ignored;
            match operation.apply(&mut handler) {
                Ok(()) => match handler.last {
                    Outcome::Applied => report.applied += 1,
                    Outcome::Ignored => report.ignored += 1,
                },
                Err(error) => {
                    tracing::warn!(%error, ?operation, "merge skipped operation");
                    report.failed += 1;
                }
            }
        }

        quiet.registry.retire_pending();
        tracing::debug!(
            applied = report.applied,
            ignored = report.ignored,
            failed = report.failed,
            "merged diff"
        );
        report
    }

    fn applied(&mut self) {
        self.last = Outcome::Applied;
    }
}

impl GraphChangeHandler for MergeHandler<'_> {
    fn node_created(&mut self, id: &ObjectId) -> Result<(), TesseraError> {
        if self.state.registry.contains(id) {
            return Ok(());
        }
        let entity = self.state.resolver.entity_for(id)?;
        let object = if id.is_temporary() {
            // Not stored yet on the other side: a shadow with nothing to fault.
            let mut shadow = PersistentObject::new_object(id.clone(), &entity);
            shadow.set_state(PersistenceState::Committed);
            shadow
        } else {
            PersistentObject::hollow(id.clone(), &entity)
        };
        self.state.registry.register(object);
        self.applied();
        Ok(())
    }

    fn node_removed(&mut self, id: &ObjectId) -> Result<(), TesseraError> {
        if self.state.registry.unregister(id).is_none() {
            return Ok(());
        }
        self.state.registry.detach(id);
        self.applied();
        Ok(())
    }

    fn node_id_changed(&mut self, old: &ObjectId, new: &ObjectId) -> Result<(), TesseraError> {
        if !self.state.registry.contains(old) {
            return Ok(());
        }
        if self.state.registry.contains(new) {
            // Already known under the permanent id: drop the shadow.
            self.state.registry.unregister(old);
        }
        let mut changes = BTreeMap::new();
        changes.insert(old.clone(), new.clone());
        self.state.registry.reindex(&changes);
        self.applied();
        Ok(())
    }

    fn node_property_changed(
        &mut self,
        id: &ObjectId,
        property: &str,
        old: &Value,
        new: &Value,
    ) -> Result<(), TesseraError> {
        let Some(object) = self.state.registry.get(id) else {
            return Ok(());
        };
        if object.state() == PersistenceState::Hollow {
            return Ok(());
        }
        let entity = self.state.resolver.entity_for(id)?;
        let kind = entity.require_kind(property)?;
        if kind != PropertyKind::Attribute {
            return Err(TesseraError::PropertyKindMismatch {
                entity: entity.name().to_string(),
                property: property.to_string(),
                expected: PropertyKind::Attribute,
                actual: kind,
            });
        }
        if object.attribute(property) != old {
            tracing::debug!(%id, property, "local value differs, keeping it");
            return Ok(());
        }

        if let Some(object) = self.state.registry.get_mut(id) {
            object.put_attribute(property, new.clone());
        }
        if let Some(attribute) = entity.attribute(property) {
            self.state
                .registry
                .set_snapshot_column(id, &attribute.column, new.clone());
        }
        self.applied();
        Ok(())
    }

    fn arc_created(
        &mut self,
        source: &ObjectId,
        target: &ObjectId,
        relationship: &str,
    ) -> Result<(), TesseraError> {
        if !self.state.registry.contains(target) {
            return Ok(());
        }
        let Some(object) = self.state.registry.get_mut(source) else {
            return Ok(());
        };
        let Some(holder) = object.relationship_mut(relationship) else {
            return Err(TesseraError::UnknownProperty {
                entity: source.entity().to_string(),
                property: relationship.to_string(),
            });
        };
        if holder.link(target) {
            self.applied();
        }
        Ok(())
    }

    fn arc_deleted(
        &mut self,
        source: &ObjectId,
        target: &ObjectId,
        relationship: &str,
    ) -> Result<(), TesseraError> {
        let Some(object) = self.state.registry.get_mut(source) else {
            return Ok(());
        };
        let Some(holder) = object.relationship_mut(relationship) else {
            return Err(TesseraError::UnknownProperty {
                entity: source.entity().to_string(),
                property: relationship.to_string(),
            });
        };
        if holder.unlink(target) {
            self.applied();
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
