//! # Rollback
//!
//! Reverts uncommitted changes by replaying the recorded log backwards
//! through an [`UndoHandler`]. Undo writes go straight to the objects:
//! nothing is recorded and no change events are published.

use crate::context::GraphState;
use crate::diff::{GraphChangeHandler, GraphDiff};
use crate::events::ContextEvent;
use crate::{ObjectId, PersistenceState, TesseraError, Value};
use std::collections::BTreeMap;

/// Applies inverted operations without tracking.
struct UndoHandler<'a> {
    state: &'a mut GraphState,
}

impl GraphChangeHandler for UndoHandler<'_> {
    // Inverse of a delete.
    fn node_created(&mut self, id: &ObjectId) -> Result<(), TesseraError> {
        if let Some(object) = self.state.registry.get_mut(id) {
            if object.state() == PersistenceState::Deleted {
                object.set_state(PersistenceState::Committed);
            }
        }
        Ok(())
    }

    // Inverse of a create.
    fn node_removed(&mut self, id: &ObjectId) -> Result<(), TesseraError> {
        self.state.registry.unregister(id);
        self.state.registry.detach(id);
        Ok(())
    }

    fn node_id_changed(&mut self, old: &ObjectId, new: &ObjectId) -> Result<(), TesseraError> {
        let mut changes = BTreeMap::new();
        changes.insert(old.clone(), new.clone());
        self.state.registry.reindex(&changes);
        Ok(())
    }

    fn node_property_changed(
        &mut self,
        id: &ObjectId,
        property: &str,
        _old: &Value,
        new: &Value,
    ) -> Result<(), TesseraError> {
        if let Some(object) = self.state.registry.get_mut(id) {
            object.put_attribute(property, new.clone());
        }
        Ok(())
    }

    fn arc_created(
        &mut self,
        source: &ObjectId,
        target: &ObjectId,
        relationship: &str,
    ) -> Result<(), TesseraError> {
        if let Some(holder) = self
            .state
            .registry
            .get_mut(source)
            .and_then(|o| o.relationship_mut(relationship))
        {
            holder.link(target);
        }
        Ok(())
    }

    fn arc_deleted(
        &mut self,
        source: &ObjectId,
        target: &ObjectId,
        relationship: &str,
    ) -> Result<(), TesseraError> {
        if let Some(holder) = self
            .state
            .registry
            .get_mut(source)
            .and_then(|o| o.relationship_mut(relationship))
        {
            holder.unlink(target);
        }
        Ok(())
    }
}

/// Rollback entry point.
pub(crate) struct RollbackHandler;

impl RollbackHandler {
    /// Undo every recorded operation and return the diff that was undone.
    pub(crate) fn rollback(state: &mut GraphState) -> GraphDiff {
        let diff = state.recorder.diffs();
        if diff.is_empty() && !state.registry.has_dirty() {
            return diff;
        }

        {
            let mut quiet = state.suppress_events();
            let mut handler = UndoHandler { state: &mut *quiet };
            for operation in diff.operations().iter().rev() {
                if let Err(error) = operation.undo(&mut handler) {
                    tracing::warn!(%error, ?operation, "undo failed");
                }
            }

            let registry = &mut quiet.registry;
            for id in registry.ids_in_state(PersistenceState::New) {
                registry.unregister(&id);
                registry.detach(&id);
            }
            for id in registry.ids_in_state(PersistenceState::Modified) {
                if let Some(object) = registry.get_mut(&id) {
                    object.set_state(PersistenceState::Committed);
                }
            }
            for id in registry.ids_in_state(PersistenceState::Deleted) {
                if let Some(object) = registry.get_mut(&id) {
                    object.set_state(PersistenceState::Committed);
                }
            }
            registry.retire_pending();
            quiet.recorder.reset();
        }

        tracing::debug!(operations = diff.len(), "rolled back");
        state.publish_lifecycle(ContextEvent::Rollback(diff.clone()));
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::metadata::{EntityDescriptor, EntityResolver};
    use crate::storage::MemoryStore;
    use crate::ObjectContext;
    use std::sync::Arc;

    fn context() -> ObjectContext {
        let resolver = EntityResolver::new()
            .with_entity(
                EntityDescriptor::new("Artist")
                    .with_generated_key("ID")
                    .with_attribute("name")
                    .with_to_many("paintings", "Painting", Some("artist")),
            )
            .with_entity(
                EntityDescriptor::new("Painting")
                    .with_generated_key("ID")
                    .with_to_one("artist", "Artist", Some("paintings")),
            );
        ObjectContext::new(
            Arc::new(resolver),
            Arc::new(MemoryStore::new()),
            ContextConfig::default(),
        )
    }

    #[test]
    fn rollback_drops_new_objects() {
        let ctx = context();
        let a = ctx.new_object("Artist").expect("new");
        ctx.write_property(&a, "name", "Klee").expect("write");
        let undone = ctx.rollback_changes();

        assert_eq!(undone.len(), 2);
        assert_eq!(ctx.state(&a), PersistenceState::Transient);
        assert!(!ctx.has_changes());
    }

    #[test]
    fn rollback_restores_committed_values() {
        let ctx = context();
        let a = ctx.new_object("Artist").expect("new");
        ctx.write_property(&a, "name", "Klee").expect("write");
        let a = ctx.commit_changes().expect("commit").id_changes()[&a].clone();

        ctx.write_property(&a, "name", "Miro").expect("write");
        let p = ctx.new_object("Painting").expect("painting");
        ctx.set_to_one(&p, "artist", Some(&a)).expect("link");
        ctx.delete_object(&a).expect("delete");
        ctx.rollback_changes();

        assert_eq!(ctx.state(&a), PersistenceState::Committed);
        assert_eq!(ctx.read_property(&a, "name").expect("read"), Value::text("Klee"));
        assert!(ctx.read_to_many(&a, "paintings").expect("read").is_empty());
        assert_eq!(ctx.state(&p), PersistenceState::Transient);
    }

    #[test]
    fn rollback_event_is_published() {
        let ctx = context();
        ctx.new_object("Artist").expect("new");
        let (_, rx) = ctx.subscribe();
        ctx.rollback_changes();
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ContextEvent::Rollback(_)));
    }

    #[test]
    fn rollback_with_nothing_pending_is_silent() {
        let ctx = context();
        let (_, rx) = ctx.subscribe();
        assert!(ctx.rollback_changes().is_empty());
        assert!(rx.try_recv().is_err());
    }
}
