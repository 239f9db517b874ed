//! # Change Interceptor
//!
//! Tracked mutations. Every change to a registered object goes through here:
//! the object's state advances, the operation is recorded, and for
//! relationships the reverse side is kept consistent.
//!
//! ## Reverse propagation
//!
//! A relationship change made with [`Cascade::Propagate`] updates the
//! reverse relationship with [`Cascade::Suppress`], so the reverse update
//! does not bounce back. The token is an explicit argument; there is no
//! hidden per-thread state.

use crate::context::GraphState;
use crate::diff::GraphOperation;
use crate::fault::Faults;
use crate::metadata::{DeleteRule, PropertyKind, RelationshipDescriptor};
use crate::primitives::MAX_CASCADE_DEPTH;
use crate::{ObjectId, PersistenceState, TesseraError, Value};

/// Whether a relationship change should also update its reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cascade {
    /// Update the reverse relationship as well.
    Propagate,
    /// Change only the named side.
    Suppress,
}

/// Tracked mutation entry points.
pub(crate) struct ChangeInterceptor;

impl ChangeInterceptor {
    // =========================================================================
    // ATTRIBUTES
    // =========================================================================

    /// Write an attribute. Equal values are a no-op.
    pub(crate) fn write_attribute(
        state: &mut GraphState,
        id: &ObjectId,
        property: &str,
        value: Value,
    ) -> Result<(), TesseraError> {
        Faults::expect_kind(state, id, property, PropertyKind::Attribute)?;
        Self::require_writable(state, id, "modify")?;
        Faults::ensure_loaded(state, id)?;

        let object = state.registry.require_mut(id)?;
        let old = object.attribute(property).clone();
        if old == value {
            return Ok(());
        }
        object.put_attribute(property, value.clone());
        object.touch();
        let id = object.id().clone();
        state.record(GraphOperation::NodePropertyChange {
            id,
            property: property.to_string(),
            old,
            new: value,
        });
        Ok(())
    }

    // =========================================================================
    // RELATIONSHIPS
    // =========================================================================

    /// Set or clear a to-one relationship.
    pub(crate) fn set_to_one(
        state: &mut GraphState,
        id: &ObjectId,
        relationship: &str,
        target: Option<&ObjectId>,
    ) -> Result<(), TesseraError> {
        Faults::expect_kind(state, id, relationship, PropertyKind::ToOne)?;
        Faults::resolve_relationship(state, id, relationship)?;
        let current = Faults::targets(state, id, relationship)?.into_iter().next();
        match (current, target) {
            (_, Some(target)) => Self::link(state, id, relationship, target, Cascade::Propagate),
            (Some(current), None) => {
                Self::unlink(state, id, relationship, &current, Cascade::Propagate)
            }
            (None, None) => Ok(()),
        }
    }

    /// Point `relationship` on `source` at `target`.
    ///
    /// A to-one relationship lets go of its previous target first. When the
    /// reverse is to-one, `target` is detached from its previous owner.
    pub(crate) fn link(
        state: &mut GraphState,
        source: &ObjectId,
        relationship: &str,
        target: &ObjectId,
        cascade: Cascade,
    ) -> Result<(), TesseraError> {
        let descriptor = Self::relationship(state, source, relationship)?;
        Self::check_target(state, &descriptor, target)?;
        Self::require_writable(state, source, "relate")?;
        Self::require_writable(state, target, "relate to")?;
        Faults::resolve_relationship(state, source, relationship)?;

        let source = state.registry.require(source)?.id().clone();
        let target = state.registry.require(target)?.id().clone();
        let current = Faults::targets(state, &source, relationship)?;
        if current.contains(&target) {
            return Ok(());
        }
        if !descriptor.to_many {
            if let Some(previous) = current.first() {
                Self::unlink(state, &source, relationship, previous, cascade)?;
            }
        }

        let reverse = match cascade {
            Cascade::Propagate => Self::reverse(state, &descriptor),
            Cascade::Suppress => None,
        };
        if let Some(reverse) = &reverse {
            Faults::resolve_relationship(state, &target, &reverse.name)?;
            if !reverse.to_many {
                let owners = Faults::targets(state, &target, &reverse.name)?;
                if let Some(owner) = owners.first().filter(|o| **o != source) {
                    Self::unlink(state, owner, relationship, &target, Cascade::Suppress)?;
                }
            }
        }

        let object = state.registry.require_mut(&source)?;
        if let Some(holder) = object.relationship_mut(relationship) {
            holder.link(&target);
        }
        object.touch();
        state.record(GraphOperation::ArcCreate {
            source: source.clone(),
            target: target.clone(),
            relationship: relationship.to_string(),
        });

        if let Some(reverse) = reverse {
            Self::link(state, &target, &reverse.name, &source, Cascade::Suppress)?;
        }
        Ok(())
    }

    /// Remove `target` from `relationship` on `source`.
    pub(crate) fn unlink(
        state: &mut GraphState,
        source: &ObjectId,
        relationship: &str,
        target: &ObjectId,
        cascade: Cascade,
    ) -> Result<(), TesseraError> {
        let descriptor = Self::relationship(state, source, relationship)?;
        Faults::resolve_relationship(state, source, relationship)?;

        let object = state.registry.require_mut(source)?;
        let changed = object
            .relationship_mut(relationship)
            .is_some_and(|holder| holder.unlink(target));
        if !changed {
            return Ok(());
        }
        object.touch();
        let source = object.id().clone();
        state.record(GraphOperation::ArcDelete {
            source: source.clone(),
            target: target.clone(),
            relationship: relationship.to_string(),
        });

        if cascade == Cascade::Propagate && state.registry.contains(target) {
            if let Some(reverse) = Self::reverse(state, &descriptor) {
                Self::unlink(state, target, &reverse.name, &source, Cascade::Suppress)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // DELETION
    // =========================================================================

    /// Schedule `id` for deletion, applying each relationship's delete rule.
    pub(crate) fn delete_object(state: &mut GraphState, id: &ObjectId) -> Result<(), TesseraError> {
        Self::delete_at_depth(state, id, 0)
    }

    fn delete_at_depth(
        state: &mut GraphState,
        id: &ObjectId,
        depth: usize,
    ) -> Result<(), TesseraError> {
        match state.registry.state_of(id) {
            PersistenceState::Transient | PersistenceState::Deleted => return Ok(()),
            _ => {}
        }
        if depth > MAX_CASCADE_DEPTH {
            return Err(TesseraError::Validation(format!(
                "cascade delete from {id} exceeded depth {MAX_CASCADE_DEPTH}"
            )));
        }
        Faults::ensure_loaded(state, id)?;
        let id = state.registry.require(id)?.id().clone();
        let entity = state.resolver.entity_for(&id)?;

        // Deny rules are checked before anything changes.
        for rel in entity
            .relationships()
            .filter(|r| r.delete_rule == DeleteRule::Deny)
        {
            Faults::resolve_relationship(state, &id, &rel.name)?;
            if !Faults::targets(state, &id, &rel.name)?.is_empty() {
                return Err(TesseraError::DeleteDenied {
                    id,
                    relationship: rel.name.clone(),
                });
            }
        }

        for rel in entity.relationships() {
            match rel.delete_rule {
                DeleteRule::NoAction | DeleteRule::Deny => {}
                DeleteRule::Nullify => {
                    Faults::resolve_relationship(state, &id, &rel.name)?;
                    for target in Faults::targets(state, &id, &rel.name)? {
                        Self::unlink(state, &id, &rel.name, &target, Cascade::Propagate)?;
                    }
                }
                DeleteRule::Cascade => {
                    Faults::resolve_relationship(state, &id, &rel.name)?;
                    for target in Faults::targets(state, &id, &rel.name)? {
                        Self::unlink(state, &id, &rel.name, &target, Cascade::Propagate)?;
                        Self::delete_at_depth(state, &target, depth + 1)?;
                    }
                }
            }
        }

        if state.registry.state_of(&id) == PersistenceState::New {
            // Never stored: drop it outright.
            state.registry.unregister(&id);
            state.registry.detach(&id);
            tracing::trace!(%id, "dropped new object");
            return Ok(());
        }
        state
            .registry
            .require_mut(&id)?
            .set_state(PersistenceState::Deleted);
        state.record(GraphOperation::NodeDelete(id));
        Ok(())
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn relationship(
        state: &GraphState,
        source: &ObjectId,
        relationship: &str,
    ) -> Result<RelationshipDescriptor, TesseraError> {
        let entity = state.resolver.entity_for(source)?;
        let kind = entity.require_kind(relationship)?;
        if kind == PropertyKind::Attribute {
            return Err(TesseraError::PropertyKindMismatch {
                entity: entity.name().to_string(),
                property: relationship.to_string(),
                expected: PropertyKind::ToOne,
                actual: kind,
            });
        }
        entity.require_relationship(relationship).cloned()
    }

    fn check_target(
        state: &GraphState,
        descriptor: &RelationshipDescriptor,
        target: &ObjectId,
    ) -> Result<(), TesseraError> {
        if target.entity() != descriptor.target {
            return Err(TesseraError::Validation(format!(
                "relationship {:?} expects {}, got {target}",
                descriptor.name, descriptor.target
            )));
        }
        state.registry.require(target).map(|_| ())
    }

    fn require_writable(
        state: &GraphState,
        id: &ObjectId,
        operation: &'static str,
    ) -> Result<(), TesseraError> {
        match state.registry.state_of(id) {
            PersistenceState::Transient => Err(TesseraError::UnknownObject(id.clone())),
            PersistenceState::Deleted => Err(TesseraError::InvalidState {
                id: id.clone(),
                state: PersistenceState::Deleted,
                operation,
            }),
            _ => Ok(()),
        }
    }

    /// Reverse descriptor. A broken reverse mapping skips propagation here;
    /// commit validation reports it.
    fn reverse(
        state: &GraphState,
        descriptor: &RelationshipDescriptor,
    ) -> Option<RelationshipDescriptor> {
        match state.resolver.reverse_of(descriptor) {
            Ok(reverse) => reverse,
            Err(error) => {
                tracing::warn!(relationship = %descriptor.name, %error, "reverse not propagated");
                None
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::metadata::{EntityDescriptor, EntityResolver};
    use crate::storage::MemoryStore;
    use crate::ObjectContext;
    use std::sync::Arc;

    fn gallery_context() -> ObjectContext {
        let resolver = EntityResolver::new()
            .with_entity(
                EntityDescriptor::new("Artist")
                    .with_generated_key("ID")
                    .with_attribute("name")
                    .with_relationship("paintings", "Painting", Some("artist"), true, DeleteRule::Cascade),
            )
            .with_entity(
                EntityDescriptor::new("Painting")
                    .with_generated_key("ID")
                    .with_attribute("title")
                    .with_to_one("artist", "Artist", Some("paintings")),
            )
            .with_entity(
                EntityDescriptor::new("Person")
                    .with_generated_key("ID")
                    .with_to_one("passport", "Passport", Some("holder")),
            )
            .with_entity(
                EntityDescriptor::new("Passport")
                    .with_generated_key("ID")
                    .with_to_one("holder", "Person", Some("passport")),
            );
        ObjectContext::new(
            Arc::new(resolver),
            Arc::new(MemoryStore::new()),
            ContextConfig::default(),
        )
    }

    #[test]
    fn to_one_updates_reverse_to_many() {
        let ctx = gallery_context();
        let a = ctx.new_object("Artist").expect("artist");
        let p = ctx.new_object("Painting").expect("painting");
        ctx.set_to_one(&p, "artist", Some(&a)).expect("link");

        assert_eq!(ctx.read_to_many(&a, "paintings").expect("read"), vec![p.clone()]);
        let arcs = ctx
            .uncommitted_diff()
            .operations()
            .iter()
            .filter(|op| matches!(op, GraphOperation::ArcCreate { .. }))
            .count();
        assert_eq!(arcs, 2);
    }

    #[test]
    fn moving_to_one_detaches_from_previous_owner() {
        let ctx = gallery_context();
        let a1 = ctx.new_object("Artist").expect("a1");
        let a2 = ctx.new_object("Artist").expect("a2");
        let p = ctx.new_object("Painting").expect("p");
        ctx.add_to_many(&a1, "paintings", &p).expect("add");
        ctx.add_to_many(&a2, "paintings", &p).expect("move");

        assert!(ctx.read_to_many(&a1, "paintings").expect("a1").is_empty());
        assert_eq!(ctx.read_to_many(&a2, "paintings").expect("a2"), vec![p.clone()]);
        assert_eq!(ctx.read_to_one(&p, "artist").expect("p"), Some(a2));
    }

    #[test]
    fn one_to_one_steals_target() {
        let ctx = gallery_context();
        let alice = ctx.new_object("Person").expect("alice");
        let bob = ctx.new_object("Person").expect("bob");
        let passport = ctx.new_object("Passport").expect("passport");
        ctx.set_to_one(&alice, "passport", Some(&passport)).expect("alice");
        ctx.set_to_one(&bob, "passport", Some(&passport)).expect("bob");

        assert_eq!(ctx.read_to_one(&alice, "passport").expect("alice"), None);
        assert_eq!(ctx.read_to_one(&passport, "holder").expect("holder"), Some(bob));
    }

    #[test]
    fn equal_write_records_nothing() {
        let ctx = gallery_context();
        let a = ctx.new_object("Artist").expect("artist");
        ctx.write_property(&a, "name", "Degas").expect("write");
        let before = ctx.uncommitted_diff().len();
        ctx.write_property(&a, "name", "Degas").expect("write again");
        assert_eq!(ctx.uncommitted_diff().len(), before);
    }

    #[test]
    fn attribute_write_to_relationship_rejected() {
        let ctx = gallery_context();
        let a = ctx.new_object("Artist").expect("artist");
        assert!(matches!(
            ctx.write_property(&a, "paintings", 1_i64),
            Err(TesseraError::PropertyKindMismatch { .. })
        ));
        assert!(matches!(
            ctx.write_property(&a, "age", 1_i64),
            Err(TesseraError::UnknownProperty { .. })
        ));
    }

    #[test]
    fn cascade_delete_of_new_objects_drops_them() {
        let ctx = gallery_context();
        let a = ctx.new_object("Artist").expect("artist");
        let p = ctx.new_object("Painting").expect("painting");
        ctx.add_to_many(&a, "paintings", &p).expect("add");
        ctx.delete_object(&a).expect("delete");

        assert_eq!(ctx.state(&a), PersistenceState::Transient);
        assert_eq!(ctx.state(&p), PersistenceState::Transient);
        assert_eq!(ctx.registered_count(), 0);
    }

    #[test]
    fn wrong_target_entity_rejected() {
        let ctx = gallery_context();
        let a = ctx.new_object("Artist").expect("artist");
        let other = ctx.new_object("Artist").expect("other");
        assert!(matches!(
            ctx.add_to_many(&a, "paintings", &other),
            Err(TesseraError::Validation(_))
        ));
    }
}
