//! # Faults
//!
//! Lazy loading. A relationship holder starts as [`RelationshipValue::Fault`]
//! on fetched objects and is resolved through the data channel on first
//! access. Hollow objects are loaded by id the same way.
//!
//! Rows returned by a fetch are registered through [`Faults::register_row`],
//! which reuses the registered object for an id instead of creating a second
//! one.

use crate::channel::{DataRow, Query};
use crate::context::GraphState;
use crate::metadata::{EntityDescriptor, PropertyKind};
use crate::object::{PersistentObject, RelationshipValue};
use crate::registry::Snapshot;
use crate::{ObjectId, PersistenceState, TesseraError, Value};

/// Fault resolution and row registration.
pub(crate) struct Faults;

impl Faults {
    /// Fail unless `property` on `id`'s entity has the expected kind.
    pub(crate) fn expect_kind(
        state: &GraphState,
        id: &ObjectId,
        property: &str,
        expected: PropertyKind,
    ) -> Result<(), TesseraError> {
        let entity = state.resolver.entity_for(id)?;
        let actual = entity.require_kind(property)?;
        if actual != expected {
            return Err(TesseraError::PropertyKindMismatch {
                entity: entity.name().to_string(),
                property: property.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Attribute columns of a row, keyed by column name.
    pub(crate) fn snapshot_of(entity: &EntityDescriptor, row: &DataRow) -> Snapshot {
        entity
            .attributes()
            .filter_map(|a| {
                row.values
                    .get(&a.column)
                    .filter(|v| !v.is_null())
                    .map(|v| (a.column.clone(), v.clone()))
            })
            .collect()
    }

    /// Register a fetched row and return the id it is registered under.
    ///
    /// Hollow and committed objects are refreshed from the row; new,
    /// modified and deleted objects keep their local values.
    pub(crate) fn register_row(
        state: &mut GraphState,
        row: &DataRow,
    ) -> Result<ObjectId, TesseraError> {
        let entity = state.resolver.entity_for(&row.id)?;
        let attributes = row.attributes(&entity);
        let snapshot = Self::snapshot_of(&entity, row);

        if let Some(object) = state.registry.get_mut(&row.id) {
            let id = object.id().clone();
            match object.state() {
                PersistenceState::Hollow | PersistenceState::Committed => {
                    object.replace_attributes(attributes);
                    object.set_state(PersistenceState::Committed);
                    state.registry.set_snapshot(&id, snapshot);
                }
                _ => {}
            }
            return Ok(id);
        }

        state.registry.register(PersistentObject::fetched(
            row.id.clone(),
            &entity,
            attributes,
        ));
        state.registry.set_snapshot(&row.id, snapshot);
        Ok(row.id.clone())
    }

    /// Load a hollow object's values. Other states are left alone.
    pub(crate) fn ensure_loaded(state: &mut GraphState, id: &ObjectId) -> Result<(), TesseraError> {
        if state.registry.require(id)?.state() != PersistenceState::Hollow {
            return Ok(());
        }
        let rows = state.channel.fetch(&Query::ObjectById(id.clone()))?;
        match rows.as_slice() {
            [] => Err(TesseraError::ObjectNotFound(id.clone())),
            [row] => {
                tracing::trace!(%id, "resolved hollow object");
                let row = DataRow::new(id.clone(), row.values.clone());
                Self::register_row(state, &row).map(|_| ())
            }
            _ => Err(TesseraError::FaultFailure {
                id: id.clone(),
                detail: format!("{} rows matched a single id", rows.len()),
            }),
        }
    }

    /// Resolve a relationship holder if it is still a fault.
    pub(crate) fn resolve_relationship(
        state: &mut GraphState,
        id: &ObjectId,
        relationship: &str,
    ) -> Result<(), TesseraError> {
        Self::ensure_loaded(state, id)?;
        let entity = state.resolver.entity_for(id)?;
        let descriptor = entity.require_relationship(relationship)?;

        let object = state.registry.require(id)?;
        let holder_id = object.id().clone();
        match object.relationship(relationship) {
            Some(value) if !value.is_fault() => return Ok(()),
            _ => {}
        }

        // Objects without a stored row have nothing to fetch.
        if holder_id.is_temporary() {
            state
                .registry
                .require_mut(&holder_id)?
                .set_relationship(relationship, RelationshipValue::empty(descriptor.kind()));
            return Ok(());
        }

        let rows = state.channel.fetch(&Query::Relationship {
            source: holder_id.clone(),
            relationship: relationship.to_string(),
        })?;
        if !descriptor.to_many && rows.len() > 1 {
            return Err(TesseraError::FaultFailure {
                id: holder_id,
                detail: format!(
                    "to-one relationship {relationship:?} resolved to {} rows",
                    rows.len()
                ),
            });
        }

        let mut targets = Vec::with_capacity(rows.len());
        for row in &rows {
            targets.push(Self::register_row(state, row)?);
        }
        let value = if descriptor.to_many {
            RelationshipValue::ToMany(targets)
        } else {
            RelationshipValue::ToOne(targets.into_iter().next())
        };
        tracing::trace!(id = %holder_id, relationship, "resolved relationship fault");
        state
            .registry
            .require_mut(&holder_id)?
            .set_relationship(relationship, value);
        Ok(())
    }

    // -------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------

    pub(crate) fn read_attribute(
        state: &mut GraphState,
        id: &ObjectId,
        property: &str,
    ) -> Result<Value, TesseraError> {
        Self::expect_kind(state, id, property, PropertyKind::Attribute)?;
        Self::ensure_loaded(state, id)?;
        Ok(state.registry.require(id)?.attribute(property).clone())
    }

    pub(crate) fn read_to_one(
        state: &mut GraphState,
        id: &ObjectId,
        relationship: &str,
    ) -> Result<Option<ObjectId>, TesseraError> {
        Self::expect_kind(state, id, relationship, PropertyKind::ToOne)?;
        Self::resolve_relationship(state, id, relationship)?;
        Ok(Self::targets(state, id, relationship)?.into_iter().next())
    }

    pub(crate) fn read_to_many(
        state: &mut GraphState,
        id: &ObjectId,
        relationship: &str,
    ) -> Result<Vec<ObjectId>, TesseraError> {
        Self::expect_kind(state, id, relationship, PropertyKind::ToMany)?;
        Self::resolve_relationship(state, id, relationship)?;
        Self::targets(state, id, relationship)
    }

    /// Resolved targets of a relationship holder.
    pub(crate) fn targets(
        state: &GraphState,
        id: &ObjectId,
        relationship: &str,
    ) -> Result<Vec<ObjectId>, TesseraError> {
        Ok(state
            .registry
            .require(id)?
            .relationship(relationship)
            .map(RelationshipValue::targets)
            .unwrap_or_default())
    }

    /// Run a query and register every returned row.
    pub(crate) fn select(
        state: &mut GraphState,
        query: &Query,
    ) -> Result<Vec<ObjectId>, TesseraError> {
        if let Query::Select { entity, .. } = query {
            state.resolver.entity(entity)?;
        }
        let rows = state.channel.fetch(query)?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            ids.push(Self::register_row(state, row)?);
        }
        tracing::debug!(rows = ids.len(), "query registered rows");
        Ok(ids)
    }
}
