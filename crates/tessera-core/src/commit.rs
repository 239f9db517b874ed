//! # Commit Pipeline
//!
//! Turns the recorded changes of a context into one [`UnitOfWork`], sends it
//! to the data channel, and reconciles local state with the result.
//!
//! ## Flow
//!
//! 1. Set the `commit` marker and publish `CommitStarted`.
//! 2. Plan: partition dirty objects, validate arcs, order inserts by key
//!    dependency, assign permanent ids, diff updates against snapshots and
//!    collapse arc operations to their net effect.
//! 3. Dispatch the unit of work (skipped when empty).
//! 4. Reconcile: swap identities, refresh snapshots, drop deleted objects,
//!    clear the recorder, publish `CommitCompleted`.
//!
//! Any error before reconciliation leaves registry and recorder as they
//! were; only the marker is removed and `CommitAborted` is published.

use crate::channel::{ArcChange, ArcOperation, RowOperation, RowResult, UnitOfWork};
use crate::context::GraphState;
use crate::diff::{GraphDiff, GraphOperation};
use crate::events::ContextEvent;
use crate::metadata::{EntityDescriptor, KeySource};
use crate::object::{PersistentObject, RelationshipValue};
use crate::primitives::COMMIT_MARKER;
use crate::registry::Snapshot;
use crate::{ObjectId, PersistenceState, TesseraError, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Where the most recent commit attempt ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPhase {
    /// No commit has run, or the last one had nothing to do.
    #[default]
    Idle,
    /// A commit is in progress.
    Started,
    Committed,
    Aborted,
}

/// Everything a commit decided before dispatch.
#[derive(Debug, Default)]
struct CommitPlan {
    /// Temporary id -> permanent id.
    ids: BTreeMap<ObjectId, ObjectId>,
    work: UnitOfWork,
    inserted: Vec<ObjectId>,
    updated: Vec<ObjectId>,
    deleted: Vec<ObjectId>,
    /// Modified objects with no column changes.
    unchanged: Vec<ObjectId>,
    /// Attribute-sourced key values the store generated.
    generated: Vec<(ObjectId, String, Value)>,
    /// Rows whose zero row count means a lost optimistic lock.
    locked: BTreeSet<ObjectId>,
}

/// Commit entry point.
pub(crate) struct CommitPipeline;

impl CommitPipeline {
    /// Commit everything recorded in `state`.
    pub(crate) fn commit(state: &mut GraphState) -> Result<GraphDiff, TesseraError> {
        if !state.registry.has_dirty() {
            // Whatever was recorded has cancelled out (e.g. new objects that
            // were deleted again).
            state.recorder.reset();
            state.phase = CommitPhase::Idle;
            return Ok(GraphDiff::new());
        }

        state.phase = CommitPhase::Started;
        let pending = state.recorder.diffs();
        tracing::debug!(operations = pending.len(), "commit started");
        state.publish_lifecycle(ContextEvent::CommitStarted(pending));
        state.recorder.set_marker(COMMIT_MARKER);

        match Self::run(state) {
            Ok(diff) => {
                state.phase = CommitPhase::Committed;
                Ok(diff)
            }
            Err(error) => {
                state.recorder.remove_marker(COMMIT_MARKER);
                state.phase = CommitPhase::Aborted;
                tracing::warn!(%error, "commit aborted");
                let pending = state.recorder.diffs();
                state.publish_lifecycle(ContextEvent::CommitAborted {
                    pending,
                    reason: error.to_string(),
                });
                Err(error)
            }
        }
    }

    fn run(state: &mut GraphState) -> Result<GraphDiff, TesseraError> {
        let plan = Self::plan(state)?;

        if plan.work.is_empty() {
            tracing::debug!("nothing to dispatch");
        } else {
            let results = state.channel.execute(&plan.work)?;
            Self::check_results(&plan, &results)?;
        }

        Self::reconcile(state, plan)
    }

    // =========================================================================
    // PLANNING
    // =========================================================================

    fn plan(state: &GraphState) -> Result<CommitPlan, TesseraError> {
        if state.config.validate_relationships {
            Self::validate_arcs(state)?;
        }

        let mut plan = CommitPlan::default();
        let new = state.registry.ids_in_state(PersistenceState::New);
        let inserts = Self::order_by_dependency(state, &new)?;
        Self::assign_ids(state, &inserts, &mut plan)?;

        for id in &inserts {
            let object = state.registry.require(id)?;
            let entity = state.resolver.entity_for(id)?;
            let permanent = plan.ids.get(id).unwrap_or(id).clone();
            let mut values = Self::columns(&entity, object);
            if let Some(key) = permanent.key_values() {
                values.extend(key.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            plan.work.rows.push(RowOperation::Insert {
                id: permanent,
                values,
            });
            plan.inserted.push(id.clone());
        }

        for id in state.registry.ids_in_state(PersistenceState::Modified) {
            let object = state.registry.require(&id)?;
            let entity = state.resolver.entity_for(&id)?;
            let current = Self::columns(&entity, object);
            let empty = Snapshot::new();
            let snapshot = state.registry.snapshot(&id).unwrap_or(&empty);

            let changed: BTreeMap<String, Value> = current
                .keys()
                .chain(snapshot.keys())
                .filter(|column| current.get(*column) != snapshot.get(*column))
                .map(|column| {
                    let value = current.get(column).cloned().unwrap_or_default();
                    (column.clone(), value)
                })
                .collect();
            if changed.is_empty() {
                plan.unchanged.push(id);
                continue;
            }
            let qualifier = Self::qualifier(&entity, &id, snapshot, &mut plan.locked);
            plan.work.rows.push(RowOperation::Update {
                id: id.clone(),
                values: changed,
                qualifier,
            });
            plan.updated.push(id);
        }

        let deleted = state.registry.ids_in_state(PersistenceState::Deleted);
        let mut deletes = Self::order_by_dependency(state, &deleted)?;
        deletes.reverse();
        for id in deletes {
            let entity = state.resolver.entity_for(&id)?;
            let empty = Snapshot::new();
            let snapshot = state.registry.snapshot(&id).unwrap_or(&empty);
            let qualifier = Self::qualifier(&entity, &id, snapshot, &mut plan.locked);
            plan.work.rows.push(RowOperation::Delete {
                id: id.clone(),
                qualifier,
            });
            plan.deleted.push(id);
        }

        plan.work.arcs = Self::net_arcs(state, &plan.ids);
        tracing::debug!(
            inserts = plan.inserted.len(),
            updates = plan.updated.len(),
            deletes = plan.deleted.len(),
            arcs = plan.work.arcs.len(),
            unchanged = plan.unchanged.len(),
            "commit planned"
        );
        Ok(plan)
    }

    /// Attribute column values of an object.
    fn columns(entity: &EntityDescriptor, object: &PersistentObject) -> Snapshot {
        entity
            .attributes()
            .filter_map(|a| {
                let value = object.attribute(&a.name);
                (!value.is_null()).then(|| (a.column.clone(), value.clone()))
            })
            .collect()
    }

    /// Primary key, plus the snapshot when the entity uses optimistic locking.
    fn qualifier(
        entity: &EntityDescriptor,
        id: &ObjectId,
        snapshot: &Snapshot,
        locked: &mut BTreeSet<ObjectId>,
    ) -> BTreeMap<String, Value> {
        let mut qualifier = id.key_values().cloned().unwrap_or_default();
        if entity.optimistic_locking() {
            for attribute in entity.attributes() {
                let value = snapshot.get(&attribute.column).cloned().unwrap_or_default();
                qualifier.insert(attribute.column.clone(), value);
            }
            locked.insert(id.clone());
        }
        qualifier
    }

    /// Every recorded arc must name a mapped relationship with a valid reverse.
    fn validate_arcs(state: &GraphState) -> Result<(), TesseraError> {
        for operation in state.recorder.diffs().operations() {
            let (GraphOperation::ArcCreate {
                source,
                relationship,
                ..
            }
            | GraphOperation::ArcDelete {
                source,
                relationship,
                ..
            }) = operation
            else {
                continue;
            };
            let entity = state.resolver.entity_for(source)?;
            let descriptor = entity.require_relationship(relationship)?;
            state.resolver.reverse_of(descriptor)?;
        }
        Ok(())
    }

    /// Order ids so that every object comes after the masters its key is
    /// propagated from. Other relationships do not constrain the order.
    /// Cycles keep id order.
    fn order_by_dependency(
        state: &GraphState,
        ids: &[ObjectId],
    ) -> Result<Vec<ObjectId>, TesseraError> {
        let members: BTreeSet<&ObjectId> = ids.iter().collect();
        let mut waiting: BTreeMap<ObjectId, BTreeSet<ObjectId>> = BTreeMap::new();
        for id in ids {
            let entity = state.resolver.entity_for(id)?;
            let mut masters = BTreeSet::new();
            if let Some(object) = state.registry.get(id) {
                for relationship in entity.master_relationships() {
                    match object.relationship(relationship) {
                        Some(RelationshipValue::ToOne(Some(master)))
                            if master != id && members.contains(master) =>
                        {
                            masters.insert(master.clone());
                        }
                        _ => {}
                    }
                }
            }
            waiting.insert(id.clone(), masters);
        }

        let mut ordered = Vec::with_capacity(ids.len());
        let mut placed = BTreeSet::new();
        loop {
            let ready: Vec<ObjectId> = waiting
                .iter()
                .filter(|(_, depends)| depends.iter().all(|d| placed.contains(d)))
                .map(|(id, _)| id.clone())
                .collect();
            if ready.is_empty() {
                break;
            }
            for id in ready {
                waiting.remove(&id);
                placed.insert(id.clone());
                ordered.push(id);
            }
        }
        if !waiting.is_empty() {
            tracing::warn!(count = waiting.len(), "key propagation cycle among committed rows");
            ordered.extend(waiting.into_keys());
        }
        Ok(ordered)
    }

    /// Build permanent ids for every temporary id in `inserts`, in order, so
    /// that propagated keys can read their master's new key.
    fn assign_ids(
        state: &GraphState,
        inserts: &[ObjectId],
        plan: &mut CommitPlan,
    ) -> Result<(), TesseraError> {
        for id in inserts.iter().filter(|id| id.is_temporary()) {
            let entity = state.resolver.entity_for(id)?;
            let object = state.registry.require(id)?;
            if entity.key_columns().is_empty() {
                return Err(TesseraError::Configuration(format!(
                    "{} has no primary key columns",
                    entity.name()
                )));
            }

            let mut key = BTreeMap::new();
            let mut missing = Vec::new();
            for column in entity.key_columns() {
                match &column.source {
                    KeySource::Attribute(attribute) => {
                        let value = object.attribute(attribute);
                        if value.is_null() {
                            missing.push(column);
                        } else {
                            key.insert(column.column.clone(), value.clone());
                        }
                    }
                    KeySource::Propagated {
                        relationship,
                        master_column,
                    } => {
                        let value = Self::master_key(object, relationship, master_column, &plan.ids)?;
                        key.insert(column.column.clone(), value);
                    }
                    KeySource::Generated => missing.push(column),
                }
            }

            match missing.as_slice() {
                [] => {}
                [column] => {
                    let value = state.channel.generate_key(&entity, &column.column)?;
                    if let KeySource::Attribute(attribute) = &column.source {
                        plan.generated
                            .push((id.clone(), attribute.clone(), value.clone()));
                    }
                    key.insert(column.column.clone(), value);
                }
                _ => {
                    return Err(TesseraError::Configuration(format!(
                        "{} has {} key columns without a value; at most one can be generated",
                        entity.name(),
                        missing.len()
                    )));
                }
            }
            plan.ids
                .insert(id.clone(), ObjectId::permanent(entity.name(), key));
        }
        Ok(())
    }

    fn master_key(
        object: &PersistentObject,
        relationship: &str,
        master_column: &str,
        assigned: &BTreeMap<ObjectId, ObjectId>,
    ) -> Result<Value, TesseraError> {
        let master = match object.relationship(relationship) {
            Some(RelationshipValue::ToOne(Some(master))) => master,
            _ => {
                return Err(TesseraError::Validation(format!(
                    "{} needs a master through {relationship:?} to build its key",
                    object.id()
                )));
            }
        };
        let master = assigned.get(master).unwrap_or(master);
        master
            .key_values()
            .and_then(|key| key.get(master_column))
            .cloned()
            .ok_or_else(|| {
                TesseraError::Configuration(format!(
                    "master {master} of {} has no key column {master_column}",
                    object.id()
                ))
            })
    }

    /// Collapse recorded arc operations to their net effect.
    ///
    /// Links and unlinks alternate per arc, so an odd count means the last
    /// operation stands and an even count cancels out.
    fn net_arcs(state: &GraphState, ids: &BTreeMap<ObjectId, ObjectId>) -> Vec<ArcOperation> {
        let mut net: BTreeMap<(ObjectId, String, ObjectId), (ArcChange, bool)> = BTreeMap::new();
        for operation in state.recorder.diffs().operations() {
            let (change, source, target, relationship) = match operation {
                GraphOperation::ArcCreate {
                    source,
                    target,
                    relationship,
                } => (ArcChange::Create, source, target, relationship),
                GraphOperation::ArcDelete {
                    source,
                    target,
                    relationship,
                } => (ArcChange::Delete, source, target, relationship),
                _ => continue,
            };
            let entry = net
                .entry((source.clone(), relationship.clone(), target.clone()))
                .or_insert((change, false));
            *entry = (change, !entry.1);
        }

        net.into_iter()
            .filter(|(_, (_, odd))| *odd)
            .filter(|((source, _, target), _)| {
                state.registry.contains(source) && state.registry.contains(target)
            })
            .map(|((source, relationship, target), (change, _))| ArcOperation {
                change,
                source: ids.get(&source).cloned().unwrap_or(source),
                target: ids.get(&target).cloned().unwrap_or(target),
                relationship,
            })
            .collect()
    }

    /// Zero-row results on locked rows are lock failures.
    fn check_results(plan: &CommitPlan, results: &[RowResult]) -> Result<(), TesseraError> {
        for result in results.iter().filter(|r| r.affected == 0) {
            if plan.locked.contains(&result.id) {
                return Err(TesseraError::OptimisticLockFailure(result.id.clone()));
            }
            tracing::warn!(id = %result.id, "row operation affected no rows");
        }
        Ok(())
    }

    // =========================================================================
    // RECONCILIATION
    // =========================================================================

    fn reconcile(state: &mut GraphState, plan: CommitPlan) -> Result<GraphDiff, TesseraError> {
        for id in &plan.unchanged {
            if let Some(object) = state.registry.get_mut(id) {
                object.set_state(PersistenceState::Committed);
            }
        }
        // Recorded after the commit marker, so they end up in the
        // `CommitCompleted` payload rather than in a `Change` event.
        for (old, new) in &plan.ids {
            state.recorder.add(GraphOperation::NodeIdChange {
                old: old.clone(),
                new: new.clone(),
            });
        }
        state.registry.reindex(&plan.ids);

        for (id, attribute, value) in &plan.generated {
            if let Some(object) = state.registry.get_mut(id) {
                object.put_attribute(attribute, value.clone());
            }
        }
        for id in plan.inserted.iter().chain(&plan.updated) {
            let entity = state.resolver.entity_for(id)?;
            if let Some(object) = state.registry.get_mut(id) {
                object.set_state(PersistenceState::Committed);
                let snapshot = Self::columns(&entity, object);
                state.registry.set_snapshot(id, snapshot);
            }
        }
        for id in &plan.deleted {
            state.registry.unregister(id);
            state.registry.detach(id);
        }

        let completed = state.recorder.take_after_marker(COMMIT_MARKER);
        let mut committed = state.recorder.diffs();
        state.recorder.reset();
        committed.extend(completed.clone());
        let retired = state.registry.retire_pending();

        tracing::info!(
            inserted = plan.inserted.len(),
            updated = plan.updated.len(),
            deleted = plan.deleted.len(),
            retired,
            "commit completed"
        );
        state.publish_lifecycle(ContextEvent::CommitCompleted(completed));
        Ok(committed)
    }
}

// =============================================================================
// TESTS
// =============================================================================
