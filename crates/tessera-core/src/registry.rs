//! # Object Registry
//!
//! Identity map from [`ObjectId`] to the live [`PersistentObject`], plus the
//! snapshot cache used as the diff baseline at commit.
//!
//! ## Identity swaps
//!
//! When an object's id changes (temporary -> permanent), the registry moves
//! the object, its snapshot, and every relationship reference held by other
//! objects in one call. The old id stays resolvable as a *retiring alias*
//! until [`ObjectRegistry::retire_pending`] runs, so operations still queued
//! under the old id can find their object.

use crate::object::PersistentObject;
use crate::{ObjectId, PersistenceState, TesseraError, Value};
use std::collections::BTreeMap;

/// Last known stored column values of one object.
pub type Snapshot = BTreeMap<String, Value>;

/// Identity map and snapshot cache.
#[derive(Debug, Clone, Default)]
pub struct ObjectRegistry {
    objects: BTreeMap<ObjectId, PersistentObject>,
    snapshots: BTreeMap<ObjectId, Snapshot>,
    /// Old id -> new id, kept until the current diff is fully processed.
    retiring: BTreeMap<ObjectId, ObjectId>,
}

impl ObjectRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Follow a retiring alias, if any.
    #[must_use]
    pub fn resolve<'a>(&'a self, id: &'a ObjectId) -> &'a ObjectId {
        self.retiring.get(id).unwrap_or(id)
    }

    #[must_use]
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(self.resolve(id))
    }

    #[must_use]
    pub fn get(&self, id: &ObjectId) -> Option<&PersistentObject> {
        self.objects.get(self.resolve(id))
    }

    pub fn get_mut(&mut self, id: &ObjectId) -> Option<&mut PersistentObject> {
        let key = self.resolve(id).clone();
        self.objects.get_mut(&key)
    }

    /// Registered object, or `UnknownObject`.
    pub fn require(&self, id: &ObjectId) -> Result<&PersistentObject, TesseraError> {
        self.get(id)
            .ok_or_else(|| TesseraError::UnknownObject(id.clone()))
    }

    /// Registered object, or `UnknownObject`.
    pub fn require_mut(&mut self, id: &ObjectId) -> Result<&mut PersistentObject, TesseraError> {
        self.get_mut(id)
            .ok_or_else(|| TesseraError::UnknownObject(id.clone()))
    }

    /// State of an id; unregistered ids are transient.
    #[must_use]
    pub fn state_of(&self, id: &ObjectId) -> PersistenceState {
        self.get(id)
            .map(PersistentObject::state)
            .unwrap_or(PersistenceState::Transient)
    }

    /// Register an object under its own id, returning any object it replaced.
    pub fn register(&mut self, object: PersistentObject) -> Option<PersistentObject> {
        self.objects.insert(object.id().clone(), object)
    }

    /// Remove an object and its snapshot.
    ///
    /// References held by other objects are left alone; see [`Self::detach`].
    pub fn unregister(&mut self, id: &ObjectId) -> Option<PersistentObject> {
        let key = self.resolve(id).clone();
        self.snapshots.remove(&key);
        self.objects.remove(&key)
    }

    /// Drop every relationship reference to `target` held by other objects.
    pub fn detach(&mut self, target: &ObjectId) {
        for object in self.objects.values_mut() {
            object.forget(target);
        }
    }

    /// Move objects from old ids to new ids.
    ///
    /// Objects, snapshots and all relationship references are rewritten.
    /// Old ids remain resolvable until [`Self::retire_pending`].
    pub fn reindex(&mut self, changes: &BTreeMap<ObjectId, ObjectId>) {
        if changes.is_empty() {
            return;
        }
        for (old, new) in changes {
            if let Some(mut object) = self.objects.remove(old) {
                object.set_id(new.clone());
                self.objects.insert(new.clone(), object);
            }
            if let Some(snapshot) = self.snapshots.remove(old) {
                self.snapshots.insert(new.clone(), snapshot);
            }
            self.retiring.insert(old.clone(), new.clone());
        }
        for object in self.objects.values_mut() {
            object.remap_relationships(changes);
        }
    }

    /// Forget retiring aliases. Returns how many were dropped.
    pub fn retire_pending(&mut self) -> usize {
        let count = self.retiring.len();
        self.retiring.clear();
        count
    }

    #[must_use]
    pub fn snapshot(&self, id: &ObjectId) -> Option<&Snapshot> {
        self.snapshots.get(self.resolve(id))
    }

    pub fn set_snapshot(&mut self, id: &ObjectId, snapshot: Snapshot) {
        let key = self.resolve(id).clone();
        self.snapshots.insert(key, snapshot);
    }

    /// Update one column of an existing snapshot.
    pub fn set_snapshot_column(&mut self, id: &ObjectId, column: &str, value: Value) {
        let key = self.resolve(id).clone();
        if let Some(snapshot) = self.snapshots.get_mut(&key) {
            if value.is_null() {
                snapshot.remove(column);
            } else {
                snapshot.insert(column.to_string(), value);
            }
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.objects.keys()
    }

    pub fn objects(&self) -> impl Iterator<Item = &PersistentObject> {
        self.objects.values()
    }

    /// Ids of objects in the given state, in id order.
    #[must_use]
    pub fn ids_in_state(&self, state: PersistenceState) -> Vec<ObjectId> {
        self.objects
            .values()
            .filter(|o| o.state() == state)
            .map(|o| o.id().clone())
            .collect()
    }

    #[must_use]
    pub fn has_dirty(&self) -> bool {
        self.objects.values().any(|o| o.state().is_dirty())
    }
}

// =============================================================================
// TESTS
// =============================================================================
