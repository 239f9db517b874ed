//! # Persistent Objects
//!
//! A persistent object is a property bag with an identity and a lifecycle
//! state. Objects are owned by their context's registry and addressed by
//! [`ObjectId`]; nothing outside the registry holds a reference to one.

use crate::metadata::{EntityDescriptor, PropertyKind};
use crate::{ObjectId, PersistenceState, Value};
use std::collections::BTreeMap;

// =============================================================================
// RELATIONSHIP HOLDER
// =============================================================================

/// Value of a relationship property.
///
/// `Fault` means the relationship has not been read from the store yet.
/// The other two variants are resolved values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationshipValue {
    Fault,
    ToOne(Option<ObjectId>),
    ToMany(Vec<ObjectId>),
}

impl RelationshipValue {
    /// Empty resolved value for a relationship kind.
    #[must_use]
    pub fn empty(kind: PropertyKind) -> Self {
        match kind {
            PropertyKind::ToMany => Self::ToMany(Vec::new()),
            _ => Self::ToOne(None),
        }
    }

    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault)
    }

    /// Whether the resolved value points at `target`.
    #[must_use]
    pub fn contains(&self, target: &ObjectId) -> bool {
        match self {
            Self::Fault => false,
            Self::ToOne(current) => current.as_ref() == Some(target),
            Self::ToMany(list) => list.contains(target),
        }
    }

    /// Every target of the resolved value.
    #[must_use]
    pub fn targets(&self) -> Vec<ObjectId> {
        match self {
            Self::Fault | Self::ToOne(None) => Vec::new(),
            Self::ToOne(Some(id)) => vec![id.clone()],
            Self::ToMany(list) => list.clone(),
        }
    }

    /// Point the relationship at `target`. Returns false if nothing changed.
    pub(crate) fn link(&mut self, target: &ObjectId) -> bool {
        match self {
            Self::Fault => false,
            Self::ToOne(current) => {
                if current.as_ref() == Some(target) {
                    return false;
                }
                *current = Some(target.clone());
                true
            }
            Self::ToMany(list) => {
                if list.contains(target) {
                    return false;
                }
                list.push(target.clone());
                true
            }
        }
    }

    /// Drop `target` from the relationship. Returns false if it was absent.
    pub(crate) fn unlink(&mut self, target: &ObjectId) -> bool {
        match self {
            Self::Fault => false,
            Self::ToOne(current) => {
                if current.as_ref() != Some(target) {
                    return false;
                }
                *current = None;
                true
            }
            Self::ToMany(list) => {
                let before = list.len();
                list.retain(|id| id != target);
                before != list.len()
            }
        }
    }

    /// Rewrite ids according to `map`. Used by the identity swap.
    pub(crate) fn remap(&mut self, map: &BTreeMap<ObjectId, ObjectId>) {
        match self {
            Self::Fault | Self::ToOne(None) => {}
            Self::ToOne(Some(id)) => {
                if let Some(new_id) = map.get(id) {
                    *id = new_id.clone();
                }
            }
            Self::ToMany(list) => {
                for id in list.iter_mut() {
                    if let Some(new_id) = map.get(id) {
                        *id = new_id.clone();
                    }
                }
            }
        }
    }
}

// =============================================================================
// PERSISTENT OBJECT
// =============================================================================

/// A registered object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentObject {
    id: ObjectId,
    state: PersistenceState,
    attributes: BTreeMap<String, Value>,
    relationships: BTreeMap<String, RelationshipValue>,
}

impl PersistentObject {
    /// A freshly created object: every relationship resolved and empty.
    #[must_use]
    pub fn new_object(id: ObjectId, entity: &EntityDescriptor) -> Self {
        let relationships = entity
            .relationships()
            .map(|r| (r.name.clone(), RelationshipValue::empty(r.kind())))
            .collect();
        Self {
            id,
            state: PersistenceState::New,
            attributes: BTreeMap::new(),
            relationships,
        }
    }

    /// An object read from the store: attributes loaded, relationships faulted.
    #[must_use]
    pub fn fetched(id: ObjectId, entity: &EntityDescriptor, attributes: BTreeMap<String, Value>) -> Self {
        let relationships = entity
            .relationships()
            .map(|r| (r.name.clone(), RelationshipValue::Fault))
            .collect();
        Self {
            id,
            state: PersistenceState::Committed,
            attributes,
            relationships,
        }
    }

    /// An object known by id only.
    #[must_use]
    pub fn hollow(id: ObjectId, entity: &EntityDescriptor) -> Self {
        let mut object = Self::fetched(id, entity, BTreeMap::new());
        object.state = PersistenceState::Hollow;
        object
    }

    #[must_use]
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> PersistenceState {
        self.state
    }

    /// Current attribute value; unset attributes read as `Null`.
    #[must_use]
    pub fn attribute(&self, name: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.attributes.get(name).unwrap_or(&NULL)
    }

    #[must_use]
    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    #[must_use]
    pub fn relationship(&self, name: &str) -> Option<&RelationshipValue> {
        self.relationships.get(name)
    }

    pub fn relationships(&self) -> impl Iterator<Item = (&String, &RelationshipValue)> {
        self.relationships.iter()
    }

    pub(crate) fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    pub(crate) fn set_state(&mut self, state: PersistenceState) {
        self.state = state;
    }

    /// Write an attribute without any tracking.
    pub(crate) fn put_attribute(&mut self, name: &str, value: Value) {
        if value.is_null() {
            self.attributes.remove(name);
        } else {
            self.attributes.insert(name.to_string(), value);
        }
    }

    /// Replace all attributes without any tracking.
    pub(crate) fn replace_attributes(&mut self, attributes: BTreeMap<String, Value>) {
        self.attributes = attributes;
    }

    pub(crate) fn relationship_mut(&mut self, name: &str) -> Option<&mut RelationshipValue> {
        self.relationships.get_mut(name)
    }

    pub(crate) fn set_relationship(&mut self, name: &str, value: RelationshipValue) {
        self.relationships.insert(name.to_string(), value);
    }

    /// Committed objects become modified on their first tracked change.
    pub(crate) fn touch(&mut self) {
        if self.state == PersistenceState::Committed {
            self.state = PersistenceState::Modified;
        }
    }

    /// Drop every relationship reference to `target`.
    pub(crate) fn forget(&mut self, target: &ObjectId) {
        for value in self.relationships.values_mut() {
            value.unlink(target);
        }
    }

    pub(crate) fn remap_relationships(&mut self, map: &BTreeMap<ObjectId, ObjectId>) {
        for value in self.relationships.values_mut() {
            value.remap(map);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
