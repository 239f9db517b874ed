//! # Mapping Metadata
//!
//! Entity descriptors and the resolver interface the core consumes.
//!
//! The mapping layer itself (reading model files, naming strategies, schema
//! reverse engineering) is outside the core. The core only needs to know, per
//! entity: which properties are attributes and which are relationships, how
//! attributes map to columns, where each key column gets its value, and how
//! relationships pair with their reverses.
//!
//! Property kinds are resolved once, when a descriptor is built, into a
//! closed [`PropertyKind`] map. Nothing in the core dispatches on property
//! names at mutation time.

use crate::{ObjectId, TesseraError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// PROPERTY KINDS AND RULES
// =============================================================================

/// What a named property of an entity is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PropertyKind {
    /// Scalar value stored in a column.
    Attribute,
    /// Single related object (or none).
    ToOne,
    /// Ordered collection of related objects.
    ToMany,
}

/// What happens to related objects when the source object is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeleteRule {
    /// Leave the relationship alone.
    NoAction,
    /// Unlink the related objects (both sides).
    #[default]
    Nullify,
    /// Delete the related objects too.
    Cascade,
    /// Refuse to delete while the relationship is not empty.
    Deny,
}

/// Where a primary key column gets its value when an object is inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeySource {
    /// Copied from an attribute of the object itself.
    Attribute(String),
    /// Copied from the master's key through a to-one relationship.
    Propagated {
        relationship: String,
        master_column: String,
    },
    /// Produced by the store's key generator.
    Generated,
}

/// A primary key column of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyColumn {
    pub column: String,
    pub source: KeySource,
}

/// A mapped scalar attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    pub column: String,
}

/// A mapped relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDescriptor {
    pub name: String,
    pub target: String,
    pub reverse: Option<String>,
    pub to_many: bool,
    pub delete_rule: DeleteRule,
}

impl RelationshipDescriptor {
    #[must_use]
    pub fn kind(&self) -> PropertyKind {
        if self.to_many {
            PropertyKind::ToMany
        } else {
            PropertyKind::ToOne
        }
    }
}

// =============================================================================
// ENTITY DESCRIPTOR
// =============================================================================

/// Everything the core knows about one entity.
///
/// Built with chained `with_*` calls:
///
/// ```
/// use tessera_core::metadata::{EntityDescriptor, PropertyKind};
///
/// let artist = EntityDescriptor::new("Artist")
///     .with_generated_key("ID")
///     .with_attribute("name")
///     .with_to_many("paintings", "Painting", Some("artist"));
///
/// assert_eq!(artist.kind("name"), Some(PropertyKind::Attribute));
/// assert_eq!(artist.kind("paintings"), Some(PropertyKind::ToMany));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    name: String,
    attributes: BTreeMap<String, AttributeDescriptor>,
    relationships: BTreeMap<String, RelationshipDescriptor>,
    key_columns: Vec<KeyColumn>,
    optimistic_locking: bool,
    kinds: BTreeMap<String, PropertyKind>,
}

impl EntityDescriptor {
    /// Create a descriptor with no properties.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
            relationships: BTreeMap::new(),
            key_columns: Vec::new(),
            optimistic_locking: false,
            kinds: BTreeMap::new(),
        }
    }

    /// Add an attribute stored in a column of the same name.
    #[must_use]
    pub fn with_attribute(self, name: impl Into<String>) -> Self {
        let name = name.into();
        let column = name.clone();
        self.with_attribute_column(name, column)
    }

    /// Add an attribute stored in a differently named column.
    #[must_use]
    pub fn with_attribute_column(
        mut self,
        name: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        let name = name.into();
        self.kinds.insert(name.clone(), PropertyKind::Attribute);
        self.attributes.insert(
            name.clone(),
            AttributeDescriptor {
                name,
                column: column.into(),
            },
        );
        self
    }

    /// Add a key column filled by the store's key generator.
    #[must_use]
    pub fn with_generated_key(mut self, column: impl Into<String>) -> Self {
        self.key_columns.push(KeyColumn {
            column: column.into(),
            source: KeySource::Generated,
        });
        self
    }

    /// Add a key column copied from one of the object's attributes.
    ///
    /// The attribute is registered too if it was not already.
    #[must_use]
    pub fn with_attribute_key(mut self, attribute: impl Into<String>) -> Self {
        let attribute = attribute.into();
        if !self.attributes.contains_key(&attribute) {
            self = self.with_attribute(attribute.clone());
        }
        let column = self
            .attributes
            .get(&attribute)
            .map(|a| a.column.clone())
            .unwrap_or_else(|| attribute.clone());
        self.key_columns.push(KeyColumn {
            column,
            source: KeySource::Attribute(attribute),
        });
        self
    }

    /// Add a key column copied from the master's key column.
    #[must_use]
    pub fn with_propagated_key(
        mut self,
        column: impl Into<String>,
        relationship: impl Into<String>,
        master_column: impl Into<String>,
    ) -> Self {
        self.key_columns.push(KeyColumn {
            column: column.into(),
            source: KeySource::Propagated {
                relationship: relationship.into(),
                master_column: master_column.into(),
            },
        });
        self
    }

    /// Add a to-one relationship with the default delete rule.
    #[must_use]
    pub fn with_to_one(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        reverse: Option<&str>,
    ) -> Self {
        self.with_relationship(name, target, reverse, false, DeleteRule::default())
    }

    /// Add a to-many relationship with the default delete rule.
    #[must_use]
    pub fn with_to_many(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        reverse: Option<&str>,
    ) -> Self {
        self.with_relationship(name, target, reverse, true, DeleteRule::default())
    }

    /// Add a relationship with every option spelled out.
    #[must_use]
    pub fn with_relationship(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        reverse: Option<&str>,
        to_many: bool,
        delete_rule: DeleteRule,
    ) -> Self {
        let descriptor = RelationshipDescriptor {
            name: name.into(),
            target: target.into(),
            reverse: reverse.map(str::to_string),
            to_many,
            delete_rule,
        };
        self.kinds.insert(descriptor.name.clone(), descriptor.kind());
        self.relationships
            .insert(descriptor.name.clone(), descriptor);
        self
    }

    /// Qualify updates and deletes with the last known snapshot.
    #[must_use]
    pub fn with_optimistic_locking(mut self) -> Self {
        self.optimistic_locking = true;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind of a named property, `None` if the entity does not map it.
    #[must_use]
    pub fn kind(&self, property: &str) -> Option<PropertyKind> {
        self.kinds.get(property).copied()
    }

    /// Kind of a named property, or `UnknownProperty`.
    pub fn require_kind(&self, property: &str) -> Result<PropertyKind, TesseraError> {
        self.kind(property)
            .ok_or_else(|| TesseraError::UnknownProperty {
                entity: self.name.clone(),
                property: property.to_string(),
            })
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &AttributeDescriptor> {
        self.attributes.values()
    }

    #[must_use]
    pub fn relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.get(name)
    }

    /// Relationship by name, or `UnknownProperty`.
    pub fn require_relationship(
        &self,
        name: &str,
    ) -> Result<&RelationshipDescriptor, TesseraError> {
        self.relationships
            .get(name)
            .ok_or_else(|| TesseraError::UnknownProperty {
                entity: self.name.clone(),
                property: name.to_string(),
            })
    }

    pub fn relationships(&self) -> impl Iterator<Item = &RelationshipDescriptor> {
        self.relationships.values()
    }

    #[must_use]
    pub fn key_columns(&self) -> &[KeyColumn] {
        &self.key_columns
    }

    #[must_use]
    pub fn optimistic_locking(&self) -> bool {
        self.optimistic_locking
    }

    /// Relationships whose key is propagated into this entity.
    pub fn master_relationships(&self) -> impl Iterator<Item = &str> {
        self.key_columns.iter().filter_map(|k| match &k.source {
            KeySource::Propagated { relationship, .. } => Some(relationship.as_str()),
            _ => None,
        })
    }
}

// =============================================================================
// RESOLVER
// =============================================================================

/// Lookup interface onto the mapping layer.
///
/// Implementations must be cheap to call; the core looks descriptors up on
/// every mutation.
pub trait MetadataResolver: Send + Sync {
    /// Descriptor for the named entity.
    fn lookup_entity(&self, name: &str) -> Option<Arc<EntityDescriptor>>;

    /// Descriptor for the named entity, or `UnknownEntity`.
    fn entity(&self, name: &str) -> Result<Arc<EntityDescriptor>, TesseraError> {
        self.lookup_entity(name)
            .ok_or_else(|| TesseraError::UnknownEntity(name.to_string()))
    }

    /// Descriptor for the entity an id belongs to.
    fn entity_for(&self, id: &ObjectId) -> Result<Arc<EntityDescriptor>, TesseraError> {
        self.entity(id.entity())
    }

    /// The reverse of a relationship, if it declares one.
    ///
    /// A declared reverse that cannot be found is a configuration error.
    fn reverse_of(
        &self,
        relationship: &RelationshipDescriptor,
    ) -> Result<Option<RelationshipDescriptor>, TesseraError> {
        let Some(reverse) = &relationship.reverse else {
            return Ok(None);
        };
        let target = self.entity(&relationship.target)?;
        target
            .relationship(reverse)
            .cloned()
            .map(Some)
            .ok_or_else(|| {
                TesseraError::Configuration(format!(
                    "relationship {:?} declares reverse {:?}, which {} does not map",
                    relationship.name, reverse, relationship.target
                ))
            })
    }
}

/// In-memory resolver holding a fixed set of descriptors.
#[derive(Debug, Clone, Default)]
pub struct EntityResolver {
    entities: BTreeMap<String, Arc<EntityDescriptor>>,
}

impl EntityResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor, replacing any previous one with the same name.
    #[must_use]
    pub fn with_entity(mut self, descriptor: EntityDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    /// Add a descriptor, replacing any previous one with the same name.
    pub fn register(&mut self, descriptor: EntityDescriptor) {
        self.entities
            .insert(descriptor.name().to_string(), Arc::new(descriptor));
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityDescriptor>> {
        self.entities.values()
    }

    /// Check cross-entity references.
    ///
    /// - every relationship target is mapped
    /// - every declared reverse exists and points back at the same pair
    /// - every propagated key goes through a to-one relationship
    /// - every attribute key names a mapped attribute
    pub fn validate(&self) -> Result<(), TesseraError> {
        for entity in self.entities.values() {
            for rel in entity.relationships() {
                let target = self.lookup_entity(&rel.target).ok_or_else(|| {
                    TesseraError::Configuration(format!(
                        "{}.{} targets unmapped entity {}",
                        entity.name(),
                        rel.name,
                        rel.target
                    ))
                })?;
                if let Some(reverse) = self.reverse_of(rel)? {
                    if reverse.target != entity.name()
                        || reverse.reverse.as_deref() != Some(rel.name.as_str())
                    {
                        return Err(TesseraError::Configuration(format!(
                            "{}.{} and {}.{} are not each other's reverse",
                            entity.name(),
                            rel.name,
                            target.name(),
                            reverse.name
                        )));
                    }
                }
            }
            for key in entity.key_columns() {
                match &key.source {
                    KeySource::Propagated { relationship, .. } => {
                        let rel = entity.require_relationship(relationship)?;
                        if rel.to_many {
                            return Err(TesseraError::Configuration(format!(
                                "{}.{} propagates key {} but is to-many",
                                entity.name(),
                                relationship,
                                key.column
                            )));
                        }
                    }
                    KeySource::Attribute(attribute) => {
                        if entity.attribute(attribute).is_none() {
                            return Err(TesseraError::UnknownProperty {
                                entity: entity.name().to_string(),
                                property: attribute.clone(),
                            });
                        }
                    }
                    KeySource::Generated => {}
                }
            }
        }
        Ok(())
    }
}

impl MetadataResolver for EntityResolver {
    fn lookup_entity(&self, name: &str) -> Option<Arc<EntityDescriptor>> {
        self.entities.get(name).cloned()
    }
}

// =============================================================================
// TESTS
// =============================================================================
