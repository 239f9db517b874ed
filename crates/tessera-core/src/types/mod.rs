//! # Core Type Definitions
//!
//! This module contains the value types shared by every part of the core:
//! - Scalar property values (`Value`)
//! - Object identities (`ObjectId`, `IdKey`)
//! - Object lifecycle (`PersistenceState`)
//! - Error types (`TesseraError`)
//!
//! ## Ordering Guarantees
//!
//! All types in this module:
//! - Implement `Ord` so they can key `BTreeMap`/`BTreeSet`
//! - Use integer values only (no floating-point)

use crate::metadata::PropertyKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

// =============================================================================
// VALUE
// =============================================================================

/// A scalar property value.
///
/// This is the only thing an attribute can hold and the only thing a key
/// column can hold. Relationships are tracked separately as arcs.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Create a text value.
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the integer payload, if any.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the text payload, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

// =============================================================================
// OBJECT IDENTITY
// =============================================================================

/// Source of temporary id tokens. Shared by every context in the process so
/// that temporaries arriving through a merge never collide with local ones.
static NEXT_TEMPORARY: AtomicU64 = AtomicU64::new(1);

/// The key half of an [`ObjectId`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IdKey {
    /// Assigned at creation, before the store knows the object.
    Temporary(u64),
    /// Primary key column -> value.
    Permanent(BTreeMap<String, Value>),
}

/// Durable identity of a persistent object.
///
/// Equality is by entity name and key contents. A temporary id is replaced
/// exactly once, at commit, by a permanent one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    entity: String,
    key: IdKey,
}

impl ObjectId {
    /// Allocate a fresh temporary id for the given entity.
    #[must_use]
    pub fn temporary(entity: impl Into<String>) -> Self {
        let token = NEXT_TEMPORARY.fetch_add(1, Ordering::Relaxed);
        Self {
            entity: entity.into(),
            key: IdKey::Temporary(token),
        }
    }

    /// Build a permanent id from a full key map.
    #[must_use]
    pub fn permanent(entity: impl Into<String>, key: BTreeMap<String, Value>) -> Self {
        Self {
            entity: entity.into(),
            key: IdKey::Permanent(key),
        }
    }

    /// Build a permanent id with a single key column.
    #[must_use]
    pub fn single(entity: impl Into<String>, column: impl Into<String>, value: Value) -> Self {
        let mut key = BTreeMap::new();
        key.insert(column.into(), value);
        Self::permanent(entity, key)
    }

    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    #[must_use]
    pub fn key(&self) -> &IdKey {
        &self.key
    }

    #[must_use]
    pub fn is_temporary(&self) -> bool {
        matches!(self.key, IdKey::Temporary(_))
    }

    /// Key column values of a permanent id; `None` for temporaries.
    #[must_use]
    pub fn key_values(&self) -> Option<&BTreeMap<String, Value>> {
        match &self.key {
            IdKey::Permanent(map) => Some(map),
            IdKey::Temporary(_) => None,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            IdKey::Temporary(token) => write!(f, "{}<temp:{}>", self.entity, token),
            IdKey::Permanent(map) => {
                write!(f, "{}<", self.entity)?;
                for (i, (column, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{column}={value}")?;
                }
                f.write_str(">")
            }
        }
    }
}

// =============================================================================
// PERSISTENCE STATE
// =============================================================================

/// Lifecycle of a persistent object.
///
/// ```text
/// TRANSIENT -> NEW -> COMMITTED <-> MODIFIED -> DELETED
///                         ^  |
///                         |  v
///                        HOLLOW
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PersistenceState {
    /// Not registered with any context.
    Transient,
    /// Registered, not yet inserted.
    New,
    /// In sync with the last known stored state.
    Committed,
    /// Committed object with local edits.
    Modified,
    /// Scheduled for deletion at the next commit.
    Deleted,
    /// Known by identity only; values load on first read.
    Hollow,
}

impl PersistenceState {
    /// New, modified and deleted objects make up the commit's dirty set.
    #[must_use]
    pub const fn is_dirty(self) -> bool {
        matches!(self, Self::New | Self::Modified | Self::Deleted)
    }
}

impl fmt::Display for PersistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transient => "transient",
            Self::New => "new",
            Self::Committed => "committed",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Hollow => "hollow",
        };
        f.write_str(name)
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the Tessera core.
///
/// - No silent failures outside of merge (which skips and logs)
/// - Use `Result<T, TesseraError>` for fallible operations
/// - The core never panics
#[derive(Debug, Error)]
pub enum TesseraError {
    /// No entity descriptor is registered under this name.
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    /// The id is not registered in this context.
    #[error("Unknown object: {0}")]
    UnknownObject(ObjectId),

    /// The store has no row for this id.
    #[error("Object not found in store: {0}")]
    ObjectNotFound(ObjectId),

    /// The entity has no attribute or relationship with this name.
    #[error("Unknown property {property:?} on entity {entity}")]
    UnknownProperty { entity: String, property: String },

    /// The property exists but is not of the kind the caller asked for.
    #[error("Property {property:?} on {entity} is {actual:?}, not {expected:?}")]
    PropertyKindMismatch {
        entity: String,
        property: String,
        expected: PropertyKind,
        actual: PropertyKind,
    },

    /// Resolving a fault returned data that breaks the mapping contract.
    #[error("Fault failure on {id}: {detail}")]
    FaultFailure { id: ObjectId, detail: String },

    /// Mapping metadata cannot support the requested operation.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Object graph contents cannot be committed as they are.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The operation is not allowed in the object's current state.
    #[error("Cannot {operation} {id} in state {state}")]
    InvalidState {
        id: ObjectId,
        state: PersistenceState,
        operation: &'static str,
    },

    /// A deny delete rule blocked deletion.
    #[error("Delete of {id} denied: relationship {relationship:?} is not empty")]
    DeleteDenied { id: ObjectId, relationship: String },

    /// An update or delete qualified by the snapshot matched no row.
    #[error("Optimistic lock failure on {0}")]
    OptimisticLockFailure(ObjectId),

    /// The store rejected the unit of work or the fetch.
    #[error("Store error: {0}")]
    StoreError(String),

    /// A serialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A deserialization error occurred.
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),
}

// =============================================================================
// TESTS
// =============================================================================
