//! # tessera-core
//!
//! The object graph engine for Tessera: a client-side cache of persistent
//! objects that tracks every change and commits it to a relational store as
//! one unit of work.
//!
//! ## Architecture
//!
//! - [`ObjectContext`] is the entry point. It owns a registry of objects,
//!   an operation recorder and an event bus behind a single lock.
//! - Mapping metadata comes from a [`metadata::MetadataResolver`]; stored rows
//!   come from a [`channel::DataChannel`]. The core knows nothing else about
//!   the store.
//! - Every mutation is recorded as a [`diff::GraphOperation`]. The log drives
//!   commit, rollback, flush notifications and merging into other contexts.
//!
//! ## Constraints
//!
//! - No async, no network dependencies (pure Rust)
//! - Deterministic: BTreeMap ordering everywhere iteration order is visible
//! - The core never panics; every fallible call returns [`TesseraError`]

// =============================================================================
// MODULES
// =============================================================================

pub mod channel;
pub mod config;
pub mod context;
pub mod diff;
pub mod events;
pub mod formats;
pub mod metadata;
pub mod object;
pub mod primitives;
pub mod recorder;
pub mod registry;
pub mod storage;
pub mod types;

mod commit;
mod fault;
mod interceptor;
mod merge;
mod rollback;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{IdKey, ObjectId, PersistenceState, TesseraError, Value};

// =============================================================================
// RE-EXPORTS: Object Graph
// =============================================================================

pub use commit::CommitPhase;
pub use config::ContextConfig;
pub use context::ObjectContext;
pub use diff::{GraphChangeHandler, GraphDiff, GraphOperation};
pub use events::{ContextEvent, EventBus, SubscriptionId};
pub use merge::MergeReport;
pub use object::{PersistentObject, RelationshipValue};
pub use recorder::OperationRecorder;
pub use registry::{ObjectRegistry, Snapshot};

// =============================================================================
// RE-EXPORTS: Metadata and Storage
// =============================================================================

pub use channel::{DataChannel, DataRow, Query, UnitOfWork};
pub use metadata::{DeleteRule, EntityDescriptor, EntityResolver, MetadataResolver};
pub use storage::{MemoryStore, RedbStore};

// =============================================================================
// RE-EXPORTS: Formats (from formats module)
// =============================================================================

pub use formats::{RowHeader, row_from_bytes, row_to_bytes};
