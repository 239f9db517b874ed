//! # Object Context
//!
//! The public entry point: one cache of persistent objects, its change log,
//! and the collaborators it commits to.
//!
//! Every operation takes the context's single lock, which covers the
//! registry, the recorder and the event bus together. Application threads,
//! commits and merges therefore never interleave inside one context.
//! Store calls (fault fetches, unit-of-work dispatch) run on the caller's
//! thread while the lock is held.

use crate::channel::{DataChannel, Query};
use crate::commit::{CommitPhase, CommitPipeline};
use crate::config::ContextConfig;
use crate::diff::{GraphDiff, GraphOperation};
use crate::events::{ContextEvent, EventBus, SubscriptionId};
use crate::fault::Faults;
use crate::interceptor::{Cascade, ChangeInterceptor};
use crate::merge::{MergeHandler, MergeReport};
use crate::metadata::{MetadataResolver, PropertyKind};
use crate::object::PersistentObject;
use crate::primitives::FLUSH_MARKER;
use crate::recorder::OperationRecorder;
use crate::registry::{ObjectRegistry, Snapshot};
use crate::rollback::RollbackHandler;
use crate::{ObjectId, PersistenceState, TesseraError, Value};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::mpsc::Receiver;

// =============================================================================
// SHARED STATE
// =============================================================================

/// Everything guarded by the context lock.
pub(crate) struct GraphState {
    pub(crate) registry: ObjectRegistry,
    pub(crate) recorder: OperationRecorder,
    pub(crate) events: EventBus,
    pub(crate) resolver: Arc<dyn MetadataResolver>,
    pub(crate) channel: Arc<dyn DataChannel>,
    pub(crate) config: ContextConfig,
    pub(crate) phase: CommitPhase,
    events_suppressed: bool,
}

impl GraphState {
    fn new(
        resolver: Arc<dyn MetadataResolver>,
        channel: Arc<dyn DataChannel>,
        config: ContextConfig,
    ) -> Self {
        Self {
            registry: ObjectRegistry::new(),
            recorder: OperationRecorder::new(),
            events: EventBus::new(),
            resolver,
            channel,
            config,
            phase: CommitPhase::Idle,
            events_suppressed: false,
        }
    }

    /// Append an operation to the log and announce it.
    pub(crate) fn record(&mut self, operation: GraphOperation) {
        if self.config.change_events && !self.events_suppressed {
            self.events
                .publish(&ContextEvent::Change(GraphDiff::single(operation.clone())));
        }
        self.recorder.add(operation);
    }

    /// Publish a commit/rollback/flush event if lifecycle events are on.
    pub(crate) fn publish_lifecycle(&mut self, event: ContextEvent) {
        if self.config.lifecycle_events && !self.events_suppressed {
            self.events.publish(&event);
        }
    }

    /// Silence event publishing until the returned guard is dropped.
    pub(crate) fn suppress_events(&mut self) -> EventSuppression<'_> {
        let previous = self.events_suppressed;
        self.events_suppressed = true;
        EventSuppression {
            state: self,
            previous,
        }
    }
}

/// Scoped event silence. Restores the previous setting on drop, including
/// on early returns and unwinding.
pub(crate) struct EventSuppression<'a> {
    state: &'a mut GraphState,
    previous: bool,
}

impl Deref for EventSuppression<'_> {
    type Target = GraphState;

    fn deref(&self) -> &GraphState {
        self.state
    }
}

impl DerefMut for EventSuppression<'_> {
    fn deref_mut(&mut self) -> &mut GraphState {
        self.state
    }
}

impl Drop for EventSuppression<'_> {
    fn drop(&mut self) {
        self.state.events_suppressed = self.previous;
    }
}

// =============================================================================
// OBJECT CONTEXT
// =============================================================================

/// A cache of persistent objects with change tracking.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tessera_core::metadata::{EntityDescriptor, EntityResolver};
/// use tessera_core::storage::MemoryStore;
/// use tessera_core::{ContextConfig, ObjectContext, PersistenceState, Value};
///
/// let resolver = EntityResolver::new().with_entity(
///     EntityDescriptor::new("Artist").with_generated_key("ID").with_attribute("name"),
/// );
/// let context = ObjectContext::new(
///     Arc::new(resolver),
///     Arc::new(MemoryStore::new()),
///     ContextConfig::default(),
/// );
///
/// let artist = context.new_object("Artist").expect("new");
/// context.write_property(&artist, "name", "Monet").expect("write");
/// let diff = context.commit_changes().expect("commit");
///
/// let artist = diff.id_changes()[&artist].clone();
/// assert_eq!(context.state(&artist), PersistenceState::Committed);
/// assert_eq!(context.read_property(&artist, "name").expect("read"), Value::text("Monet"));
/// ```
pub struct ObjectContext {
    state: Mutex<GraphState>,
}

impl std::fmt::Debug for ObjectContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ObjectContext")
            .field("registered", &state.registry.len())
            .field("recorded", &state.recorder.len())
            .field("phase", &state.phase)
            .finish_non_exhaustive()
    }
}

impl ObjectContext {
    /// Create an empty context over the given collaborators.
    #[must_use]
    pub fn new(
        resolver: Arc<dyn MetadataResolver>,
        channel: Arc<dyn DataChannel>,
        config: ContextConfig,
    ) -> Self {
        Self {
            state: Mutex::new(GraphState::new(resolver, channel, config)),
        }
    }

    #[must_use]
    pub fn config(&self) -> ContextConfig {
        self.state.lock().config
    }

    // -------------------------------------------------------------------
    // Registration and lookup
    // -------------------------------------------------------------------

    /// Create and register a new object with a temporary id.
    pub fn new_object(&self, entity: &str) -> Result<ObjectId, TesseraError> {
        let mut state = self.state.lock();
        let descriptor = state.resolver.entity(entity)?;
        let id = ObjectId::temporary(entity);
        state
            .registry
            .register(PersistentObject::new_object(id.clone(), &descriptor));
        state.record(GraphOperation::NodeCreate(id.clone()));
        Ok(id)
    }

    /// Register an id without loading it. Values load on first read.
    ///
    /// Already registered ids are returned unchanged.
    pub fn local_object(&self, id: &ObjectId) -> Result<ObjectId, TesseraError> {
        let mut state = self.state.lock();
        if let Some(object) = state.registry.get(id) {
            return Ok(object.id().clone());
        }
        if id.is_temporary() {
            return Err(TesseraError::UnknownObject(id.clone()));
        }
        let descriptor = state.resolver.entity_for(id)?;
        state
            .registry
            .register(PersistentObject::hollow(id.clone(), &descriptor));
        Ok(id.clone())
    }

    /// Fetch rows and register them. Returns the ids in row order.
    pub fn perform_query(&self, query: &Query) -> Result<Vec<ObjectId>, TesseraError> {
        let mut state = self.state.lock();
        Faults::select(&mut state, query)
    }

    /// Lifecycle state; unregistered ids are transient.
    #[must_use]
    pub fn state(&self, id: &ObjectId) -> PersistenceState {
        self.state.lock().registry.state_of(id)
    }

    /// Copy of a registered object.
    #[must_use]
    pub fn object(&self, id: &ObjectId) -> Option<PersistentObject> {
        self.state.lock().registry.get(id).cloned()
    }

    /// Copy of an object's last known stored values.
    #[must_use]
    pub fn snapshot(&self, id: &ObjectId) -> Option<Snapshot> {
        self.state.lock().registry.snapshot(id).cloned()
    }

    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.state.lock().registry.len()
    }

    // -------------------------------------------------------------------
    // Property access
    // -------------------------------------------------------------------

    /// Read an attribute, loading a hollow object first.
    pub fn read_property(&self, id: &ObjectId, property: &str) -> Result<Value, TesseraError> {
        let mut state = self.state.lock();
        Faults::read_attribute(&mut state, id, property)
    }

    /// Write an attribute. Writing the current value records nothing.
    pub fn write_property(
        &self,
        id: &ObjectId,
        property: &str,
        value: impl Into<Value>,
    ) -> Result<(), TesseraError> {
        let mut state = self.state.lock();
        ChangeInterceptor::write_attribute(&mut state, id, property, value.into())
    }

    /// Read a to-one relationship, resolving its fault on first access.
    pub fn read_to_one(
        &self,
        id: &ObjectId,
        relationship: &str,
    ) -> Result<Option<ObjectId>, TesseraError> {
        let mut state = self.state.lock();
        Faults::read_to_one(&mut state, id, relationship)
    }

    /// Read a to-many relationship, resolving its fault on first access.
    pub fn read_to_many(
        &self,
        id: &ObjectId,
        relationship: &str,
    ) -> Result<Vec<ObjectId>, TesseraError> {
        let mut state = self.state.lock();
        Faults::read_to_many(&mut state, id, relationship)
    }

    /// Point a to-one relationship at `target` (or clear it), keeping the
    /// reverse side in sync.
    pub fn set_to_one(
        &self,
        id: &ObjectId,
        relationship: &str,
        target: Option<&ObjectId>,
    ) -> Result<(), TesseraError> {
        let mut state = self.state.lock();
        ChangeInterceptor::set_to_one(&mut state, id, relationship, target)
    }

    /// Add `target` to a to-many relationship, keeping the reverse in sync.
    pub fn add_to_many(
        &self,
        id: &ObjectId,
        relationship: &str,
        target: &ObjectId,
    ) -> Result<(), TesseraError> {
        let mut state = self.state.lock();
        Faults::expect_kind(&state, id, relationship, PropertyKind::ToMany)?;
        ChangeInterceptor::link(&mut state, id, relationship, target, Cascade::Propagate)
    }

    /// Remove `target` from a to-many relationship, keeping the reverse in sync.
    pub fn remove_to_many(
        &self,
        id: &ObjectId,
        relationship: &str,
        target: &ObjectId,
    ) -> Result<(), TesseraError> {
        let mut state = self.state.lock();
        Faults::expect_kind(&state, id, relationship, PropertyKind::ToMany)?;
        ChangeInterceptor::unlink(&mut state, id, relationship, target, Cascade::Propagate)
    }

    /// Schedule an object for deletion, applying relationship delete rules.
    ///
    /// New objects are dropped at once; transient and already deleted
    /// objects are ignored.
    pub fn delete_object(&self, id: &ObjectId) -> Result<(), TesseraError> {
        let mut state = self.state.lock();
        ChangeInterceptor::delete_object(&mut state, id)
    }

    // -------------------------------------------------------------------
    // Unit of work
    // -------------------------------------------------------------------

    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.state.lock().recorder.has_changes()
    }

    /// Everything recorded since the last commit or rollback.
    #[must_use]
    pub fn uncommitted_diff(&self) -> GraphDiff {
        self.state.lock().recorder.diffs()
    }

    /// Outcome of the most recent commit attempt.
    #[must_use]
    pub fn commit_phase(&self) -> CommitPhase {
        self.state.lock().phase
    }

    /// Send all pending changes to the store as one unit of work.
    ///
    /// Returns the committed operations followed by the identity changes the
    /// commit produced. On error nothing local changes and the pending
    /// operations are kept.
    pub fn commit_changes(&self) -> Result<GraphDiff, TesseraError> {
        let mut state = self.state.lock();
        CommitPipeline::commit(&mut state)
    }

    /// Undo every pending change. Returns the diff that was undone.
    pub fn rollback_changes(&self) -> GraphDiff {
        let mut state = self.state.lock();
        RollbackHandler::rollback(&mut state)
    }

    /// Announce the changes recorded since the previous flush without
    /// committing them.
    pub fn flush_changes(&self) -> GraphDiff {
        let mut state = self.state.lock();
        let diff = state.recorder.diffs_after_marker(FLUSH_MARKER);
        state.recorder.set_marker(FLUSH_MARKER);
        state.publish_lifecycle(ContextEvent::Flush(diff.clone()));
        diff
    }

    // -------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------

    /// Apply a diff produced by another context or the store.
    pub fn merge(&self, diff: &GraphDiff) -> MergeReport {
        let mut state = self.state.lock();
        MergeHandler::merge(&mut state, diff)
    }

    /// Entry point for the transport layer; same as [`Self::merge`].
    pub fn apply_remote_diff(&self, diff: &GraphDiff) -> MergeReport {
        self.merge(diff)
    }

    /// Start receiving this context's events.
    pub fn subscribe(&self) -> (SubscriptionId, Receiver<ContextEvent>) {
        self.state.lock().events.subscribe()
    }

    /// Stop a subscription. Returns false if it was not active.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.lock().events.unsubscribe(id)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityDescriptor, EntityResolver};
    use crate::storage::MemoryStore;

    fn context(config: ContextConfig) -> ObjectContext {
        let resolver = EntityResolver::new().with_entity(
            EntityDescriptor::new("Artist")
                .with_generated_key("ID")
                .with_attribute("name"),
        );
        ObjectContext::new(Arc::new(resolver), Arc::new(MemoryStore::new()), config)
    }

    #[test]
    fn new_object_records_create() {
        let context = context(ContextConfig::default());
        let id = context.new_object("Artist").expect("new");
        assert_eq!(context.state(&id), PersistenceState::New);
        assert_eq!(
            context.uncommitted_diff().operations(),
            &[GraphOperation::NodeCreate(id)]
        );
    }

    #[test]
    fn unknown_entity_rejected() {
        let context = context(ContextConfig::default());
        assert!(matches!(
            context.new_object("Gallery"),
            Err(TesseraError::UnknownEntity(_))
        ));
    }

    #[test]
    fn change_events_follow_config() {
        let loud = context(ContextConfig::default());
        let (_, rx) = loud.subscribe();
        loud.new_object("Artist").expect("new");
        assert!(matches!(rx.try_recv(), Ok(ContextEvent::Change(_))));

        let quiet = context(ContextConfig::silent());
        let (_, rx) = quiet.subscribe();
        quiet.new_object("Artist").expect("new");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn flush_reports_changes_since_previous_flush() {
        let context = context(ContextConfig::default());
        context.new_object("Artist").expect("new");
        assert_eq!(context.flush_changes().len(), 1);
        assert!(context.flush_changes().is_empty());
        context.new_object("Artist").expect("new");
        assert_eq!(context.flush_changes().len(), 1);
        // History survives flushes.
        assert_eq!(context.uncommitted_diff().len(), 2);
    }

    #[test]
    fn suppression_restores_previous_setting() {
        let context = context(ContextConfig::default());
        let mut state = context.state.lock();
        {
            let mut outer = state.suppress_events();
            {
                let inner = outer.suppress_events();
                assert!(inner.events_suppressed);
            }
            assert!(outer.events_suppressed);
        }
        assert!(!state.events_suppressed);
    }

    #[test]
    fn local_object_registers_hollow() {
        let context = context(ContextConfig::default());
        let id = ObjectId::single("Artist", "ID", Value::Int(10));
        context.local_object(&id).expect("local");
        assert_eq!(context.state(&id), PersistenceState::Hollow);
        assert!(!context.has_changes());
    }
}
