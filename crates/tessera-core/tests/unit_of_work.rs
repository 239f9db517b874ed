//! # Unit of Work Tests
//!
//! End-to-end behavior of one or more contexts over a shared store.
//!
//! ## Groups
//! - Lifecycle: state transitions, snapshots and identities
//! - Relationships: reverse maintenance and delete rules
//! - Commit: dispatch contents, failure handling, keys and locking
//! - Rollback and flush
//! - Merge between contexts

use parking_lot::Mutex;
use std::sync::Arc;
use tessera_core::channel::{RowOperation, RowResult};
use tessera_core::{
    CommitPhase, ContextConfig, ContextEvent, DataChannel, DataRow, DeleteRule, EntityDescriptor,
    EntityResolver, GraphOperation, MemoryStore, ObjectContext, ObjectId, PersistenceState, Query,
    TesseraError, UnitOfWork, Value,
};

// =============================================================================
// FIXTURES
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn gallery() -> EntityResolver {
    EntityResolver::new()
        .with_entity(
            EntityDescriptor::new("Note")
                .with_generated_key("ID")
                .with_attribute("name"),
        )
        .with_entity(
            EntityDescriptor::new("Artist")
                .with_generated_key("ARTIST_ID")
                .with_attribute_column("name", "ARTIST_NAME")
                .with_relationship(
                    "paintings",
                    "Painting",
                    Some("artist"),
                    true,
                    DeleteRule::Cascade,
                ),
        )
        .with_entity(
            EntityDescriptor::new("Painting")
                .with_generated_key("PAINTING_ID")
                .with_attribute("title")
                .with_to_one("artist", "Artist", Some("paintings"))
                .with_to_one("frame", "Frame", Some("painting")),
        )
        .with_entity(
            EntityDescriptor::new("Frame")
                .with_generated_key("FRAME_ID")
                .with_attribute("wood")
                .with_to_one("painting", "Painting", Some("frame")),
        )
        .with_entity(
            EntityDescriptor::new("Gallery")
                .with_generated_key("GALLERY_ID")
                .with_attribute("name")
                .with_relationship(
                    "exhibits",
                    "Exhibit",
                    Some("gallery"),
                    true,
                    DeleteRule::Deny,
                ),
        )
        .with_entity(
            EntityDescriptor::new("Exhibit")
                .with_propagated_key("GALLERY_ID", "gallery", "GALLERY_ID")
                .with_attribute_key("slot")
                .with_to_one("gallery", "Gallery", Some("exhibits")),
        )
        .with_entity(
            EntityDescriptor::new("Ledger")
                .with_generated_key("LEDGER_ID")
                .with_attribute("balance")
                .with_optimistic_locking(),
        )
}

/// Memory store that keeps a copy of every unit of work it receives.
#[derive(Debug, Default)]
struct RecordingStore {
    inner: MemoryStore,
    units: Mutex<Vec<UnitOfWork>>,
}

impl RecordingStore {
    fn units(&self) -> Vec<UnitOfWork> {
        self.units.lock().clone()
    }
}

impl DataChannel for RecordingStore {
    fn execute(&self, work: &UnitOfWork) -> Result<Vec<RowResult>, TesseraError> {
        self.units.lock().push(work.clone());
        self.inner.execute(work)
    }

    fn fetch(&self, query: &Query) -> Result<Vec<DataRow>, TesseraError> {
        self.inner.fetch(query)
    }

    fn generate_key(
        &self,
        entity: &EntityDescriptor,
        column: &str,
    ) -> Result<Value, TesseraError> {
        self.inner.generate_key(entity, column)
    }
}

fn context_over(store: Arc<RecordingStore>, config: ContextConfig) -> ObjectContext {
    init_tracing();
    ObjectContext::new(Arc::new(gallery()), store, config)
}

fn fixture() -> (ObjectContext, Arc<RecordingStore>) {
    let store = Arc::new(RecordingStore::default());
    (context_over(store.clone(), ContextConfig::default()), store)
}

fn drain(events: &std::sync::mpsc::Receiver<ContextEvent>) -> Vec<ContextEvent> {
    events.try_iter().collect()
}

fn ledger(n: i64) -> ObjectId {
    ObjectId::single("Ledger", "LEDGER_ID", Value::Int(n))
}

fn seed_ledger(store: &RecordingStore, n: i64, balance: i64) {
    let mut row = std::collections::BTreeMap::new();
    row.insert("LEDGER_ID".to_string(), Value::Int(n));
    row.insert("balance".to_string(), Value::Int(balance));
    store.inner.insert_row(ledger(n), row);
}

// =============================================================================
// LIFECYCLE
// =============================================================================

mod lifecycle {
    use super::*;

    #[test]
    fn create_commit_modify_commit() {
        let (context, store) = fixture();
        let note = context.new_object("Note").expect("new");
        context.write_property(&note, "name", "a").expect("write");
        assert_eq!(context.state(&note), PersistenceState::New);

        let diff = context.commit_changes().expect("first commit");
        let note = diff.id_changes()[&note].clone();
        assert!(!note.is_temporary());
        assert_eq!(context.state(&note), PersistenceState::Committed);
        let snapshot = context.snapshot(&note).expect("snapshot");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("name"), Some(&Value::text("a")));

        context.write_property(&note, "name", "b").expect("write");
        assert_eq!(context.state(&note), PersistenceState::Modified);
        context.commit_changes().expect("second commit");

        let units = store.units();
        assert_eq!(units.len(), 2);
        let update = &units[1].rows;
        assert_eq!(update.len(), 1);
        assert!(matches!(
            &update[0],
            RowOperation::Update { id, values, .. }
                if id == &note && values.len() == 1 && values.get("name") == Some(&Value::text("b"))
        ));
        assert_eq!(context.state(&note), PersistenceState::Committed);
        assert_eq!(
            context.snapshot(&note).and_then(|s| s.get("name").cloned()),
            Some(Value::text("b"))
        );
    }

    #[test]
    fn new_objects_stay_new_when_written() {
        let (context, _) = fixture();
        let note = context.new_object("Note").expect("new");
        context.write_property(&note, "name", "x").expect("write");
        context.write_property(&note, "name", "y").expect("write");
        assert_eq!(context.state(&note), PersistenceState::New);
    }

    #[test]
    fn hollow_objects_load_then_modify() {
        let (context, store) = fixture();
        seed_ledger(&store, 1, 10);
        let id = context.local_object(&ledger(1)).expect("local");
        assert_eq!(context.state(&id), PersistenceState::Hollow);

        context.write_property(&id, "balance", 11_i64).expect("write");
        assert_eq!(context.state(&id), PersistenceState::Modified);
        assert_eq!(
            context.snapshot(&id).and_then(|s| s.get("balance").cloned()),
            Some(Value::Int(10))
        );
    }

    #[test]
    fn hollow_object_without_row_is_not_found() {
        let (context, _) = fixture();
        let id = context.local_object(&ledger(9)).expect("local");
        assert!(matches!(
            context.read_property(&id, "balance"),
            Err(TesseraError::ObjectNotFound(_))
        ));
    }

    #[test]
    fn deleting_new_object_records_nothing() {
        let (context, store) = fixture();
        let note = context.new_object("Note").expect("new");
        let before = context.uncommitted_diff();

        context.delete_object(&note).expect("delete");
        assert_eq!(context.uncommitted_diff(), before);
        assert_eq!(context.state(&note), PersistenceState::Transient);

        let diff = context.commit_changes().expect("commit");
        assert!(diff.is_empty());
        assert!(store.units().is_empty());
    }

    #[test]
    fn no_temporary_id_survives_commit() {
        let (context, _) = fixture();
        let artist = context.new_object("Artist").expect("artist");
        let painting = context.new_object("Painting").expect("painting");
        context
            .set_to_one(&painting, "artist", Some(&artist))
            .expect("link");
        let diff = context.commit_changes().expect("commit");

        let ids = diff.id_changes();
        assert_eq!(ids.len(), 2);
        for (old, new) in &ids {
            assert!(old.is_temporary());
            assert!(!new.is_temporary());
            assert_eq!(context.state(old), PersistenceState::Transient);
            assert_eq!(context.state(new), PersistenceState::Committed);
        }
        let painting = &ids[&painting];
        assert_eq!(
            context.read_to_one(painting, "artist").expect("read"),
            Some(ids[&artist].clone())
        );
    }
}

// =============================================================================
// RELATIONSHIPS
// =============================================================================

mod relationships {
    use super::*;

    #[test]
    fn to_one_reverse_appears_once() {
        let (context, _) = fixture();
        let artist = context.new_object("Artist").expect("artist");
        let painting = context.new_object("Painting").expect("painting");

        context
            .set_to_one(&painting, "artist", Some(&artist))
            .expect("link");
        let recorded = context.uncommitted_diff().len();
        context
            .set_to_one(&painting, "artist", Some(&artist))
            .expect("relink");

        assert_eq!(context.uncommitted_diff().len(), recorded);
        assert_eq!(
            context.read_to_many(&artist, "paintings").expect("read"),
            vec![painting]
        );
    }

    #[test]
    fn clearing_to_one_clears_reverse() {
        let (context, _) = fixture();
        let artist = context.new_object("Artist").expect("artist");
        let painting = context.new_object("Painting").expect("painting");
        context
            .set_to_one(&painting, "artist", Some(&artist))
            .expect("link");
        context.set_to_one(&painting, "artist", None).expect("clear");

        assert!(context.read_to_many(&artist, "paintings").expect("read").is_empty());
        assert_eq!(context.read_to_one(&painting, "artist").expect("read"), None);
    }

    #[test]
    fn to_one_fault_with_several_rows_fails() {
        let (context, store) = fixture();
        let painting = ObjectId::single("Painting", "PAINTING_ID", Value::Int(1));
        let first = ObjectId::single("Artist", "ARTIST_ID", Value::Int(1));
        let second = ObjectId::single("Artist", "ARTIST_ID", Value::Int(2));
        for id in [&painting, &first, &second] {
            store.inner.insert_row(id.clone(), Default::default());
        }
        store.inner.insert_arc(painting.clone(), "artist", first);
        store.inner.insert_arc(painting.clone(), "artist", second);

        let painting = context.local_object(&painting).expect("local");
        assert!(matches!(
            context.read_to_one(&painting, "artist"),
            Err(TesseraError::FaultFailure { .. })
        ));
    }

    #[test]
    fn one_to_one_moves_between_owners() {
        let (context, _) = fixture();
        let first = context.new_object("Painting").expect("first");
        let second = context.new_object("Painting").expect("second");
        let frame = context.new_object("Frame").expect("frame");

        context.set_to_one(&first, "frame", Some(&frame)).expect("link");
        context.set_to_one(&second, "frame", Some(&frame)).expect("steal");

        assert_eq!(context.read_to_one(&first, "frame").expect("read"), None);
        assert_eq!(context.read_to_one(&second, "frame").expect("read"), Some(frame.clone()));
        assert_eq!(context.read_to_one(&frame, "painting").expect("read"), Some(second));
    }

    #[test]
    fn deny_rule_blocks_delete() {
        let (context, _) = fixture();
        let gallery = context.new_object("Gallery").expect("gallery");
        let exhibit = context.new_object("Exhibit").expect("exhibit");
        context
            .add_to_many(&gallery, "exhibits", &exhibit)
            .expect("link");

        assert!(matches!(
            context.delete_object(&gallery),
            Err(TesseraError::DeleteDenied { .. })
        ));
        assert_eq!(context.state(&gallery), PersistenceState::New);
    }

    #[test]
    fn committed_cascade_delete_removes_rows() {
        let (context, store) = fixture();
        let artist = context.new_object("Artist").expect("artist");
        let painting = context.new_object("Painting").expect("painting");
        context
            .add_to_many(&artist, "paintings", &painting)
            .expect("link");
        let ids = context.commit_changes().expect("commit").id_changes();
        let (artist, painting) = (ids[&artist].clone(), ids[&painting].clone());
        assert_eq!(store.inner.row_count(), 2);
        assert!(store.inner.has_arc(&artist, "paintings", &painting));

        context.delete_object(&artist).expect("delete");
        assert_eq!(context.state(&painting), PersistenceState::Deleted);
        context.commit_changes().expect("commit delete");

        assert_eq!(store.inner.row_count(), 0);
        assert!(!store.inner.has_arc(&artist, "paintings", &painting));
        assert_eq!(context.registered_count(), 0);
    }

    #[test]
    fn broken_reverse_fails_commit_only_when_validated() {
        let resolver = || {
            EntityResolver::new()
                .with_entity(
                    EntityDescriptor::new("Owner")
                        .with_generated_key("ID")
                        .with_to_many("pets", "Pet", Some("missing")),
                )
                .with_entity(EntityDescriptor::new("Pet").with_generated_key("ID"))
        };
        let build = |validate_relationships| {
            init_tracing();
            let config = ContextConfig {
                validate_relationships,
                ..ContextConfig::default()
            };
            let context =
                ObjectContext::new(Arc::new(resolver()), Arc::new(MemoryStore::new()), config);
            let owner = context.new_object("Owner").expect("owner");
            let pet = context.new_object("Pet").expect("pet");
            context.add_to_many(&owner, "pets", &pet).expect("link");
            context
        };

        let strict = build(true);
        assert!(matches!(
            strict.commit_changes(),
            Err(TesseraError::Configuration(_))
        ));
        assert_eq!(strict.commit_phase(), CommitPhase::Aborted);

        let lenient = build(false);
        assert!(lenient.commit_changes().is_ok());
        assert_eq!(lenient.commit_phase(), CommitPhase::Committed);
    }
}

// =============================================================================
// COMMIT
// =============================================================================

mod commit {
    use super::*;

    #[test]
    fn empty_commit_dispatches_nothing() {
        let (context, store) = fixture();
        let (_, events) = context.subscribe();

        let diff = context.commit_changes().expect("commit");
        assert!(diff.is_empty());
        assert!(store.units().is_empty());
        assert_eq!(store.inner.executed_units(), 0);
        assert_eq!(context.commit_phase(), CommitPhase::Idle);
        assert!(drain(&events).is_empty());
    }

    #[test]
    fn fake_update_never_dispatches() {
        let (context, store) = fixture();
        seed_ledger(&store, 1, 10);
        let id = context.local_object(&ledger(1)).expect("local");

        context.write_property(&id, "balance", 12_i64).expect("write");
        context.write_property(&id, "balance", 10_i64).expect("write back");
        assert_eq!(context.state(&id), PersistenceState::Modified);

        context.commit_changes().expect("commit");
        assert!(store.units().is_empty());
        assert_eq!(context.state(&id), PersistenceState::Committed);
        assert!(!context.has_changes());
    }

    #[test]
    fn commit_publishes_started_and_completed() {
        let (context, _) = fixture();
        let note = context.new_object("Note").expect("new");
        context.write_property(&note, "name", "a").expect("write");
        let (_, events) = context.subscribe();

        context.commit_changes().expect("commit");
        let events = drain(&events);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ContextEvent::CommitStarted(d) if d.len() == 2));
        assert!(matches!(
            &events[1],
            ContextEvent::CommitCompleted(diff)
                if diff.len() == 1
                    && matches!(diff.operations()[0], GraphOperation::NodeIdChange { .. })
        ));
    }

    #[test]
    fn failed_dispatch_keeps_local_state() {
        let (context, store) = fixture();
        let note = context.new_object("Note").expect("new");
        context.write_property(&note, "name", "a").expect("write");
        let pending = context.uncommitted_diff();
        let (_, events) = context.subscribe();

        store
            .inner
            .fail_next_execute(TesseraError::StoreError("connection lost".into()));
        assert!(matches!(
            context.commit_changes(),
            Err(TesseraError::StoreError(_))
        ));

        assert_eq!(context.commit_phase(), CommitPhase::Aborted);
        assert_eq!(context.state(&note), PersistenceState::New);
        assert_eq!(context.uncommitted_diff(), pending);
        let events = drain(&events);
        assert!(matches!(
            events.last(),
            Some(ContextEvent::CommitAborted { pending: p, .. }) if *p == pending
        ));

        // A retry goes through with the same changes.
        let diff = context.commit_changes().expect("retry");
        let note = diff.id_changes()[&note].clone();
        assert_eq!(context.state(&note), PersistenceState::Committed);
        assert_eq!(store.inner.row_count(), 1);
    }

    #[test]
    fn propagated_key_uses_master_generated_key() {
        let (context, store) = fixture();
        let gallery = context.new_object("Gallery").expect("gallery");
        let exhibit = context.new_object("Exhibit").expect("exhibit");
        context.write_property(&exhibit, "slot", 7_i64).expect("slot");
        context
            .set_to_one(&exhibit, "gallery", Some(&gallery))
            .expect("link");

        let ids = context.commit_changes().expect("commit").id_changes();
        let gallery_key = ids[&gallery]
            .key_values()
            .and_then(|k| k.get("GALLERY_ID").cloned())
            .expect("gallery key");
        let exhibit_key = ids[&exhibit].key_values().cloned().expect("exhibit key");
        assert_eq!(exhibit_key.get("GALLERY_ID"), Some(&gallery_key));
        assert_eq!(exhibit_key.get("slot"), Some(&Value::Int(7)));

        // The master was inserted first.
        let rows = &store.units()[0].rows;
        assert_eq!(rows[0].id(), &ids[&gallery]);
        assert_eq!(rows[1].id(), &ids[&exhibit]);
    }

    #[test]
    fn two_missing_key_columns_is_configuration_error() {
        let resolver = EntityResolver::new().with_entity(
            EntityDescriptor::new("Pair")
                .with_generated_key("A")
                .with_generated_key("B"),
        );
        let context = ObjectContext::new(
            Arc::new(resolver),
            Arc::new(MemoryStore::new()),
            ContextConfig::silent(),
        );
        let pair = context.new_object("Pair").expect("new");
        assert!(matches!(
            context.commit_changes(),
            Err(TesseraError::Configuration(_))
        ));
        assert_eq!(context.state(&pair), PersistenceState::New);
    }

    #[test]
    fn stale_snapshot_loses_optimistic_lock() {
        let store = Arc::new(RecordingStore::default());
        seed_ledger(&store, 1, 10);
        let first = context_over(store.clone(), ContextConfig::silent());
        let second = context_over(store.clone(), ContextConfig::silent());
        let id = ledger(1);
        first.local_object(&id).expect("local");
        second.local_object(&id).expect("local");

        first.write_property(&id, "balance", 20_i64).expect("write");
        second.write_property(&id, "balance", 30_i64).expect("write");
        first.commit_changes().expect("first commit");

        assert!(matches!(
            second.commit_changes(),
            Err(TesseraError::OptimisticLockFailure(_))
        ));
        assert_eq!(second.state(&id), PersistenceState::Modified);
        assert_eq!(
            store.inner.row(&id).and_then(|r| r.get("balance").cloned()),
            Some(Value::Int(20))
        );
    }

    #[test]
    fn context_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ObjectContext>();
    }
}

// =============================================================================
// ROLLBACK AND FLUSH
// =============================================================================

mod rollback {
    use super::*;

    #[test]
    fn rollback_restores_committed_values() {
        let (context, store) = fixture();
        seed_ledger(&store, 1, 10);
        let id = context.local_object(&ledger(1)).expect("local");
        context.read_property(&id, "balance").expect("load");
        let note = context.new_object("Note").expect("new");

        context.write_property(&id, "balance", 99_i64).expect("write");
        let (_, events) = context.subscribe();
        let undone = context.rollback_changes();

        assert!(!undone.is_empty());
        assert_eq!(
            context.read_property(&id, "balance").expect("read"),
            Value::Int(10)
        );
        assert_eq!(context.state(&id), PersistenceState::Committed);
        assert_eq!(context.state(&note), PersistenceState::Transient);
        assert!(!context.has_changes());

        let events = drain(&events);
        assert_eq!(events, vec![ContextEvent::Rollback(undone)]);
    }

    #[test]
    fn rollback_moves_relationship_back() {
        let (context, _) = fixture();
        let first = context.new_object("Artist").expect("first");
        let second = context.new_object("Artist").expect("second");
        let painting = context.new_object("Painting").expect("painting");
        context
            .set_to_one(&painting, "artist", Some(&first))
            .expect("link");
        let ids = context.commit_changes().expect("commit").id_changes();
        let (first, second, painting) = (
            ids[&first].clone(),
            ids[&second].clone(),
            ids[&painting].clone(),
        );

        context
            .set_to_one(&painting, "artist", Some(&second))
            .expect("move");
        assert_eq!(context.state(&first), PersistenceState::Modified);
        assert_eq!(context.state(&second), PersistenceState::Modified);

        context.rollback_changes();

        assert_eq!(
            context.read_to_one(&painting, "artist").expect("artist"),
            Some(first.clone())
        );
        assert_eq!(
            context.read_to_many(&first, "paintings").expect("first"),
            vec![painting.clone()]
        );
        assert!(context
            .read_to_many(&second, "paintings")
            .expect("second")
            .is_empty());
        for id in [&first, &second, &painting] {
            assert_eq!(context.state(id), PersistenceState::Committed);
        }
        assert!(!context.has_changes());
    }

    #[test]
    fn rollback_with_nothing_pending_is_silent() {
        let (context, _) = fixture();
        let (_, events) = context.subscribe();
        assert!(context.rollback_changes().is_empty());
        assert!(drain(&events).is_empty());
    }

    #[test]
    fn flush_reports_changes_since_previous_flush() {
        let (context, _) = fixture();
        let (_, events) = context.subscribe();
        let note = context.new_object("Note").expect("new");
        assert_eq!(context.flush_changes().len(), 1);

        context.write_property(&note, "name", "a").expect("write");
        let second = context.flush_changes();
        assert_eq!(second.len(), 1);
        assert!(matches!(
            &second.operations()[0],
            GraphOperation::NodePropertyChange { property, .. } if property == "name"
        ));
        // Flushing commits nothing.
        assert_eq!(context.uncommitted_diff().len(), 2);

        let flushes = drain(&events)
            .into_iter()
            .filter(|e| matches!(e, ContextEvent::Flush(_)))
            .count();
        assert_eq!(flushes, 2);
    }
}

// =============================================================================
// MERGE
// =============================================================================

mod merge {
    use super::*;

    fn peers() -> (ObjectContext, ObjectContext, ObjectId) {
        let store = Arc::new(RecordingStore::default());
        seed_ledger(&store, 1, 10);
        let first = context_over(store.clone(), ContextConfig::silent());
        let second = context_over(store, ContextConfig::default());
        let id = ledger(1);
        for context in [&first, &second] {
            context.local_object(&id).expect("local");
            context.read_property(&id, "balance").expect("load");
        }
        (first, second, id)
    }

    #[test]
    fn peer_commit_lands_on_unchanged_object() {
        let (first, second, id) = peers();
        first.write_property(&id, "balance", 20_i64).expect("write");
        let diff = first.commit_changes().expect("commit");

        let report = second.merge(&diff);
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(second.read_property(&id, "balance").expect("read"), Value::Int(20));
        assert_eq!(second.state(&id), PersistenceState::Committed);
        assert!(!second.has_changes());
    }

    #[test]
    fn local_edit_wins_over_peer_commit() {
        let (first, second, id) = peers();
        second.write_property(&id, "balance", 30_i64).expect("local write");
        first.write_property(&id, "balance", 20_i64).expect("write");
        let diff = first.commit_changes().expect("commit");

        let report = second.apply_remote_diff(&diff);
        assert_eq!(report.applied, 0);
        assert_eq!(report.ignored, 1);
        assert_eq!(second.read_property(&id, "balance").expect("read"), Value::Int(30));
        assert_eq!(second.state(&id), PersistenceState::Modified);
    }

    #[test]
    fn merge_publishes_no_change_events() {
        let (first, second, id) = peers();
        first.write_property(&id, "balance", 20_i64).expect("write");
        let diff = first.commit_changes().expect("commit");

        let (_, events) = second.subscribe();
        second.merge(&diff);
        assert!(drain(&events).is_empty());
    }
}
