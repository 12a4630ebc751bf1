//! Integration tests for the sync engine and the reference server.

use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tablesync_engine::attachments::partition_by_size;
use tablesync_engine::reconciler::{self, UpdateKind};
use tablesync_engine::{
    classify, HttpMethod, HttpRequest, HttpResponse, LoopbackClient, LoopbackServer, RestRemote,
    RetryConfig, SyncConfig, SyncCoordinator, SyncEngine, SyncError, TableCounters, TableOutcome,
};
use tablesync_protocol::{
    ColumnDefinition, ConflictResolution, ElementDataType, Row, RowId, ScalarValue, SyncState,
    TableId, TableSchema, TableSyncState,
};
use tablesync_server::{ServerConfig, ServerRequest, TableServer};
use tablesync_store::{
    check_row_pairing, edits, AttachmentStore, MemoryAttachmentStore, MemoryRowStore, RowStore, StoreConfig,
    StoreError,
};
use tablesync_testkit::prelude::*;

type Hook = Box<dyn FnOnce(&TableServer) + Send>;

/// Connects the engine's HTTP adapter to an in-process server.
struct Bridge {
    server: Arc<TableServer>,
    before_push: Mutex<Option<Hook>>,
}

impl LoopbackServer for Bridge {
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        if request.method == HttpMethod::Put {
            if let Some(hook) = self.before_push.lock().take() {
                hook(&self.server);
            }
        }
        let response = self.server.handle_http(&ServerRequest {
            method: request.method.as_str().to_string(),
            path: request.path.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        });
        HttpResponse {
            status: response.status,
            headers: response.headers,
            body: response.body,
        }
    }
}

type Engine = SyncEngine<MemoryRowStore, RestRemote<LoopbackClient<Bridge>>>;

fn config() -> SyncConfig {
    SyncConfig::default().with_retry(RetryConfig::immediate(3))
}

fn device_with(server: &Arc<TableServer>, store: MemoryRowStore, config: SyncConfig) -> Engine {
    let bridge = Bridge {
        server: Arc::clone(server),
        before_push: Mutex::new(None),
    };
    let remote = RestRemote::new("http://sync.test", LoopbackClient::new(bridge), &config);
    SyncEngine::new(config, store, remote)
        .with_attachment_store(Arc::new(MemoryAttachmentStore::new()))
}

fn device(server: &Arc<TableServer>) -> Engine {
    device_with(server, TestReplica::new().store, config())
}

fn rows(engine: &Engine) -> Vec<Row> {
    engine.store().rows(&table_id()).unwrap()
}

fn names(engine: &Engine) -> BTreeMap<RowId, ScalarValue> {
    rows(engine)
        .into_iter()
        .filter_map(|row| Some((row.row_id.clone(), row.columns.get(&"name".into())?.clone())))
        .collect()
}

fn insert(engine: &Engine, name: &str) -> RowId {
    engine
        .store()
        .transaction(&table_id(), |txn| {
            edits::insert_local_row(txn, columns([("name", name)]), Default::default())
        })
        .unwrap()
}

#[test]
fn first_sync_pulls_server_rows() {
    let server = test_server(ServerConfig::default());
    scenarios::remote_edits(server.tables(), [("a", "Ada"), ("b", "Grace"), ("c", "Linus")]);
    let engine = device(&server);

    let result = engine.sync_table(&table_id());
    assert_eq!(result.outcome, TableOutcome::Success);
    assert_eq!(result.counters.inserts, 3);

    let local = rows(&engine);
    assert_eq!(local.len(), 3);
    assert!(local.iter().all(|row| row.sync_state == SyncState::Synced));
    let state = engine.store().table_state(&table_id()).unwrap().unwrap();
    assert_eq!(state.data_etag.as_deref(), Some("d3"));
}

#[test]
fn paged_pull_with_small_server_pages() {
    let server = test_server(ServerConfig::default().with_max_page_size(2));
    scenarios::remote_edits(
        server.tables(),
        [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4"), ("e", "5")],
    );
    let engine = device_with(&server, TestReplica::new().store, config().with_page_size_hint(2));

    let result = engine.sync_table(&table_id());
    assert_eq!(result.outcome, TableOutcome::Success);
    assert_eq!(result.counters.inserts, 5);
}

#[test]
fn local_insert_round_trips() {
    let server = test_server(ServerConfig::default());
    let engine = device(&server);
    let id = insert(&engine, "Ada");

    let first = engine.sync_table(&table_id());
    assert_eq!(first.outcome, TableOutcome::Success);
    assert_eq!(first.counters.pushed, 1);

    let stored = server.tables().row(&table_id(), &id).unwrap();
    assert_eq!(stored.values.get(&"name".into()), Some(&ScalarValue::from("Ada")));
    let local = engine.store().physical_rows(&table_id(), &id).unwrap();
    assert_eq!(local[0].row_etag, stored.row_etag);
    assert_eq!(local[0].sync_state, SyncState::Synced);

    let second = engine.sync_table(&table_id());
    assert_eq!(second.outcome, TableOutcome::Success);
    assert_eq!(second.counters, TableCounters::default());
}

#[test]
fn two_devices_converge() {
    let server = test_server(ServerConfig::default());
    let a = device(&server);
    let b = device(&server);
    insert(&a, "from a");
    insert(&b, "from b");

    for engine in [&a, &b, &a] {
        assert_eq!(engine.sync_table(&table_id()).outcome, TableOutcome::Success);
    }
    assert_eq!(names(&a), names(&b));
    assert_eq!(names(&a).len(), 2);
}

#[test]
fn local_delete_reaches_server() {
    let server = test_server(ServerConfig::default());
    let engine = device(&server);
    let id = insert(&engine, "Ada");
    engine.sync_table(&table_id());

    engine
        .store()
        .transaction(&table_id(), |txn| edits::delete_local_row(txn, &id))
        .unwrap();
    let result = engine.sync_table(&table_id());
    assert_eq!(result.outcome, TableOutcome::Success);
    assert!(rows(&engine).is_empty());
    assert!(server.tables().row(&table_id(), &id).unwrap().deleted);
}

#[test]
fn concurrent_edit_becomes_conflict_and_resolves() {
    let server = test_server(ServerConfig::default());
    let engine = device(&server);
    let id = insert(&engine, "original");
    engine.sync_table(&table_id());

    let mut theirs = server.tables().row(&table_id(), &id).unwrap();
    theirs.values.insert("name".into(), "theirs".into());
    server.tables().put_row(&table_id(), theirs).unwrap();
    engine
        .store()
        .transaction(&table_id(), |txn| {
            edits::update_local_row(txn, &id, columns([("name", "mine")]))
        })
        .unwrap();

    let result = engine.sync_table(&table_id());
    assert_eq!(result.outcome, TableOutcome::TableContainsConflicts);
    assert_eq!(engine.list_conflicts(&table_id()).unwrap().len(), 1);

    engine
        .resolve_conflict(&table_id(), &id, ConflictResolution::TakeLocal, &[])
        .unwrap();
    let result = engine.sync_table(&table_id());
    assert_eq!(result.outcome, TableOutcome::Success);
    assert_eq!(result.counters.pushed, 1);
    let stored = server.tables().row(&table_id(), &id).unwrap();
    assert_eq!(stored.values.get(&"name".into()), Some(&ScalarValue::from("mine")));
}

#[test]
fn stale_push_pulls_again_and_retries() {
    let server = test_server(ServerConfig::default());
    let engine = device(&server);
    insert(&engine, "mine");
    *engine.remote().client().server().before_push.lock() = Some(Box::new(|server: &TableServer| {
        scenarios::remote_edits(server.tables(), [("interloper", "theirs")]);
    }));

    let result = engine.sync_table(&table_id());
    assert_eq!(result.outcome, TableOutcome::Success);
    assert_eq!(result.counters.inserts, 1);
    assert_eq!(result.counters.pushed, 1);
    assert_eq!(rows(&engine).len(), 2);
}

#[test]
fn attachments_travel_between_devices() {
    let server = test_server(ServerConfig::default());
    let files = TempAttachments::new();
    let a = device(&server).with_attachment_store(files.store.clone());
    let id = a
        .store()
        .transaction(&table_id(), |txn| {
            edits::insert_local_row(
                txn,
                columns([("name", "Ada"), ("photo", "ada.jpg")]),
                Default::default(),
            )
        })
        .unwrap();
    files.store.write(&table_id(), &id, "ada.jpg", b"jpeg bytes").unwrap();

    let result = a.sync_table(&table_id());
    assert_eq!(result.outcome, TableOutcome::Success);
    assert_eq!(a.store().physical_rows(&table_id(), &id).unwrap()[0].sync_state, SyncState::Synced);

    let b = device(&server);
    let result = b.sync_table(&table_id());
    assert_eq!(result.outcome, TableOutcome::Success);
    assert_eq!(
        b.attachment_store().read(&table_id(), &id, "ada.jpg").unwrap(),
        b"jpeg bytes"
    );
}

#[test]
fn missing_local_file_keeps_row_pending() {
    let server = test_server(ServerConfig::default());
    let engine = device(&server);
    let id = engine
        .store()
        .transaction(&table_id(), |txn| {
            edits::insert_local_row(txn, columns([("photo", "gone.jpg")]), Default::default())
        })
        .unwrap();

    let result = engine.sync_table(&table_id());
    assert_eq!(result.outcome, TableOutcome::TablePendingAttachments);
    assert_eq!(
        engine.store().physical_rows(&table_id(), &id).unwrap()[0].sync_state,
        SyncState::SyncedPendingFiles
    );
}

#[test]
fn stale_schema_stops_the_table() {
    let server = test_server(ServerConfig::default());
    let engine = device_with(&server, TestReplica::with_schema_etag("schema-0").store, config());
    insert(&engine, "Ada");

    let result = engine.sync_table(&table_id());
    assert_eq!(result.outcome, TableOutcome::TableRequiresAppLevelSync);
    assert!(server.tables().diff(&table_id(), None, None, 10).unwrap().rows.is_empty());
}

#[test]
fn bearer_tokens_gate_the_api() {
    let server = test_server(ServerConfig::default().with_auth(b"integration secret".to_vec()));
    let anonymous = device(&server);
    assert_eq!(anonymous.sync_table(&table_id()).outcome, TableOutcome::AuthFailure);
    assert!(anonymous.is_aborted());

    let token = server.issue_token("collector7").unwrap().unwrap();
    let bridge = Bridge {
        server: Arc::clone(&server),
        before_push: Mutex::new(None),
    };
    let remote = RestRemote::new("http://sync.test", LoopbackClient::new(bridge), &config())
        .with_authorization(format!("Bearer {token}"));
    let engine = SyncEngine::new(config(), TestReplica::new().store, remote);
    assert_eq!(engine.sync_table(&table_id()).outcome, TableOutcome::Success);
}

#[test]
fn unavailable_server_is_a_transport_failure() {
    let server = test_server(ServerConfig::default());
    server.set_unavailable(true);
    let engine = device(&server);
    let result = engine.sync_table(&table_id());
    assert_eq!(result.outcome, TableOutcome::TransportFailure);
    assert!(result.message.is_some());
    assert!(!engine.is_aborted());
}

#[tokio::test]
async fn coordinator_syncs_every_table() {
    let server = test_server(ServerConfig::default());
    server.tables().create_table("notes", "schema-n");
    let notes = TableId::from("notes");
    let store = MemoryRowStore::new(
        StoreConfig::new().with_table(visits_schema()).with_table(TableSchema::new(
            "notes",
            vec![ColumnDefinition::new("name", ElementDataType::String)],
        )),
    );
    for (table, etag) in [(table_id(), SCHEMA_ETAG), (notes.clone(), "schema-n")] {
        store
            .transaction(&table, |txn| {
                txn.set_table_state(TableSyncState::new(table.clone(), etag));
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }
    scenarios::remote_edits(server.tables(), [("a", "Ada")]);

    let engine = Arc::new(device_with(&server, store, config()));
    let run = SyncCoordinator::new(engine)
        .with_max_concurrent_tables(2)
        .sync_tables(&[table_id(), notes.clone()])
        .await;
    assert!(run.all_succeeded());
    assert_eq!(run.get(&table_id()).unwrap().counters.inserts, 1);
    assert_eq!(run.get(&notes).unwrap().counters.inserts, 0);
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn classification_buckets_are_disjoint(
        local in local_rows_strategy(10),
        page in changeset_rows_strategy(10),
    ) {
        let plan = classify(&local, &page);
        let mut seen = BTreeSet::new();
        let ids = plan
            .to_insert
            .iter()
            .map(|c| &c.row_id)
            .chain(plan.to_update.iter().map(|u| &u.change.row_id))
            .chain(plan.to_delete.iter())
            .chain(plan.to_conflict.iter().map(|c| &c.change.row_id));
        for id in ids {
            prop_assert!(seen.insert(id.clone()), "{} classified twice", id);
        }

        let states: BTreeMap<_, _> = local.iter().map(|r| (&r.row_id, r.sync_state)).collect();
        for change in &plan.to_insert {
            prop_assert!(!states.contains_key(&change.row_id));
            prop_assert!(!change.deleted);
        }
        for update in &plan.to_update {
            if update.kind == UpdateKind::ServerWins {
                prop_assert!(states[&update.change.row_id].is_synced());
            }
        }
        for case in &plan.to_conflict {
            prop_assert!(states[&case.change.row_id].needs_push());
        }
        prop_assert_eq!(classify(&local, &page), plan);
    }

    #[test]
    fn upload_batches_respect_the_cap(
        parts in prop::collection::vec(file_part_strategy(512), 0..12),
        cap in 1u64..1024,
    ) {
        let names: Vec<String> = parts.iter().map(|p| p.filename.clone()).collect();
        let batches = partition_by_size(parts, cap, |p| p.contents.len() as u64);
        for batch in &batches {
            let bytes: u64 = batch.iter().map(|p| p.contents.len() as u64).sum();
            prop_assert!(batch.len() == 1 || bytes <= cap);
        }
        let flattened: Vec<String> = batches.into_iter().flatten().map(|p| p.filename).collect();
        prop_assert_eq!(flattened, names);
    }

    #[test]
    fn replaying_a_pull_changes_nothing(local in local_rows_strategy(8), page in changeset_rows_strategy(8)) {
        let synced: Vec<Row> = local
            .into_iter()
            .filter(|row| row.sync_state.is_synced())
            .map(|mut row| {
                row.sync_state = SyncState::Synced;
                row
            })
            .collect();
        let server = test_server(ServerConfig::default());
        for change in page.iter().filter(|c| !c.deleted) {
            server.tables().put_row(&table_id(), change.clone()).unwrap();
        }
        let replica = TestReplica::new();
        replica.seed(synced);
        let engine = device_with(&server, replica.store, config());

        prop_assert_eq!(engine.sync_table(&table_id()).outcome, TableOutcome::Success);
        let after_first = rows(&engine);
        engine
            .store()
            .transaction(&table_id(), |txn| {
                let mut state = txn.table_state().unwrap();
                state.data_etag = None;
                txn.set_table_state(state);
                Ok::<_, StoreError>(())
            })
            .unwrap();
        let second = engine.sync_table(&table_id());
        prop_assert_eq!(second.outcome, TableOutcome::Success);
        prop_assert_eq!(second.counters.inserts + second.counters.updates, 0);
        prop_assert_eq!(rows(&engine), after_first);
    }

    #[test]
    fn applying_a_page_twice_over_mixed_states(local in mixed_local_rows_strategy(8), page in changeset_rows_strategy(8)) {
        let replica = TestReplica::new();
        replica.seed(local);
        let apply_page = || {
            replica
                .store
                .transaction(&replica.table_id, |txn| {
                    let snapshot: Vec<Row> = page
                        .iter()
                        .flat_map(|change| txn.physical_rows(&change.row_id))
                        .collect();
                    let classification = classify(&snapshot, &page);
                    reconciler::apply(txn, &classification)?;
                    Ok::<_, SyncError>(())
                })
        };

        prop_assert!(apply_page().is_ok());
        let after_first = replica.rows();
        prop_assert!(apply_page().is_ok());
        prop_assert_eq!(replica.rows(), after_first);

        let ids: BTreeSet<RowId> = replica.rows().into_iter().map(|row| row.row_id).collect();
        for id in ids {
            let physical = replica.physical(&id);
            prop_assert!(check_row_pairing(&id, &physical).is_ok());
        }
    }
}
