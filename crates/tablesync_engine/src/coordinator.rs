//! Multi-table sync runs.
//!
//! Tables share no invariants, so each one runs as its own blocking task.
//! The only shared state is the results accumulator and the engine's abort
//! flag, which an authentication failure raises for the whole run.

use crate::orchestrator::SyncEngine;
use crate::outcome::{SyncRunResult, TableOutcome, TableSyncResult};
use crate::remote::Remote;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tablesync_protocol::TableId;
use tablesync_store::RowStore;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Runs several tables through one [`SyncEngine`] concurrently.
pub struct SyncCoordinator<S: RowStore + 'static, R: Remote + 'static> {
    engine: Arc<SyncEngine<S, R>>,
    max_concurrent_tables: usize,
}

impl<S: RowStore + 'static, R: Remote + 'static> SyncCoordinator<S, R> {
    /// Creates a coordinator with no concurrency limit.
    pub fn new(engine: Arc<SyncEngine<S, R>>) -> Self {
        Self {
            engine,
            max_concurrent_tables: Semaphore::MAX_PERMITS,
        }
    }

    /// Limits how many tables sync at the same time (at least one).
    pub fn with_max_concurrent_tables(mut self, limit: usize) -> Self {
        self.max_concurrent_tables = limit.clamp(1, Semaphore::MAX_PERMITS);
        self
    }

    /// Returns the engine.
    pub fn engine(&self) -> &Arc<SyncEngine<S, R>> {
        &self.engine
    }

    /// Synchronizes `tables`, returning one result per table in request order.
    ///
    /// An authentication failure in any table stops running tables at their
    /// next checkpoint; tables not yet started report
    /// [`TableOutcome::NotAttempted`].
    pub async fn sync_tables(&self, tables: &[TableId]) -> SyncRunResult {
        self.engine.reset_cancel();
        self.engine.reset_abort();
        info!(tables = tables.len(), "sync run started");

        let results: Arc<Mutex<Vec<Option<TableSyncResult>>>> =
            Arc::new(Mutex::new(vec![None; tables.len()]));
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_tables));
        let mut handles = Vec::with_capacity(tables.len());

        for (index, table_id) in tables.iter().enumerate() {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let engine = Arc::clone(&self.engine);
            let results = Arc::clone(&results);
            let table_id = table_id.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let result = if engine.is_aborted() {
                    TableSyncResult::not_attempted(table_id)
                } else {
                    engine.sync_table(&table_id)
                };
                results.lock()[index] = Some(result);
            });
            handles.push((index, handle));
        }

        for (index, handle) in handles {
            if let Err(err) = handle.await {
                warn!(table = %tables[index], error = %err, "table task did not complete");
                results.lock()[index] = Some(TableSyncResult {
                    table_id: tables[index].clone(),
                    outcome: TableOutcome::LocalDatabaseFailure,
                    counters: Default::default(),
                    message: Some(format!("table task failed: {err}")),
                    duration: Duration::ZERO,
                });
            }
        }

        let mut results = results.lock();
        let run = SyncRunResult {
            tables: tables
                .iter()
                .zip(results.iter_mut())
                .map(|(table_id, slot)| {
                    slot.take()
                        .unwrap_or_else(|| TableSyncResult::not_attempted(table_id.clone()))
                })
                .collect(),
        };
        info!(
            succeeded = run.all_succeeded(),
            auth_failed = run.auth_failed(),
            "sync run finished"
        );
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::remote::MockRemote;
    use tablesync_protocol::{
        ChangesetPage, ColumnDefinition, ElementDataType, RemoteTableState, RowChange,
        TableSchema, TableSyncState,
    };
    use tablesync_store::{MemoryRowStore, StoreConfig, StoreError};

    const TABLES: [&str; 3] = ["alpha", "beta", "gamma"];

    fn coordinator() -> SyncCoordinator<MemoryRowStore, MockRemote> {
        let mut config = StoreConfig::new();
        let remote = MockRemote::new();
        for name in TABLES {
            config = config.with_table(TableSchema::new(
                name,
                vec![ColumnDefinition::new("n", ElementDataType::Integer)],
            ));
            remote.set_table_state(RemoteTableState {
                table_id: name.into(),
                schema_etag: "s1".into(),
                data_etag: None,
            });
        }
        let store = MemoryRowStore::new(config);
        for name in TABLES {
            store
                .transaction(&name.into(), |txn| {
                    txn.set_table_state(TableSyncState::new(name, "s1"));
                    Ok::<_, StoreError>(())
                })
                .unwrap();
        }
        let engine = SyncEngine::new(SyncConfig::default(), store, remote);
        SyncCoordinator::new(Arc::new(engine))
    }

    fn tables() -> Vec<TableId> {
        TABLES.iter().map(|t| TableId::from(*t)).collect()
    }

    #[tokio::test]
    async fn tables_sync_independently() {
        let coordinator = coordinator();
        let remote = coordinator.engine().remote();
        remote.queue_page(
            &"alpha".into(),
            Ok(ChangesetPage::last(vec![RowChange::update("r1", "e1")], "d1")),
        );
        remote.set_table_state(RemoteTableState {
            table_id: "beta".into(),
            schema_etag: "s2".into(),
            data_etag: None,
        });
        remote.queue_page(
            &"gamma".into(),
            Err(crate::error::SyncError::transport_retryable("reset")),
        );

        let run = coordinator.sync_tables(&tables()).await;
        assert_eq!(run.tables.len(), 3);
        let outcome = |t: &str| run.get(&t.into()).map(|r| r.outcome);
        assert_eq!(outcome("alpha"), Some(TableOutcome::Success));
        assert_eq!(outcome("beta"), Some(TableOutcome::TableRequiresAppLevelSync));
        assert_eq!(outcome("gamma"), Some(TableOutcome::TransportFailure));
        assert_eq!(run.totals().inserts, 1);
        assert!(!run.all_succeeded());
    }

    #[tokio::test]
    async fn auth_failure_stops_the_run() {
        let coordinator = coordinator().with_max_concurrent_tables(1);
        coordinator.engine().remote().set_fail_auth(true);

        let run = coordinator.sync_tables(&tables()).await;
        let outcomes: Vec<_> = run.tables.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            [
                TableOutcome::AuthFailure,
                TableOutcome::NotAttempted,
                TableOutcome::NotAttempted
            ]
        );
        assert!(run.auth_failed());

        // a new run starts clean
        coordinator.engine().remote().set_fail_auth(false);
        let run = coordinator.sync_tables(&tables()).await;
        assert!(run.all_succeeded());
    }
}
