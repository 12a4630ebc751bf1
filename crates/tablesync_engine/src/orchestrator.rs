//! Per-table sync state machine.
//!
//! ```text
//! WORKING → SCHEMA_CHECK → PULL ⇄ CLASSIFY_APPLY → PUSH → ATTACHMENTS → DONE
//!                            ↑                        │
//!                            └──────── 409 ───────────┘
//! ```
//!
//! Every error is converted to a [`TableOutcome`] at the table boundary, so
//! one table's failure never affects another.

use crate::attachments::{AttachmentSynchronizer, TransferStatus};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::etag_cache::EtagCache;
use crate::outcome::{TableCounters, TableOutcome, TablePhase, TableSyncResult};
use crate::progress::{percent_within, NoProgress, SyncProgress};
use crate::reconciler::{self, ApplyReport};
use crate::remote::Remote;
use crate::resolver::{self, ConflictPair, Resolved};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tablesync_protocol::{
    AlterRowsRequest, AlterRowsResponse, ColumnKey, ConflictResolution, ConflictType, Row,
    RowChange, RowId, RowOutcomeKind, RowSide, SyncState, TableId, TableSyncState,
};
use tablesync_store::{
    AttachmentStore, EtagStore, MemoryAttachmentStore, MemoryEtagStore, RowStore, RowTransaction,
};
use tracing::{debug, info, warn};

/// Row states that carry local changes, in push order.
const PUSH_STATES: [SyncState; 3] = [SyncState::NewRow, SyncState::Changed, SyncState::Deleted];

/// The sync engine for one device replica.
///
/// Owns the local stores and the remote handle; each call to
/// [`SyncEngine::sync_table`] runs one table through the state machine.
pub struct SyncEngine<S: RowStore, R: Remote> {
    config: SyncConfig,
    store: Arc<S>,
    remote: Arc<R>,
    files: Arc<dyn AttachmentStore>,
    cache: EtagCache,
    progress: Arc<dyn SyncProgress>,
    cancelled: AtomicBool,
    aborted: AtomicBool,
}

impl<S: RowStore, R: Remote> SyncEngine<S, R> {
    /// Creates an engine with in-memory attachment and ETag stores.
    pub fn new(config: SyncConfig, store: S, remote: R) -> Self {
        Self {
            config,
            store: Arc::new(store),
            remote: Arc::new(remote),
            files: Arc::new(MemoryAttachmentStore::new()),
            cache: EtagCache::new(Arc::new(MemoryEtagStore::new())),
            progress: Arc::new(NoProgress),
            cancelled: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        }
    }

    /// Uses `files` for row attachments.
    pub fn with_attachment_store(mut self, files: Arc<dyn AttachmentStore>) -> Self {
        self.files = files;
        self
    }

    /// Persists manifest ETags and file hashes in `etags`.
    pub fn with_etag_store(mut self, etags: Arc<dyn EtagStore>) -> Self {
        self.cache = EtagCache::new(etags);
        self
    }

    /// Sends progress updates to `progress`.
    pub fn with_progress(mut self, progress: Arc<dyn SyncProgress>) -> Self {
        self.progress = progress;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the row store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the remote.
    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Returns the attachment store.
    pub fn attachment_store(&self) -> &dyn AttachmentStore {
        self.files.as_ref()
    }

    /// Returns the ETag cache.
    pub fn etag_cache(&self) -> &EtagCache {
        &self.cache
    }

    /// Cancels the running sync at its next checkpoint.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Clears a previous [`SyncEngine::cancel`].
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Stops every table of the current run at its next checkpoint.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// Returns true once the run has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Clears the abort flag before a new run.
    pub fn reset_abort(&self) {
        self.aborted.store(false, Ordering::SeqCst);
    }

    fn checkpoint(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else if self.is_aborted() {
            Err(SyncError::Aborted)
        } else {
            Ok(())
        }
    }

    fn report(&self, table_id: &TableId, phase: TablePhase, percent: u8) {
        self.progress.on_progress(table_id, phase, percent);
    }

    /// Synchronizes one table. Never fails: errors become the outcome.
    pub fn sync_table(&self, table_id: &TableId) -> TableSyncResult {
        let start = Instant::now();
        let mut counters = TableCounters::default();
        info!(table = %table_id, "table sync started");
        self.report(table_id, TablePhase::Working, TablePhase::Working.base_percent());

        let (outcome, message) = match self.run_table(table_id, &mut counters) {
            Ok(outcome) => {
                info!(table = %table_id, ?outcome, ?counters, "table sync finished");
                (outcome, None)
            }
            Err(err) => {
                if err.aborts_run() {
                    self.abort();
                }
                match err {
                    SyncError::Cancelled | SyncError::Aborted => {
                        info!(table = %table_id, reason = %err, ?counters, "table sync stopped")
                    }
                    _ => warn!(table = %table_id, error = %err, ?counters, "table sync failed"),
                }
                (err.outcome(), Some(err.to_string()))
            }
        };
        self.report(table_id, TablePhase::Done, TablePhase::Done.base_percent());

        TableSyncResult {
            table_id: table_id.clone(),
            outcome,
            counters,
            message,
            duration: start.elapsed(),
        }
    }

    fn run_table(&self, table_id: &TableId, counters: &mut TableCounters) -> SyncResult<TableOutcome> {
        self.checkpoint()?;
        self.check_schema(table_id)?;

        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            self.pull(table_id, counters)?;
            match self.push(table_id, counters) {
                Ok(()) => break,
                Err(SyncError::DataEtagConflict { .. }) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(SyncError::ConflictRetriesExhausted { attempts: attempt });
                    }
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    info!(table = %table_id, attempt, ?delay, "push rejected with 409, pulling again");
                    std::thread::sleep(delay);
                    self.checkpoint()?;
                }
                Err(err) => return Err(err),
            }
        }

        self.sync_attachments(table_id, counters)?;
        self.finish(table_id)
    }

    fn check_schema(&self, table_id: &TableId) -> SyncResult<()> {
        self.report(table_id, TablePhase::SchemaCheck, TablePhase::SchemaCheck.base_percent());
        let remote = self.remote.table_state(table_id)?;
        let local = self
            .store
            .table_state(table_id)?
            .and_then(|state| state.schema_etag);
        if local.as_deref() != Some(remote.schema_etag.as_str()) {
            return Err(SyncError::SchemaMismatch {
                table_id: table_id.to_string(),
                local,
                remote: remote.schema_etag,
            });
        }
        debug!(table = %table_id, schema_etag = %remote.schema_etag, "schema matches");
        Ok(())
    }

    /// Pulls every page since the stored data ETag.
    ///
    /// If the data ETag moved while paging, the first page's ETag is
    /// committed as the new baseline and the pull starts over.
    fn pull(&self, table_id: &TableId, counters: &mut TableCounters) -> SyncResult<()> {
        self.report(table_id, TablePhase::Pull, TablePhase::Pull.base_percent());
        let mut restarts = 0;
        loop {
            let baseline = self
                .store
                .table_state(table_id)?
                .and_then(|state| state.data_etag);
            let mut cursor: Option<String> = None;
            let mut first_etag: Option<String> = None;
            let mut pages = 0;

            let settled = loop {
                self.checkpoint()?;
                let page = self.remote.get_updates(
                    table_id,
                    baseline.as_deref(),
                    cursor.as_deref(),
                    self.config.page_size_hint,
                )?;
                pages += 1;
                let first = first_etag.get_or_insert_with(|| page.data_etag.clone()).clone();
                let last = !page.has_more || page.next_cursor.is_none();
                debug!(
                    table = %table_id,
                    page = pages,
                    rows = page.rows.len(),
                    data_etag = %page.data_etag,
                    last,
                    "changeset page"
                );

                let commit = last.then(|| first.clone());
                self.apply_page(table_id, &page.rows, commit, counters)?;
                self.report(
                    table_id,
                    TablePhase::ClassifyApply,
                    percent_within(TablePhase::ClassifyApply, pages, pages + usize::from(!last)),
                );

                if last {
                    break page.data_etag == first;
                }
                cursor = page.next_cursor;
            };

            if settled {
                return Ok(());
            }
            restarts += 1;
            if restarts > self.config.max_pull_restarts {
                return Err(SyncError::PullDidNotConverge { restarts });
            }
            info!(table = %table_id, restarts, "data ETag moved during pull, restarting");
        }
    }

    /// Classifies and applies one page in a single transaction, optionally
    /// committing a new data ETag with it.
    fn apply_page(
        &self,
        table_id: &TableId,
        page: &[RowChange],
        commit_etag: Option<String>,
        counters: &mut TableCounters,
    ) -> SyncResult<()> {
        let policy = self.config.conflict_policy;
        let report = self.store.transaction(table_id, |txn| {
            let snapshot: Vec<Row> = page
                .iter()
                .flat_map(|change| txn.physical_rows(&change.row_id))
                .collect();
            let classification = reconciler::classify(&snapshot, page);
            let mut report = reconciler::apply(txn, &classification)?;
            report
                .purged
                .extend(resolver::apply_policy(txn, policy, &report.conflicted)?);
            if let Some(etag) = commit_etag {
                let mut state = current_state(txn);
                state.data_etag = Some(etag);
                txn.set_table_state(state);
            }
            Ok::<_, SyncError>(report)
        })?;
        self.after_commit(table_id, report, counters)
    }

    fn after_commit(
        &self,
        table_id: &TableId,
        report: ApplyReport,
        counters: &mut TableCounters,
    ) -> SyncResult<()> {
        *counters += report.counters;
        for row_id in &report.purged {
            self.files.remove_row(table_id, row_id)?;
            let uri = self.remote.manifest_uri(table_id, row_id);
            self.cache.forget_manifest(&uri, table_id)?;
        }
        Ok(())
    }

    /// Pushes local changes in batches ordered by row id.
    fn push(&self, table_id: &TableId, counters: &mut TableCounters) -> SyncResult<()> {
        let mut rows = Vec::new();
        for state in PUSH_STATES {
            rows.extend(self.store.rows_by_sync_state(table_id, state)?);
        }
        rows.sort_by(|a, b| a.row_id.cmp(&b.row_id));
        if rows.is_empty() {
            return Ok(());
        }

        let batch_size = self.config.effective_push_batch_size();
        let total = rows.len().div_ceil(batch_size);
        self.report(table_id, TablePhase::Push, TablePhase::Push.base_percent());
        for (index, batch) in rows.chunks(batch_size).enumerate() {
            self.checkpoint()?;
            let request = AlterRowsRequest {
                prior_data_etag: self
                    .store
                    .table_state(table_id)?
                    .and_then(|state| state.data_etag),
                rows: batch.iter().map(Row::to_change).collect(),
            };
            debug!(table = %table_id, batch = index + 1, of = total, rows = batch.len(), "pushing");
            let response = self.remote.alter_rows(table_id, &request)?;

            let policy = self.config.conflict_policy;
            let report = self.store.transaction(table_id, |txn| {
                let mut report = apply_push_outcomes(txn, &response)?;
                report
                    .purged
                    .extend(resolver::apply_policy(txn, policy, &report.conflicted)?);
                Ok::<_, SyncError>(report)
            })?;
            self.after_commit(table_id, report, counters)?;
            self.report(
                table_id,
                TablePhase::Push,
                percent_within(TablePhase::Push, index + 1, total),
            );
        }
        Ok(())
    }

    fn sync_attachments(&self, table_id: &TableId, counters: &mut TableCounters) -> SyncResult<()> {
        let rows = self
            .store
            .rows_by_sync_state(table_id, SyncState::SyncedPendingFiles)?;
        if rows.is_empty() {
            return Ok(());
        }
        self.report(table_id, TablePhase::Attachments, TablePhase::Attachments.base_percent());

        let synchronizer = AttachmentSynchronizer::new(
            self.remote.as_ref(),
            self.files.as_ref(),
            &self.cache,
            self.config.attachment_policy,
            self.config.upload_byte_cap,
        );
        let checkpoint = || self.checkpoint();
        for (index, row) in rows.iter().enumerate() {
            self.checkpoint()?;
            let transfer = synchronizer.sync_row(table_id, row, &checkpoint)?;
            counters.files_uploaded += transfer.uploaded;
            counters.files_downloaded += transfer.downloaded;
            match transfer.status {
                TransferStatus::Synced => self.mark_files_synced(table_id, &row.row_id)?,
                TransferStatus::Failed => counters.attachment_retries += 1,
                TransferStatus::Deferred => {}
            }
            self.report(
                table_id,
                TablePhase::Attachments,
                percent_within(TablePhase::Attachments, index + 1, rows.len()),
            );
        }
        Ok(())
    }

    fn mark_files_synced(&self, table_id: &TableId, row_id: &RowId) -> SyncResult<()> {
        self.store.transaction(table_id, |txn| {
            if let Some(mut row) = txn.get(row_id, RowSide::Local) {
                // a concurrent edit wins over the finished transfer
                if row.sync_state == SyncState::SyncedPendingFiles {
                    row.sync_state = SyncState::Synced;
                    txn.upsert_row(row)?;
                }
            }
            Ok::<_, SyncError>(())
        })
    }

    fn finish(&self, table_id: &TableId) -> SyncResult<TableOutcome> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        self.store.transaction(table_id, |txn| {
            let mut state = current_state(txn);
            state.last_sync_time = Some(now);
            txn.set_table_state(state);
            Ok::<_, SyncError>(())
        })?;

        let outcome = if !self
            .store
            .rows_by_sync_state(table_id, SyncState::InConflict)?
            .is_empty()
        {
            TableOutcome::TableContainsConflicts
        } else if !self
            .store
            .rows_by_sync_state(table_id, SyncState::SyncedPendingFiles)?
            .is_empty()
        {
            TableOutcome::TablePendingAttachments
        } else {
            TableOutcome::Success
        };
        Ok(outcome)
    }

    /// Lists a table's unresolved conflict pairs.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn list_conflicts(&self, table_id: &TableId) -> SyncResult<Vec<ConflictPair>> {
        resolver::list_conflicts(self.store.as_ref(), table_id)
    }

    /// Resolves one conflict pair in its own transaction.
    ///
    /// `server_columns` names the server values merged into the local row
    /// for [`ConflictResolution::TakeLocalPlusServerDeltas`].
    ///
    /// # Errors
    ///
    /// Returns an error if the row is not in conflict, the strategy does not
    /// apply to it, or the store fails.
    pub fn resolve_conflict(
        &self,
        table_id: &TableId,
        row_id: &RowId,
        resolution: ConflictResolution,
        server_columns: &[ColumnKey],
    ) -> SyncResult<Resolved> {
        let resolved = self.store.transaction(table_id, |txn| {
            resolver::resolve(txn, row_id, resolution, server_columns)
        })?;
        info!(table = %table_id, row = %row_id, ?resolution, "conflict resolved");
        if resolved == Resolved::Purged {
            self.files.remove_row(table_id, row_id)?;
        }
        Ok(resolved)
    }
}

fn current_state(txn: &dyn RowTransaction) -> TableSyncState {
    txn.table_state().unwrap_or_else(|| TableSyncState {
        table_id: txn.table_id().clone(),
        schema_etag: None,
        data_etag: None,
        last_sync_time: None,
    })
}

/// Applies per-row push outcomes and the new data ETag.
fn apply_push_outcomes(
    txn: &mut dyn RowTransaction,
    response: &AlterRowsResponse,
) -> SyncResult<ApplyReport> {
    let mut report = ApplyReport::default();
    for outcome in &response.outcomes {
        let row_id = &outcome.row.row_id;
        let Some(mut local) = txn.get(row_id, RowSide::Local) else {
            warn!(table = %txn.table_id(), row = %row_id, "push outcome for unknown row");
            continue;
        };
        match outcome.outcome {
            RowOutcomeKind::Success => {
                report.counters.pushed += 1;
                if local.is_local_delete() {
                    txn.delete_all(row_id);
                    report.counters.deletes += 1;
                    report.purged.push(row_id.clone());
                } else {
                    local.row_etag = outcome.row.row_etag.clone();
                    local.metadata.filter = outcome.row.metadata.filter.clone();
                    local.conflict_type = None;
                    local.refresh_attachment_refs(txn.schema());
                    local.sync_state = local.settled_state();
                    txn.upsert_row(local)?;
                }
            }
            RowOutcomeKind::Failed if local.is_local_delete() => {
                // the server never had the row
                txn.delete_all(row_id);
                report.counters.deletes += 1;
                report.purged.push(row_id.clone());
            }
            RowOutcomeKind::Failed => {
                return Err(SyncError::InvariantViolation(format!(
                    "server failed to apply row {row_id}"
                )));
            }
            RowOutcomeKind::InConflict => {
                let local_type = ConflictType::for_local(local.is_local_delete());
                resolver::place_in_conflict(txn, &outcome.row, local_type)?;
                report.counters.conflicts += 1;
                report.conflicted.push(row_id.clone());
            }
            RowOutcomeKind::Denied => {
                warn!(table = %txn.table_id(), row = %row_id, "server denied row");
                report.counters.denied += 1;
            }
        }
    }

    let mut state = current_state(txn);
    state.data_etag = Some(response.data_etag.clone());
    txn.set_table_state(state);
    Ok(report)
}
