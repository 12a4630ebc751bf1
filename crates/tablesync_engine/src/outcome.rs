//! Per-table and per-run sync results.

use serde::Serialize;
use std::ops::AddAssign;
use std::time::Duration;
use tablesync_protocol::TableId;

/// Phase of a table's sync, reported to progress listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TablePhase {
    /// Task started.
    Working,
    /// Comparing schema ETags.
    SchemaCheck,
    /// Fetching changeset pages.
    Pull,
    /// Classifying and applying a page.
    ClassifyApply,
    /// Sending local changes.
    Push,
    /// Transferring row files.
    Attachments,
    /// Finished.
    Done,
}

impl TablePhase {
    /// Progress percentage at which the phase starts.
    pub fn base_percent(&self) -> u8 {
        match self {
            TablePhase::Working => 0,
            TablePhase::SchemaCheck => 5,
            TablePhase::Pull => 10,
            TablePhase::ClassifyApply => 20,
            TablePhase::Push => 50,
            TablePhase::Attachments => 75,
            TablePhase::Done => 100,
        }
    }
}

/// Final outcome of one table's sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableOutcome {
    /// Fully synchronized.
    Success,
    /// Rows were synchronized but conflict pairs remain.
    TableContainsConflicts,
    /// Rows were synchronized but some attachments still need transfer.
    TablePendingAttachments,
    /// Local schema is stale; the app must upgrade before syncing rows.
    TableRequiresAppLevelSync,
    /// The server rejected the credentials.
    AuthFailure,
    /// A network call failed or timed out.
    TransportFailure,
    /// The local store failed or an invariant was violated.
    LocalDatabaseFailure,
    /// The server kept answering 409 until the retry budget ran out.
    ConflictRetriesExhausted,
    /// The sync was cancelled.
    Cancelled,
    /// The table was not started because the run aborted.
    NotAttempted,
}

impl TableOutcome {
    /// Returns true for the three outcomes reached at `Done`.
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            TableOutcome::Success
                | TableOutcome::TableContainsConflicts
                | TableOutcome::TablePendingAttachments
        )
    }
}

/// Counters accumulated while syncing one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableCounters {
    /// Server rows inserted locally.
    pub inserts: u64,
    /// Local rows updated from the server.
    pub updates: u64,
    /// Local rows deleted.
    pub deletes: u64,
    /// Conflict pairs created.
    pub conflicts: u64,
    /// Rows the server accepted from a push.
    pub pushed: u64,
    /// Rows the server denied.
    pub denied: u64,
    /// Rows whose attachments must be retried later.
    pub attachment_retries: u64,
    /// Files uploaded.
    pub files_uploaded: u64,
    /// Files downloaded.
    pub files_downloaded: u64,
}

impl AddAssign for TableCounters {
    fn add_assign(&mut self, other: Self) {
        self.inserts += other.inserts;
        self.updates += other.updates;
        self.deletes += other.deletes;
        self.conflicts += other.conflicts;
        self.pushed += other.pushed;
        self.denied += other.denied;
        self.attachment_retries += other.attachment_retries;
        self.files_uploaded += other.files_uploaded;
        self.files_downloaded += other.files_downloaded;
    }
}

/// Result of syncing one table.
#[derive(Debug, Clone, Serialize)]
pub struct TableSyncResult {
    /// Table id.
    pub table_id: TableId,
    /// Final outcome.
    pub outcome: TableOutcome,
    /// Work committed before the outcome was reached.
    pub counters: TableCounters,
    /// Error text for failed outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Wall-clock time spent.
    #[serde(skip)]
    pub duration: Duration,
}

impl TableSyncResult {
    /// A table that was never started.
    pub fn not_attempted(table_id: TableId) -> Self {
        Self {
            table_id,
            outcome: TableOutcome::NotAttempted,
            counters: TableCounters::default(),
            message: None,
            duration: Duration::ZERO,
        }
    }
}

/// Aggregated result of a multi-table run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncRunResult {
    /// One result per requested table, in request order.
    pub tables: Vec<TableSyncResult>,
}

impl SyncRunResult {
    /// Looks up a table's result.
    pub fn get(&self, table_id: &TableId) -> Option<&TableSyncResult> {
        self.tables.iter().find(|r| &r.table_id == table_id)
    }

    /// Returns true if every table reached `Success`.
    pub fn all_succeeded(&self) -> bool {
        self.tables
            .iter()
            .all(|r| r.outcome == TableOutcome::Success)
    }

    /// Returns true if any table hit an authentication failure.
    pub fn auth_failed(&self) -> bool {
        self.tables
            .iter()
            .any(|r| r.outcome == TableOutcome::AuthFailure)
    }

    /// Sum of all table counters.
    pub fn totals(&self) -> TableCounters {
        let mut totals = TableCounters::default();
        for result in &self.tables {
            totals += result.counters;
        }
        totals
    }
}
