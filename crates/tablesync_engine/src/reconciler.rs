//! Row reconciler: classifies a page of server changes against local rows.
//!
//! Classification is a pure function of the local rows' sync states and the
//! server payload, so replaying the same page after it was applied produces
//! the same final state.

use crate::error::SyncResult;
use crate::outcome::TableCounters;
use crate::resolver;
use serde::Serialize;
use std::collections::BTreeMap;
use tablesync_protocol::{ConflictType, Row, RowChange, RowId, RowSide, SyncState};
use tablesync_store::RowTransaction;

/// How a `to_update` entry is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// The local row matches the server; take the server's row outright.
    ServerWins,
    /// Values already agree; only the row ETag and filter scope move over.
    AbsorbMetadata,
}

/// A server change that updates an existing local row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowUpdate {
    /// The server's version of the row.
    pub change: RowChange,
    /// How to apply it.
    pub kind: UpdateKind,
}

/// A server change that collides with local edits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictCase {
    /// The server's version of the row.
    pub change: RowChange,
    /// Tag for the local half of the pair.
    pub local_type: ConflictType,
}

/// The four disjoint action lists produced for one page.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Classification {
    /// Server rows new to this device.
    pub to_insert: Vec<RowChange>,
    /// Local rows to refresh from the server.
    pub to_update: Vec<RowUpdate>,
    /// Rows to purge locally.
    pub to_delete: Vec<RowId>,
    /// Rows to place in conflict.
    pub to_conflict: Vec<ConflictCase>,
}

impl Classification {
    /// Returns true if the page requires no local change.
    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty()
            && self.to_update.is_empty()
            && self.to_delete.is_empty()
            && self.to_conflict.is_empty()
    }
}

fn already_current(local: &Row, change: &RowChange) -> bool {
    local.sync_state.is_synced()
        && local.row_etag == change.row_etag
        && local.identical_except_etag_and_filter(change)
        && local.metadata.filter == change.metadata.filter
}

/// Classifies one page of server changes against the local rows of a table.
///
/// `local_rows` may contain both halves of conflict pairs; server-tagged
/// halves are skipped and handled through their local partner. If a page
/// lists a row twice, the later entry wins.
pub fn classify(local_rows: &[Row], page: &[RowChange]) -> Classification {
    let mut server: BTreeMap<&RowId, &RowChange> =
        page.iter().map(|change| (&change.row_id, change)).collect();
    let mut out = Classification::default();

    let mut locals: Vec<&Row> = local_rows
        .iter()
        .filter(|row| row.side() == RowSide::Local)
        .collect();
    locals.sort_by(|a, b| a.row_id.cmp(&b.row_id));

    for local in locals {
        let Some(change) = server.remove(&local.row_id) else {
            continue;
        };

        match local.sync_state {
            SyncState::Synced | SyncState::SyncedPendingFiles => {
                if change.deleted {
                    out.to_delete.push(local.row_id.clone());
                } else if !already_current(local, change) {
                    out.to_update.push(RowUpdate {
                        change: change.clone(),
                        kind: UpdateKind::ServerWins,
                    });
                }
            }
            _ if change.deleted && local.is_local_delete() => {
                out.to_delete.push(local.row_id.clone());
            }
            _ => {
                let local_type = match (local.sync_state, local.conflict_type) {
                    (SyncState::InConflict, Some(tag)) => tag,
                    (SyncState::Deleted, _) => ConflictType::LocalDeletedOldValues,
                    _ => ConflictType::LocalUpdatedUpdatedValues,
                };
                if !change.deleted && local.identical_except_etag_and_filter(change) {
                    out.to_update.push(RowUpdate {
                        change: change.clone(),
                        kind: UpdateKind::AbsorbMetadata,
                    });
                } else {
                    out.to_conflict.push(ConflictCase {
                        change: change.clone(),
                        local_type,
                    });
                }
            }
        }
    }

    out.to_insert = server
        .into_values()
        .filter(|change| !change.deleted)
        .cloned()
        .collect();
    out
}

/// What applying a classification did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Counter deltas.
    pub counters: TableCounters,
    /// Rows physically removed; their attachments must be deleted after commit.
    pub purged: Vec<RowId>,
    /// Rows placed in conflict.
    pub conflicted: Vec<RowId>,
}

fn absorb_metadata(txn: &mut dyn RowTransaction, change: &RowChange) -> SyncResult<()> {
    let Some(mut row) = txn.get(&change.row_id, RowSide::Local) else {
        return Ok(());
    };
    row.row_etag = change.row_etag.clone();
    row.metadata.filter = change.metadata.filter.clone();
    row.sync_state = if row.is_local_delete() {
        SyncState::Deleted
    } else {
        row.refresh_attachment_refs(txn.schema());
        row.settled_state()
    };
    row.conflict_type = None;
    txn.delete_row(&change.row_id, RowSide::Server);
    txn.upsert_row(row)?;
    Ok(())
}

/// Applies a classification inside the caller's transaction.
///
/// # Errors
///
/// Returns an error if the store rejects a row.
pub fn apply(txn: &mut dyn RowTransaction, classification: &Classification) -> SyncResult<ApplyReport> {
    let mut report = ApplyReport::default();

    for change in &classification.to_insert {
        let row = Row::settled_from_change(change, txn.schema());
        txn.upsert_row(row)?;
        report.counters.inserts += 1;
    }

    for update in &classification.to_update {
        match update.kind {
            UpdateKind::ServerWins => {
                let row = Row::settled_from_change(&update.change, txn.schema());
                txn.upsert_row(row)?;
            }
            UpdateKind::AbsorbMetadata => absorb_metadata(txn, &update.change)?,
        }
        report.counters.updates += 1;
    }

    for row_id in &classification.to_delete {
        if resolver::delete_both(txn, row_id) > 0 {
            report.counters.deletes += 1;
            report.purged.push(row_id.clone());
        }
    }

    for case in &classification.to_conflict {
        resolver::place_in_conflict(txn, &case.change, case.local_type)?;
        report.counters.conflicts += 1;
        report.conflicted.push(case.change.row_id.clone());
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_protocol::{ColumnDefinition, ElementDataType, TableId, TableSchema};
    use tablesync_store::{check_row_pairing, MemoryRowStore, RowStore, StoreConfig};

    fn schema() -> TableSchema {
        TableSchema::new(
            "t",
            vec![
                ColumnDefinition::new("name", ElementDataType::String),
                ColumnDefinition::new("photo", ElementDataType::RowPath),
            ],
        )
    }

    fn local(id: &str, state: SyncState, name: &str) -> Row {
        Row::new(id, state).with_etag("e0").with_value("name", name)
    }

    fn change(id: &str, etag: &str, name: &str) -> RowChange {
        RowChange::update(id, etag).with_value("name", name)
    }

    #[test]
    fn synced_rows_follow_the_server() {
        let rows = [
            local("a", SyncState::Synced, "x"),
            local("b", SyncState::SyncedPendingFiles, "x"),
        ];
        let page = [change("a", "e1", "y"), RowChange::deletion("b", "e1")];
        let c = classify(&rows, &page);
        assert_eq!(c.to_update.len(), 1);
        assert_eq!(c.to_update[0].kind, UpdateKind::ServerWins);
        assert_eq!(c.to_delete, vec![RowId::from("b")]);
        assert!(c.to_conflict.is_empty() && c.to_insert.is_empty());
    }

    #[test]
    fn agreeing_deletes_need_no_conflict() {
        let mut tagged = local("b", SyncState::InConflict, "x");
        tagged.conflict_type = Some(ConflictType::LocalDeletedOldValues);
        let rows = [local("a", SyncState::Deleted, "x"), tagged];
        let page = [RowChange::deletion("a", "e1"), RowChange::deletion("b", "e1")];
        let c = classify(&rows, &page);
        assert_eq!(c.to_delete, vec![RowId::from("a"), RowId::from("b")]);
        assert!(c.to_conflict.is_empty());
    }

    #[test]
    fn divergent_edits_conflict() {
        let rows = [
            local("a", SyncState::Changed, "mine"),
            local("b", SyncState::Deleted, "x"),
            local("c", SyncState::NewRow, "x"),
        ];
        let page = [
            change("a", "e1", "theirs"),
            change("b", "e1", "edited"),
            RowChange::deletion("c", "e1"),
        ];
        let c = classify(&rows, &page);
        let tags: Vec<_> = c.to_conflict.iter().map(|k| k.local_type).collect();
        assert_eq!(
            tags,
            vec![
                ConflictType::LocalUpdatedUpdatedValues,
                ConflictType::LocalDeletedOldValues,
                ConflictType::LocalUpdatedUpdatedValues,
            ]
        );
    }

    #[test]
    fn identical_values_absorb_metadata_only() {
        let rows = [local("a", SyncState::Changed, "same")];
        let c = classify(&rows, &[change("a", "e9", "same")]);
        assert_eq!(c.to_update[0].kind, UpdateKind::AbsorbMetadata);
        assert!(c.to_conflict.is_empty());
    }

    #[test]
    fn server_tagged_rows_are_skipped_and_leftovers_insert() {
        let mut server_copy = local("a", SyncState::InConflict, "old");
        server_copy.conflict_type = Some(ConflictType::ServerUpdatedUpdatedValues);
        let mut local_copy = local("a", SyncState::InConflict, "mine");
        local_copy.conflict_type = Some(ConflictType::LocalUpdatedUpdatedValues);

        let page = [
            change("a", "e2", "newer"),
            change("n", "e1", "fresh"),
            RowChange::deletion("gone", "e1"),
        ];
        let c = classify(&[server_copy, local_copy], &page);
        assert_eq!(c.to_conflict.len(), 1);
        assert_eq!(
            c.to_conflict[0].local_type,
            ConflictType::LocalUpdatedUpdatedValues
        );
        assert_eq!(c.to_insert.len(), 1);
        assert_eq!(c.to_insert[0].row_id, RowId::from("n"));
    }

    #[test]
    fn apply_then_replay_is_a_no_op() {
        let store = MemoryRowStore::new(StoreConfig::new().with_table(schema()));
        let t = TableId::from("t");
        store
            .transaction(&t, |txn| {
                txn.upsert_row(local("a", SyncState::Changed, "mine"))?;
                txn.upsert_row(local("b", SyncState::Synced, "x"))?;
                txn.upsert_row(local("c", SyncState::Synced, "x"))
            })
            .unwrap();

        let page = vec![
            change("a", "e1", "theirs"),
            change("b", "e1", "y").with_value("photo", "p.jpg"),
            RowChange::deletion("c", "e1"),
            change("d", "e1", "new"),
        ];

        let run = |store: &MemoryRowStore| {
            let rows = store.rows(&t).unwrap();
            store
                .transaction(&t, |txn| apply(txn, &classify(&rows, &page)))
                .unwrap()
        };

        let first = run(&store);
        assert_eq!(first.counters.conflicts, 1);
        assert_eq!(first.counters.inserts, 1);
        assert_eq!(first.purged, vec![RowId::from("c")]);
        let after_first = store.rows(&t).unwrap();

        run(&store);
        assert_eq!(store.rows(&t).unwrap(), after_first);

        let b = &store.physical_rows(&t, &"b".into()).unwrap()[0];
        assert_eq!(b.sync_state, SyncState::SyncedPendingFiles);
        let pair = store.physical_rows(&t, &"a".into()).unwrap();
        assert_eq!(pair.len(), 2);
        check_row_pairing(&"a".into(), &pair).unwrap();
    }

    #[test]
    fn absorbed_delete_keeps_pushing_the_delete() {
        let store = MemoryRowStore::new(StoreConfig::new().with_table(schema()));
        let t = TableId::from("t");
        store
            .transaction(&t, |txn| txn.upsert_row(local("a", SyncState::Deleted, "v")))
            .unwrap();
        let rows = store.rows(&t).unwrap();
        let page = [change("a", "e5", "v")];
        store
            .transaction(&t, |txn| apply(txn, &classify(&rows, &page)))
            .unwrap();
        let row = &store.physical_rows(&t, &"a".into()).unwrap()[0];
        assert_eq!(row.sync_state, SyncState::Deleted);
        assert_eq!(row.row_etag.as_deref(), Some("e5"));
    }
}
