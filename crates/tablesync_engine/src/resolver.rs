//! Conflict resolver: creates and clears conflict pairs.
//!
//! Every operation here runs inside the caller's table transaction. The
//! store checks the pairing invariant when that transaction commits, so a
//! half-built pair can never become visible.

use crate::error::{SyncError, SyncResult};
use serde::Serialize;
use std::collections::BTreeMap;
use tablesync_protocol::{
    ColumnKey, ConflictPolicy, ConflictResolution, ConflictType, Row, RowChange, RowId, RowSide,
    ScalarValue, SyncState, TableId,
};
use tablesync_store::{RowStore, RowTransaction, StoreError};

/// Both halves of an unresolved conflict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictPair {
    /// The device's copy.
    pub local: Row,
    /// The server's copy.
    pub server: Row,
}

impl ConflictPair {
    /// Row id of the pair.
    pub fn row_id(&self) -> &RowId {
        &self.local.row_id
    }

    /// Tag on the local half.
    pub fn local_type(&self) -> Option<ConflictType> {
        self.local.conflict_type
    }

    /// Returns true if the server side is a deletion.
    pub fn server_deleted(&self) -> bool {
        self.server.conflict_type == Some(ConflictType::ServerDeletedOldValues)
    }

    /// Returns true if the local side is a deletion.
    pub fn local_deleted(&self) -> bool {
        self.local.conflict_type == Some(ConflictType::LocalDeletedOldValues)
    }
}

/// What a resolution left behind.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// One row remains.
    Kept(Row),
    /// The row is gone; its attachments must be removed after commit.
    Purged,
}

fn load_pair(txn: &dyn RowTransaction, row_id: &RowId) -> SyncResult<ConflictPair> {
    let local = txn
        .get(row_id, RowSide::Local)
        .ok_or_else(|| StoreError::RowNotFound {
            table_id: txn.table_id().to_string(),
            row_id: row_id.to_string(),
        })?;
    let server = txn.get(row_id, RowSide::Server);
    match server {
        Some(server) if local.sync_state == SyncState::InConflict => {
            Ok(ConflictPair { local, server })
        }
        _ => Err(StoreError::InvalidEdit(format!("row {row_id} is not in conflict")).into()),
    }
}

/// Places a row in conflict with the server's version.
///
/// Any stale server copy is replaced; the local row keeps its data and is
/// tagged `local_type`.
///
/// # Errors
///
/// Returns `SyncError::InvariantViolation` if there is no local row.
pub fn place_in_conflict(
    txn: &mut dyn RowTransaction,
    change: &RowChange,
    local_type: ConflictType,
) -> SyncResult<()> {
    let mut local = txn.get(&change.row_id, RowSide::Local).ok_or_else(|| {
        SyncError::InvariantViolation(format!(
            "cannot place {} in conflict without a local row",
            change.row_id
        ))
    })?;

    txn.delete_row(&change.row_id, RowSide::Server);

    local.sync_state = SyncState::InConflict;
    local.conflict_type = Some(local_type);
    txn.upsert_row(local)?;

    let mut server = Row::from_change(change, txn.schema(), SyncState::InConflict);
    server.conflict_type = Some(ConflictType::for_server(change.deleted));
    txn.upsert_row(server)?;
    Ok(())
}

/// Removes every physical row for a row id, returning how many existed.
pub fn delete_both(txn: &mut dyn RowTransaction, row_id: &RowId) -> usize {
    txn.delete_all(row_id)
}

fn restore_local(txn: &mut dyn RowTransaction, pair: ConflictPair) -> SyncResult<Row> {
    let ConflictPair { mut local, server } = pair;
    txn.delete_row(&local.row_id, RowSide::Server);

    local.sync_state = if local.conflict_type == Some(ConflictType::LocalDeletedOldValues) {
        SyncState::Deleted
    } else {
        SyncState::Changed
    };
    local.conflict_type = None;
    local.row_etag = server.row_etag;
    local.metadata.filter = server.metadata.filter;
    local.refresh_attachment_refs(txn.schema());
    txn.upsert_row(local.clone())?;
    Ok(local)
}

/// Keeps the local values, adopting the server's row ETag and filter scope.
///
/// # Errors
///
/// Returns an error if the row is not in conflict.
pub fn take_local(txn: &mut dyn RowTransaction, row_id: &RowId) -> SyncResult<Resolved> {
    let pair = load_pair(txn, row_id)?;
    restore_local(txn, pair).map(Resolved::Kept)
}

/// Keeps the local values but copies the named columns from the server row.
///
/// # Errors
///
/// Returns an error if the row is not in conflict or the local side is a
/// deletion.
pub fn take_local_plus_server_deltas(
    txn: &mut dyn RowTransaction,
    row_id: &RowId,
    server_columns: &[ColumnKey],
) -> SyncResult<Resolved> {
    let mut pair = load_pair(txn, row_id)?;
    if pair.local_deleted() {
        return Err(StoreError::InvalidEdit(format!(
            "row {row_id} was deleted locally; server deltas cannot be merged into a delete"
        ))
        .into());
    }

    let deltas: BTreeMap<ColumnKey, ScalarValue> = server_columns
        .iter()
        .map(|key| {
            let value = pair.server.columns.get(key).cloned().unwrap_or_default();
            (key.clone(), value)
        })
        .collect();
    pair.local.columns.extend(deltas);
    restore_local(txn, pair).map(Resolved::Kept)
}

/// Takes the server's version, purging the row if the server deleted it.
///
/// # Errors
///
/// Returns an error if the row is not in conflict.
pub fn take_server(txn: &mut dyn RowTransaction, row_id: &RowId) -> SyncResult<Resolved> {
    let pair = load_pair(txn, row_id)?;
    if pair.server_deleted() {
        txn.delete_all(row_id);
        return Ok(Resolved::Purged);
    }

    txn.delete_row(row_id, RowSide::Server);
    let mut row = pair.server;
    row.conflict_type = None;
    row.refresh_attachment_refs(txn.schema());
    row.sync_state = row.settled_state();
    txn.upsert_row(row.clone())?;
    Ok(Resolved::Kept(row))
}

/// Applies a resolution strategy. `server_columns` is only read for
/// `TakeLocalPlusServerDeltas`.
///
/// # Errors
///
/// See the individual strategies.
pub fn resolve(
    txn: &mut dyn RowTransaction,
    row_id: &RowId,
    resolution: ConflictResolution,
    server_columns: &[ColumnKey],
) -> SyncResult<Resolved> {
    match resolution {
        ConflictResolution::TakeLocal => take_local(txn, row_id),
        ConflictResolution::TakeLocalPlusServerDeltas => {
            take_local_plus_server_deltas(txn, row_id, server_columns)
        }
        ConflictResolution::TakeServer => take_server(txn, row_id),
    }
}

/// Resolves freshly placed conflicts according to `policy`.
///
/// Returns the ids of rows purged by the policy. `Manual` resolves nothing.
///
/// # Errors
///
/// Returns an error if a resolution fails.
pub fn apply_policy(
    txn: &mut dyn RowTransaction,
    policy: ConflictPolicy,
    row_ids: &[RowId],
) -> SyncResult<Vec<RowId>> {
    let mut purged = Vec::new();
    if !policy.auto_resolves() {
        return Ok(purged);
    }
    for row_id in row_ids {
        let pair = load_pair(txn, row_id)?;
        let Some(resolution) = policy.resolve(&pair.local.metadata, &pair.server.metadata) else {
            continue;
        };
        if resolve(txn, row_id, resolution, &[])? == Resolved::Purged {
            purged.push(row_id.clone());
        }
    }
    Ok(purged)
}

/// Lists the unresolved conflict pairs of a table, ordered by row id.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn list_conflicts<S: RowStore + ?Sized>(
    store: &S,
    table_id: &TableId,
) -> SyncResult<Vec<ConflictPair>> {
    let mut halves: BTreeMap<RowId, (Option<Row>, Option<Row>)> = BTreeMap::new();
    for row in store.rows_by_sync_state(table_id, SyncState::InConflict)? {
        let entry = halves.entry(row.row_id.clone()).or_default();
        match row.side() {
            RowSide::Local => entry.0 = Some(row),
            RowSide::Server => entry.1 = Some(row),
        }
    }
    Ok(halves
        .into_values()
        .filter_map(|halves| match halves {
            (Some(local), Some(server)) => Some(ConflictPair { local, server }),
            _ => None,
        })
        .collect())
}
