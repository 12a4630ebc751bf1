//! Local edits, applied the way an application form save would.
//!
//! These helpers keep `sync_state` consistent with what the engine expects
//! to push: new rows start as `new_row`, edits to settled rows become
//! `changed`, and deletes of never-pushed rows vanish immediately.

use crate::error::{StoreError, StoreResult};
use crate::row_store::RowTransaction;
use std::collections::BTreeMap;
use tablesync_protocol::{ColumnKey, Row, RowId, RowMetadata, RowSide, ScalarValue, SyncState};

/// What a local delete did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalDelete {
    /// The row was never pushed and has been removed.
    Purged,
    /// The row is marked `deleted` until the delete is pushed.
    Marked,
}

fn local_row(txn: &dyn RowTransaction, row_id: &RowId) -> StoreResult<Row> {
    let row = txn
        .get(row_id, RowSide::Local)
        .ok_or_else(|| StoreError::RowNotFound {
            table_id: txn.table_id().to_string(),
            row_id: row_id.to_string(),
        })?;
    match row.sync_state {
        SyncState::InConflict => Err(StoreError::InvalidEdit(format!(
            "row {row_id} is in conflict and must be resolved first"
        ))),
        SyncState::Deleted => Err(StoreError::InvalidEdit(format!(
            "row {row_id} is deleted"
        ))),
        _ => Ok(row),
    }
}

/// Inserts a new local row with a fresh `uuid:` row id.
///
/// # Errors
///
/// Returns an error if a value violates the table's type restrictions.
pub fn insert_local_row(
    txn: &mut dyn RowTransaction,
    columns: BTreeMap<ColumnKey, ScalarValue>,
    metadata: RowMetadata,
) -> StoreResult<RowId> {
    let row_id = RowId::new(format!("uuid:{}", uuid::Uuid::new_v4()));
    let mut row = Row::new(row_id.clone(), SyncState::NewRow);
    row.columns = columns;
    row.metadata = metadata;
    row.refresh_attachment_refs(txn.schema());
    txn.upsert_row(row)?;
    Ok(row_id)
}

/// Applies column changes to an existing local row.
///
/// # Errors
///
/// Returns an error if the row does not exist, is deleted or in conflict,
/// or a value violates the table's type restrictions.
pub fn update_local_row(
    txn: &mut dyn RowTransaction,
    row_id: &RowId,
    changes: BTreeMap<ColumnKey, ScalarValue>,
) -> StoreResult<()> {
    let mut row = local_row(txn, row_id)?;
    row.columns.extend(changes);
    row.refresh_attachment_refs(txn.schema());
    if row.sync_state != SyncState::NewRow {
        row.sync_state = SyncState::Changed;
    }
    txn.upsert_row(row)
}

/// Deletes a local row.
///
/// # Errors
///
/// Returns an error if the row does not exist, is already deleted or is in
/// conflict.
pub fn delete_local_row(txn: &mut dyn RowTransaction, row_id: &RowId) -> StoreResult<LocalDelete> {
    let mut row = local_row(txn, row_id)?;
    if row.sync_state == SyncState::NewRow {
        txn.delete_all(row_id);
        return Ok(LocalDelete::Purged);
    }
    row.sync_state = SyncState::Deleted;
    txn.upsert_row(row)?;
    Ok(LocalDelete::Marked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryRowStore, RowStore, StoreConfig};
    use tablesync_protocol::{ColumnDefinition, ElementDataType, TableId, TableSchema};

    fn store() -> MemoryRowStore {
        MemoryRowStore::new(StoreConfig::new().with_table(TableSchema::new(
            "t",
            vec![
                ColumnDefinition::new("name", ElementDataType::String),
                ColumnDefinition::new("photo", ElementDataType::RowPath),
            ],
        )))
    }

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<ColumnKey, ScalarValue> {
        pairs
            .iter()
            .map(|(k, v)| (ColumnKey::from(*k), ScalarValue::from(*v)))
            .collect()
    }

    #[test]
    fn insert_then_delete_purges_new_row() {
        let store = store();
        let t = TableId::from("t");
        let id = store
            .transaction(&t, |txn| {
                insert_local_row(txn, values(&[("photo", "a.jpg")]), RowMetadata::default())
            })
            .unwrap();
        assert!(id.as_str().starts_with("uuid:"));

        let row = &store.physical_rows(&t, &id).unwrap()[0];
        assert_eq!(row.sync_state, SyncState::NewRow);
        assert_eq!(row.attachment_refs, vec!["a.jpg".to_string()]);

        let outcome = store
            .transaction(&t, |txn| delete_local_row(txn, &id))
            .unwrap();
        assert_eq!(outcome, LocalDelete::Purged);
        assert!(store.physical_rows(&t, &id).unwrap().is_empty());
    }

    #[test]
    fn editing_synced_row_marks_changed_then_deleted() {
        let store = store();
        let t = TableId::from("t");
        let id = RowId::from("r1");
        store
            .transaction(&t, |txn| {
                txn.upsert_row(Row::new("r1", SyncState::Synced).with_etag("e1"))
            })
            .unwrap();

        store
            .transaction(&t, |txn| update_local_row(txn, &id, values(&[("name", "x")])))
            .unwrap();
        assert_eq!(
            store.physical_rows(&t, &id).unwrap()[0].sync_state,
            SyncState::Changed
        );

        let outcome = store
            .transaction(&t, |txn| delete_local_row(txn, &id))
            .unwrap();
        assert_eq!(outcome, LocalDelete::Marked);
        assert_eq!(
            store.physical_rows(&t, &id).unwrap()[0].sync_state,
            SyncState::Deleted
        );
    }

    #[test]
    fn missing_row_is_reported() {
        let store = store();
        let t = TableId::from("t");
        let result = store.transaction(&t, |txn| delete_local_row(txn, &"nope".into()));
        assert!(matches!(result, Err(StoreError::RowNotFound { .. })));
    }
}
