//! Row store trait definitions.

use crate::error::{StoreError, StoreResult};
use tablesync_protocol::{Row, RowId, RowSide, SyncState, TableId, TableSchema, TableSyncState};

/// A local relational store holding replicated table rows.
///
/// Reads return owned snapshots. Writes happen only inside
/// [`RowStore::transaction`], which commits when the closure returns `Ok`
/// and discards every staged change when it returns `Err`.
///
/// # Invariants
///
/// - A row id maps to one physical row, or to exactly two when in conflict
///   (one [`RowSide::Local`], one [`RowSide::Server`])
/// - Rows returned by the listing methods are ordered by row id, then side
/// - Implementations must be `Send + Sync`; distinct tables may be written
///   concurrently
pub trait RowStore: Send + Sync {
    /// Returns the schema the store enforces for a table.
    fn schema(&self, table_id: &TableId) -> StoreResult<TableSchema>;

    /// Returns the table's concurrency tokens, if any were recorded.
    fn table_state(&self, table_id: &TableId) -> StoreResult<Option<TableSyncState>>;

    /// Returns every physical row of a table.
    fn rows(&self, table_id: &TableId) -> StoreResult<Vec<Row>>;

    /// Returns the physical rows of a table in the given state.
    fn rows_by_sync_state(&self, table_id: &TableId, state: SyncState) -> StoreResult<Vec<Row>>;

    /// Returns the zero, one or two physical rows for a row id.
    fn physical_rows(&self, table_id: &TableId, row_id: &RowId) -> StoreResult<Vec<Row>>;

    /// Runs `f` inside a transaction scoped to one table.
    ///
    /// # Errors
    ///
    /// Returns the closure's error (after rolling back), or a store error if
    /// the commit would violate a store invariant.
    fn transaction<T, E, F>(&self, table_id: &TableId, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn RowTransaction) -> Result<T, E>,
        E: From<StoreError>;
}

/// Mutations and reads visible inside one table transaction.
///
/// Reads observe the transaction's own uncommitted writes.
pub trait RowTransaction {
    /// The table being mutated.
    fn table_id(&self) -> &TableId;

    /// The table's schema.
    fn schema(&self) -> &TableSchema;

    /// The table's concurrency tokens.
    fn table_state(&self) -> Option<TableSyncState>;

    /// Replaces the table's concurrency tokens.
    fn set_table_state(&mut self, state: TableSyncState);

    /// Reads one physical row.
    fn get(&self, row_id: &RowId, side: RowSide) -> Option<Row>;

    /// Reads every physical row for a row id.
    fn physical_rows(&self, row_id: &RowId) -> Vec<Row>;

    /// Inserts or replaces the physical row identified by `(row.row_id, row.side())`.
    ///
    /// # Errors
    ///
    /// Returns an error if a value violates the table's type restrictions.
    fn upsert_row(&mut self, row: Row) -> StoreResult<()>;

    /// Deletes one physical row, returning whether it existed.
    fn delete_row(&mut self, row_id: &RowId, side: RowSide) -> bool;

    /// Deletes every physical row for a row id, returning how many existed.
    fn delete_all(&mut self, row_id: &RowId) -> usize;
}

/// Checks the pairing invariant for the physical rows of one row id.
///
/// # Errors
///
/// Returns `StoreError::InvariantViolation` describing the first problem.
pub fn check_row_pairing(row_id: &RowId, rows: &[Row]) -> StoreResult<()> {
    let local = rows.iter().find(|r| r.side() == RowSide::Local);
    let server = rows.iter().find(|r| r.side() == RowSide::Server);
    let violation = |msg: &str| Err(StoreError::InvariantViolation(format!("row {row_id}: {msg}")));

    if rows.len() > 2 {
        return violation("more than two physical rows");
    }

    match (local, server) {
        (None, None) => Ok(()),
        (None, Some(_)) => violation("server conflict row without a local row"),
        (Some(local), None) => {
            if local.sync_state == SyncState::InConflict || local.conflict_type.is_some() {
                violation("in_conflict row without its server partner")
            } else {
                Ok(())
            }
        }
        (Some(local), Some(server)) => {
            if local.sync_state != SyncState::InConflict
                || server.sync_state != SyncState::InConflict
            {
                violation("conflict pair rows must both be in_conflict")
            } else if local.conflict_type.is_none() {
                violation("local conflict row is untagged")
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_protocol::ConflictType;

    fn in_conflict(id: &str, tag: ConflictType) -> Row {
        let mut row = Row::new(id, SyncState::InConflict);
        row.conflict_type = Some(tag);
        row
    }

    #[test]
    fn plain_row_is_valid() {
        let id = RowId::from("r1");
        assert!(check_row_pairing(&id, &[Row::new("r1", SyncState::Synced)]).is_ok());
        assert!(check_row_pairing(&id, &[]).is_ok());
    }

    #[test]
    fn complete_pair_is_valid() {
        let id = RowId::from("r1");
        let rows = [
            in_conflict("r1", ConflictType::LocalUpdatedUpdatedValues),
            in_conflict("r1", ConflictType::ServerDeletedOldValues),
        ];
        assert!(check_row_pairing(&id, &rows).is_ok());
    }

    #[test]
    fn orphan_halves_are_rejected() {
        let id = RowId::from("r1");
        let server_only = [in_conflict("r1", ConflictType::ServerUpdatedUpdatedValues)];
        assert!(check_row_pairing(&id, &server_only).is_err());

        let local_only = [in_conflict("r1", ConflictType::LocalUpdatedUpdatedValues)];
        assert!(check_row_pairing(&id, &local_only).is_err());
    }

    #[test]
    fn pair_with_settled_local_is_rejected() {
        let id = RowId::from("r1");
        let rows = [
            Row::new("r1", SyncState::Changed),
            in_conflict("r1", ConflictType::ServerUpdatedUpdatedValues),
        ];
        assert!(check_row_pairing(&id, &rows).is_err());
    }
}
