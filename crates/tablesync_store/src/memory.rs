//! In-memory row store.

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::row_store::{check_row_pairing, RowStore, RowTransaction};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tablesync_protocol::{Row, RowId, RowSide, SyncState, TableId, TableSchema, TableSyncState};
use tracing::warn;

#[derive(Debug, Clone)]
struct TableData {
    schema: TableSchema,
    state: Option<TableSyncState>,
    rows: BTreeMap<(RowId, RowSide), Row>,
}

impl TableData {
    fn physical_rows(&self, row_id: &RowId) -> Vec<Row> {
        [RowSide::Local, RowSide::Server]
            .iter()
            .filter_map(|side| self.rows.get(&(row_id.clone(), *side)).cloned())
            .collect()
    }
}

/// An in-memory row store.
///
/// This store is suitable for:
/// - Unit and integration tests
/// - Ephemeral replicas that don't need persistence
///
/// # Thread Safety
///
/// Each table sits behind its own mutex, so transactions on different
/// tables proceed in parallel while transactions on one table serialize.
/// A transaction works on a staged copy of the table that replaces the
/// committed data only if the closure succeeds and the pairing invariant
/// holds for every touched row id.
#[derive(Debug)]
pub struct MemoryRowStore {
    tables: RwLock<HashMap<TableId, Arc<Mutex<TableData>>>>,
}

impl MemoryRowStore {
    /// Creates a store serving the tables in `config`.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        let tables = config
            .tables()
            .filter_map(|id| config.schema(id))
            .map(|schema| {
                let data = TableData {
                    schema: schema.clone(),
                    state: None,
                    rows: BTreeMap::new(),
                };
                (schema.table_id.clone(), Arc::new(Mutex::new(data)))
            })
            .collect();
        Self {
            tables: RwLock::new(tables),
        }
    }

    fn table(&self, table_id: &TableId) -> StoreResult<Arc<Mutex<TableData>>> {
        self.tables
            .read()
            .get(table_id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownTable(table_id.to_string()))
    }

    /// Returns the number of physical rows in a table.
    pub fn len(&self, table_id: &TableId) -> StoreResult<usize> {
        Ok(self.table(table_id)?.lock().rows.len())
    }

    /// Returns true if the table holds no rows.
    pub fn is_empty(&self, table_id: &TableId) -> StoreResult<bool> {
        Ok(self.len(table_id)? == 0)
    }
}

impl RowStore for MemoryRowStore {
    fn schema(&self, table_id: &TableId) -> StoreResult<TableSchema> {
        Ok(self.table(table_id)?.lock().schema.clone())
    }

    fn table_state(&self, table_id: &TableId) -> StoreResult<Option<TableSyncState>> {
        Ok(self.table(table_id)?.lock().state.clone())
    }

    fn rows(&self, table_id: &TableId) -> StoreResult<Vec<Row>> {
        Ok(self.table(table_id)?.lock().rows.values().cloned().collect())
    }

    fn rows_by_sync_state(&self, table_id: &TableId, state: SyncState) -> StoreResult<Vec<Row>> {
        Ok(self
            .table(table_id)?
            .lock()
            .rows
            .values()
            .filter(|r| r.sync_state == state)
            .cloned()
            .collect())
    }

    fn physical_rows(&self, table_id: &TableId, row_id: &RowId) -> StoreResult<Vec<Row>> {
        Ok(self.table(table_id)?.lock().physical_rows(row_id))
    }

    fn transaction<T, E, F>(&self, table_id: &TableId, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn RowTransaction) -> Result<T, E>,
        E: From<StoreError>,
    {
        let table = self.table(table_id)?;
        let mut committed = table.lock();

        let mut txn = MemoryTransaction {
            table_id: table_id.clone(),
            data: committed.clone(),
            touched: BTreeSet::new(),
        };

        let value = f(&mut txn)?;

        for row_id in &txn.touched {
            if let Err(err) = check_row_pairing(row_id, &txn.data.physical_rows(row_id)) {
                warn!(table = %table_id, row = %row_id, error = %err, "transaction rolled back");
                return Err(err.into());
            }
        }

        *committed = txn.data;
        Ok(value)
    }
}

struct MemoryTransaction {
    table_id: TableId,
    data: TableData,
    touched: BTreeSet<RowId>,
}

impl RowTransaction for MemoryTransaction {
    fn table_id(&self) -> &TableId {
        &self.table_id
    }

    fn schema(&self) -> &TableSchema {
        &self.data.schema
    }

    fn table_state(&self) -> Option<TableSyncState> {
        self.data.state.clone()
    }

    fn set_table_state(&mut self, state: TableSyncState) {
        self.data.state = Some(state);
    }

    fn get(&self, row_id: &RowId, side: RowSide) -> Option<Row> {
        self.data.rows.get(&(row_id.clone(), side)).cloned()
    }

    fn physical_rows(&self, row_id: &RowId) -> Vec<Row> {
        self.data.physical_rows(row_id)
    }

    fn upsert_row(&mut self, row: Row) -> StoreResult<()> {
        self.data.schema.validate(&row.columns)?;
        self.touched.insert(row.row_id.clone());
        self.data.rows.insert((row.row_id.clone(), row.side()), row);
        Ok(())
    }

    fn delete_row(&mut self, row_id: &RowId, side: RowSide) -> bool {
        self.touched.insert(row_id.clone());
        self.data.rows.remove(&(row_id.clone(), side)).is_some()
    }

    fn delete_all(&mut self, row_id: &RowId) -> usize {
        [RowSide::Local, RowSide::Server]
            .iter()
            .filter(|side| self.delete_row(row_id, **side))
            .count()
    }
}
