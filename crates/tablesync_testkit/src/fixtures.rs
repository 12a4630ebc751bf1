//! Test fixtures and replica helpers.
//!
//! Provides convenience functions for setting up a device replica, a
//! reference server holding the same table, and temporary attachment
//! directories.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tablesync_protocol::{
    ColumnDefinition, ColumnKey, ElementDataType, Row, RowChange, RowId, ScalarValue, SyncState,
    TableId, TableSchema, TableSyncState,
};
use tablesync_server::{ServerConfig, ServerTables, TableServer};
use tablesync_store::{edits, DirAttachmentStore, MemoryRowStore, RowStore, StoreConfig, StoreError};
use tempfile::TempDir;

/// Table used by every fixture.
pub const TABLE: &str = "visits";

/// Schema ETag shared by fixture replicas and servers.
pub const SCHEMA_ETAG: &str = "schema-1";

/// Returns the fixture table id.
pub fn table_id() -> TableId {
    TableId::from(TABLE)
}

/// Schema of the fixture table: a name, an age and one photo column.
pub fn visits_schema() -> TableSchema {
    TableSchema::new(
        TABLE,
        vec![
            ColumnDefinition::new("name", ElementDataType::String),
            ColumnDefinition::new("age", ElementDataType::Integer),
            ColumnDefinition::new("photo", ElementDataType::RowPath),
        ],
    )
}

/// Builds a column map from `(key, value)` pairs.
pub fn columns<V: Into<ScalarValue>>(
    pairs: impl IntoIterator<Item = (&'static str, V)>,
) -> BTreeMap<ColumnKey, ScalarValue> {
    pairs
        .into_iter()
        .map(|(key, value)| (ColumnKey::from(key), value.into()))
        .collect()
}

/// A settled local row.
pub fn synced_row(id: &str, etag: &str, name: &str) -> Row {
    Row::new(id, SyncState::Synced)
        .with_etag(etag)
        .with_value("name", name)
}

/// A server-side change carrying a name.
pub fn server_change(id: &str, etag: &str, name: &str) -> RowChange {
    RowChange::update(id, etag).with_value("name", name)
}

/// A device replica backed by a memory row store.
pub struct TestReplica {
    /// The row store.
    pub store: MemoryRowStore,
    /// The fixture table.
    pub table_id: TableId,
}

impl TestReplica {
    /// Creates a replica whose schema ETag matches [`SCHEMA_ETAG`].
    pub fn new() -> Self {
        Self::with_schema_etag(SCHEMA_ETAG)
    }

    /// Creates a replica that last saw the given schema ETag.
    pub fn with_schema_etag(schema_etag: &str) -> Self {
        let store = MemoryRowStore::new(StoreConfig::new().with_table(visits_schema()));
        let table_id = table_id();
        store
            .transaction(&table_id, |txn| {
                txn.set_table_state(TableSyncState::new(TABLE, schema_etag));
                Ok::<_, StoreError>(())
            })
            .expect("Failed to record table state");
        Self { store, table_id }
    }

    /// Writes rows directly, bypassing the local-edit rules.
    pub fn seed(&self, rows: impl IntoIterator<Item = Row>) {
        self.store
            .transaction(&self.table_id, |txn| {
                for row in rows {
                    txn.upsert_row(row)?;
                }
                Ok::<_, StoreError>(())
            })
            .expect("Failed to seed rows");
    }

    /// Inserts a row the way a form save would.
    pub fn insert(&self, name: &str) -> RowId {
        self.store
            .transaction(&self.table_id, |txn| {
                edits::insert_local_row(txn, columns([("name", name)]), Default::default())
            })
            .expect("Failed to insert row")
    }

    /// Edits a row the way a form save would.
    pub fn update(&self, row_id: &RowId, changes: BTreeMap<ColumnKey, ScalarValue>) {
        self.store
            .transaction(&self.table_id, |txn| {
                edits::update_local_row(txn, row_id, changes)
            })
            .expect("Failed to update row");
    }

    /// Deletes a row the way the application would.
    pub fn delete(&self, row_id: &RowId) {
        self.store
            .transaction(&self.table_id, |txn| edits::delete_local_row(txn, row_id))
            .expect("Failed to delete row");
    }

    /// Every physical row of the table.
    pub fn rows(&self) -> Vec<Row> {
        self.store.rows(&self.table_id).expect("Failed to list rows")
    }

    /// The physical rows of one row id.
    pub fn physical(&self, row_id: &RowId) -> Vec<Row> {
        self.store
            .physical_rows(&self.table_id, row_id)
            .expect("Failed to read rows")
    }

    /// The replica's table state.
    pub fn state(&self) -> TableSyncState {
        self.store
            .table_state(&self.table_id)
            .expect("Failed to read table state")
            .expect("Table state missing")
    }
}

impl Default for TestReplica {
    fn default() -> Self {
        Self::new()
    }
}

/// A directory-backed attachment store with automatic cleanup.
pub struct TempAttachments {
    /// The attachment store.
    pub store: Arc<DirAttachmentStore>,
    _temp_dir: TempDir,
}

impl TempAttachments {
    /// Creates an empty store in a fresh temporary directory.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        Self {
            store: Arc::new(DirAttachmentStore::new(temp_dir.path().join("attachments"))),
            _temp_dir: temp_dir,
        }
    }

    /// Root of the store.
    pub fn path(&self) -> &Path {
        self.store.root()
    }
}

impl Default for TempAttachments {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates a server holding the fixture table.
pub fn test_server(config: ServerConfig) -> Arc<TableServer> {
    let server = TableServer::new(config);
    server.tables().create_table(TABLE, SCHEMA_ETAG);
    Arc::new(server)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a replica holding `count` settled rows `row-000`, `row-001`...
    pub fn populated_replica(count: usize) -> TestReplica {
        let replica = TestReplica::new();
        replica.seed((0..count).map(|i| {
            synced_row(&format!("row-{i:03}"), &format!("e{i}"), &format!("name {i}"))
        }));
        replica
    }

    /// Writes rows on the server as another device would.
    pub fn remote_edits(tables: &ServerTables, edits: impl IntoIterator<Item = (&'static str, &'static str)>) -> Vec<RowChange> {
        edits
            .into_iter()
            .map(|(id, name)| {
                tables
                    .put_row(&table_id(), RowChange::update(id, "").with_value("name", name))
                    .expect("Failed to write server row")
            })
            .collect()
    }
}
