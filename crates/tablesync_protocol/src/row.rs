//! The row state model.

use crate::ids::{ColumnKey, RowId};
use crate::messages::RowChange;
use crate::schema::TableSchema;
use crate::value::ScalarValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Synchronization state of a physical row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Created locally, never pushed.
    NewRow,
    /// Modified locally since the last sync.
    Changed,
    /// Deleted locally, delete not yet pushed.
    Deleted,
    /// Matches the server.
    Synced,
    /// Matches the server but attachments still need transferring.
    SyncedPendingFiles,
    /// Part of an unresolved conflict pair.
    InConflict,
}

impl SyncState {
    /// Returns true if the row carries local changes that must be pushed.
    pub fn needs_push(&self) -> bool {
        matches!(
            self,
            SyncState::NewRow | SyncState::Changed | SyncState::Deleted
        )
    }

    /// Returns true for the two server-matching states.
    pub fn is_synced(&self) -> bool {
        matches!(self, SyncState::Synced | SyncState::SyncedPendingFiles)
    }

    /// All states, in a stable order.
    pub const ALL: [SyncState; 6] = [
        SyncState::NewRow,
        SyncState::Changed,
        SyncState::Deleted,
        SyncState::Synced,
        SyncState::SyncedPendingFiles,
        SyncState::InConflict,
    ];
}

/// Which half of a conflict pair a physical row represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowSide {
    /// The device's copy (also every row that is not in conflict).
    Local,
    /// The server's copy of a conflicted row.
    Server,
}

/// Tag on each half of a conflict pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// The local side deleted the row.
    LocalDeletedOldValues,
    /// The local side updated the row.
    LocalUpdatedUpdatedValues,
    /// The server side deleted the row.
    ServerDeletedOldValues,
    /// The server side updated the row.
    ServerUpdatedUpdatedValues,
}

impl ConflictType {
    /// Returns the side this tag belongs to.
    pub fn side(&self) -> RowSide {
        match self {
            ConflictType::LocalDeletedOldValues | ConflictType::LocalUpdatedUpdatedValues => {
                RowSide::Local
            }
            ConflictType::ServerDeletedOldValues | ConflictType::ServerUpdatedUpdatedValues => {
                RowSide::Server
            }
        }
    }

    /// Returns true if the tagged side is a deletion.
    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            ConflictType::LocalDeletedOldValues | ConflictType::ServerDeletedOldValues
        )
    }

    /// Server-side tag for a server change.
    pub fn for_server(deleted: bool) -> Self {
        if deleted {
            ConflictType::ServerDeletedOldValues
        } else {
            ConflictType::ServerUpdatedUpdatedValues
        }
    }

    /// Local-side tag for a local change.
    pub fn for_local(deleted: bool) -> Self {
        if deleted {
            ConflictType::LocalDeletedOldValues
        } else {
            ConflictType::LocalUpdatedUpdatedValues
        }
    }

    /// Converts to a numeric code.
    pub fn to_code(&self) -> u8 {
        match self {
            ConflictType::LocalDeletedOldValues => 0,
            ConflictType::LocalUpdatedUpdatedValues => 1,
            ConflictType::ServerDeletedOldValues => 2,
            ConflictType::ServerUpdatedUpdatedValues => 3,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ConflictType::LocalDeletedOldValues),
            1 => Some(ConflictType::LocalUpdatedUpdatedValues),
            2 => Some(ConflictType::ServerDeletedOldValues),
            3 => Some(ConflictType::ServerUpdatedUpdatedValues),
            _ => None,
        }
    }
}

/// Whether a form save was final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SavepointType {
    /// Finalized save.
    #[default]
    Complete,
    /// Intermediate save.
    Incomplete,
}

/// Access filter applied to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterType {
    /// Table default access.
    #[default]
    Default,
    /// Modifiable by the filter value's principal.
    Modify,
    /// Read-only for everyone but privileged users.
    ReadOnly,
    /// Hidden from everyone but privileged users.
    Hidden,
    /// Full access.
    Full,
}

/// Row-level filter scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct RowFilterScope {
    /// Filter type.
    pub filter_type: FilterType,
    /// Principal or group the filter refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_value: Option<String>,
}

/// Row metadata carried alongside the column values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct RowMetadata {
    /// Form that last saved the row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_id: Option<String>,
    /// Locale of the last save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    /// Save kind.
    #[serde(default)]
    pub savepoint_type: SavepointType,
    /// Save timestamp, `yyyy-MM-ddTHH:mm:ss.nnnnnnnnn`, lexicographically ordered.
    #[serde(default)]
    pub savepoint_timestamp: String,
    /// Principal that saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savepoint_creator: Option<String>,
    /// Access filter.
    #[serde(default)]
    pub filter: RowFilterScope,
}

impl RowMetadata {
    /// Compares everything except the filter scope.
    pub fn same_savepoint(&self, other: &RowMetadata) -> bool {
        self.form_id == other.form_id
            && self.locale == other.locale
            && self.savepoint_type == other.savepoint_type
            && self.savepoint_timestamp == other.savepoint_timestamp
            && self.savepoint_creator == other.savepoint_creator
    }
}

/// A physical row in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Logical row id.
    pub row_id: RowId,
    /// Server-issued version token, `None` until first pushed or pulled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_etag: Option<String>,
    /// Synchronization state.
    pub sync_state: SyncState,
    /// Conflict tag, set only when `sync_state` is `InConflict`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_type: Option<ConflictType>,
    /// Row metadata.
    #[serde(default)]
    pub metadata: RowMetadata,
    /// File names referenced by attachment-bearing columns.
    #[serde(default)]
    pub attachment_refs: Vec<String>,
    /// Column values.
    #[serde(default)]
    pub columns: BTreeMap<ColumnKey, ScalarValue>,
}

impl Row {
    /// Creates an empty row in the given state.
    pub fn new(row_id: impl Into<RowId>, sync_state: SyncState) -> Self {
        Self {
            row_id: row_id.into(),
            row_etag: None,
            sync_state,
            conflict_type: None,
            metadata: RowMetadata::default(),
            attachment_refs: Vec::new(),
            columns: BTreeMap::new(),
        }
    }

    /// Builds a local row from a server change.
    pub fn from_change(change: &RowChange, schema: &TableSchema, sync_state: SyncState) -> Self {
        let mut row = Self {
            row_id: change.row_id.clone(),
            row_etag: change.row_etag.clone(),
            sync_state,
            conflict_type: None,
            metadata: change.metadata.clone(),
            attachment_refs: Vec::new(),
            columns: change.values.clone(),
        };
        row.refresh_attachment_refs(schema);
        row
    }

    /// Builds the settled (`synced` or `synced_pending_files`) copy of a server change.
    pub fn settled_from_change(change: &RowChange, schema: &TableSchema) -> Self {
        let mut row = Self::from_change(change, schema, SyncState::Synced);
        row.sync_state = row.settled_state();
        row
    }

    /// Sets a column value (builder style).
    pub fn with_value(mut self, key: impl Into<ColumnKey>, value: impl Into<ScalarValue>) -> Self {
        self.columns.insert(key.into(), value.into());
        self
    }

    /// Sets the row ETag (builder style).
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.row_etag = Some(etag.into());
        self
    }

    /// Returns which half of a conflict pair this physical row is.
    pub fn side(&self) -> RowSide {
        self.conflict_type
            .map(|t| t.side())
            .unwrap_or(RowSide::Local)
    }

    /// Returns true if any attachment is referenced.
    pub fn has_attachments(&self) -> bool {
        !self.attachment_refs.is_empty()
    }

    /// State a row reaches once it matches the server.
    pub fn settled_state(&self) -> SyncState {
        if self.has_attachments() {
            SyncState::SyncedPendingFiles
        } else {
            SyncState::Synced
        }
    }

    /// Recomputes `attachment_refs` from the column values.
    pub fn refresh_attachment_refs(&mut self, schema: &TableSchema) {
        self.attachment_refs = schema.attachment_refs(&self.columns);
    }

    /// Returns true if this row represents a local deletion.
    pub fn is_local_delete(&self) -> bool {
        match self.sync_state {
            SyncState::Deleted => true,
            SyncState::InConflict => self
                .conflict_type
                .map(|t| t == ConflictType::LocalDeletedOldValues)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Returns true if the values and savepoint metadata match `change`,
    /// ignoring the row ETag and the filter scope.
    pub fn identical_except_etag_and_filter(&self, change: &RowChange) -> bool {
        self.columns == change.values && self.metadata.same_savepoint(&change.metadata)
    }

    /// Converts the row into the change sent on push.
    pub fn to_change(&self) -> RowChange {
        RowChange {
            row_id: self.row_id.clone(),
            row_etag: self.row_etag.clone(),
            deleted: self.is_local_delete(),
            metadata: self.metadata.clone(),
            values: self.columns.clone(),
        }
    }
}
