//! Table schemas.

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{ColumnKey, TableId};
use crate::value::{ElementDataType, ScalarValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Column key.
    pub key: ColumnKey,
    /// Declared element type.
    pub data_type: ElementDataType,
}

impl ColumnDefinition {
    /// Creates a column definition.
    pub fn new(key: impl Into<ColumnKey>, data_type: ElementDataType) -> Self {
        Self {
            key: key.into(),
            data_type,
        }
    }
}

/// Column layout of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table id.
    pub table_id: TableId,
    /// Columns in declaration order.
    pub columns: Vec<ColumnDefinition>,
}

impl TableSchema {
    /// Creates a schema.
    pub fn new(table_id: impl Into<TableId>, columns: Vec<ColumnDefinition>) -> Self {
        Self {
            table_id: table_id.into(),
            columns,
        }
    }

    /// Looks up the type of a column.
    pub fn data_type(&self, key: &ColumnKey) -> Option<ElementDataType> {
        self.columns
            .iter()
            .find(|c| &c.key == key)
            .map(|c| c.data_type)
    }

    /// Iterates over the attachment-bearing columns.
    pub fn attachment_columns(&self) -> impl Iterator<Item = &ColumnKey> {
        self.columns
            .iter()
            .filter(|c| c.data_type.is_attachment())
            .map(|c| &c.key)
    }

    /// Returns true if any column can reference an attachment.
    pub fn has_attachment_columns(&self) -> bool {
        self.attachment_columns().next().is_some()
    }

    /// Collects the non-empty file names referenced by `values`.
    pub fn attachment_refs(&self, values: &BTreeMap<ColumnKey, ScalarValue>) -> Vec<String> {
        let mut refs: Vec<String> = self
            .attachment_columns()
            .filter_map(|key| values.get(key))
            .filter_map(|v| v.as_text())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        refs.sort();
        refs.dedup();
        refs
    }

    /// Checks every value against its declared column type.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown columns or values of the wrong type.
    pub fn validate(&self, values: &BTreeMap<ColumnKey, ScalarValue>) -> ProtocolResult<()> {
        for (key, value) in values {
            let data_type = self
                .data_type(key)
                .ok_or_else(|| ProtocolError::UnknownColumn {
                    table: self.table_id.to_string(),
                    column: key.to_string(),
                })?;
            if !data_type.accepts(value) {
                return Err(ProtocolError::TypeMismatch {
                    column: key.to_string(),
                    expected: data_type,
                    found: value.kind(),
                });
            }
        }
        Ok(())
    }
}

/// Table-level optimistic concurrency tokens held by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSyncState {
    /// Table id.
    pub table_id: TableId,
    /// Schema ETag established by the last app-level sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_etag: Option<String>,
    /// Data ETag covering every change already applied locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_etag: Option<String>,
    /// Milliseconds since the Unix epoch of the last completed sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<u64>,
}

impl TableSyncState {
    /// Creates a state with only a schema ETag.
    pub fn new(table_id: impl Into<TableId>, schema_etag: impl Into<String>) -> Self {
        Self {
            table_id: table_id.into(),
            schema_etag: Some(schema_etag.into()),
            data_etag: None,
            last_sync_time: None,
        }
    }
}
