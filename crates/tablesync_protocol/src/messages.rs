//! Wire messages exchanged with the remote table API.
//!
//! All messages encode as JSON. Every type exposes `encode`/`decode` so
//! transports never touch `serde_json` directly.

use crate::error::ProtocolResult;
use crate::ids::{ColumnKey, RowId, TableId};
use crate::row::RowMetadata;
use crate::value::ScalarValue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn encode_json<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

macro_rules! json_codec {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $ty {
                /// Encodes to JSON bytes.
                pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
                    encode_json(self)
                }

                /// Decodes from JSON bytes.
                pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
                    decode_json(bytes)
                }
            }
        )*
    };
}

/// One row as the server sees it: a pulled change or a pushed edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    /// Row id.
    pub row_id: RowId,
    /// Row ETag (server-assigned; the prior token when pushing).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_etag: Option<String>,
    /// Whether this change is a deletion.
    #[serde(default)]
    pub deleted: bool,
    /// Row metadata.
    #[serde(default)]
    pub metadata: RowMetadata,
    /// Column values.
    #[serde(default)]
    pub values: BTreeMap<ColumnKey, ScalarValue>,
}

impl RowChange {
    /// Creates a non-deleting change.
    pub fn update(row_id: impl Into<RowId>, row_etag: impl Into<String>) -> Self {
        Self {
            row_id: row_id.into(),
            row_etag: Some(row_etag.into()),
            deleted: false,
            metadata: RowMetadata::default(),
            values: BTreeMap::new(),
        }
    }

    /// Creates a deletion.
    pub fn deletion(row_id: impl Into<RowId>, row_etag: impl Into<String>) -> Self {
        Self {
            deleted: true,
            ..Self::update(row_id, row_etag)
        }
    }

    /// Sets a column value (builder style).
    pub fn with_value(mut self, key: impl Into<ColumnKey>, value: impl Into<ScalarValue>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Replaces the metadata (builder style).
    pub fn with_metadata(mut self, metadata: RowMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One page of server changes since a data ETag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesetPage {
    /// Changed rows, in server order.
    pub rows: Vec<RowChange>,
    /// Table data ETag the server reported for this page.
    pub data_etag: String,
    /// Whether more pages follow.
    pub has_more: bool,
    /// Opaque resume cursor for the next page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl ChangesetPage {
    /// Creates a final (single) page.
    pub fn last(rows: Vec<RowChange>, data_etag: impl Into<String>) -> Self {
        Self {
            rows,
            data_etag: data_etag.into(),
            has_more: false,
            next_cursor: None,
        }
    }

    /// Creates a page followed by more pages.
    pub fn partial(
        rows: Vec<RowChange>,
        data_etag: impl Into<String>,
        next_cursor: impl Into<String>,
    ) -> Self {
        Self {
            rows,
            data_etag: data_etag.into(),
            has_more: true,
            next_cursor: Some(next_cursor.into()),
        }
    }
}

/// Batch push request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlterRowsRequest {
    /// Data ETag the client last observed; a mismatch is answered with 409.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_data_etag: Option<String>,
    /// Rows to apply atomically.
    pub rows: Vec<RowChange>,
}

/// Per-row result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowOutcomeKind {
    /// Applied; the returned row carries the new ETag.
    Success,
    /// Not applied (e.g. deleting a row the server does not have).
    Failed,
    /// Not applied; the returned row is the server's current version.
    InConflict,
    /// Not applied; the caller lacks permission.
    Denied,
}

/// Outcome for one pushed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowOutcome {
    /// Server's view of the row after the call.
    pub row: RowChange,
    /// What happened.
    pub outcome: RowOutcomeKind,
}

impl RowOutcome {
    /// Creates an outcome.
    pub fn new(row: RowChange, outcome: RowOutcomeKind) -> Self {
        Self { row, outcome }
    }
}

/// Batch push response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlterRowsResponse {
    /// One outcome per pushed row.
    pub outcomes: Vec<RowOutcome>,
    /// Table data ETag after the call.
    pub data_etag: String,
}

/// Table-level concurrency tokens reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTableState {
    /// Table id.
    pub table_id: TableId,
    /// Schema ETag.
    pub schema_etag: String,
    /// Current data ETag, `None` for a table that has never been written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_etag: Option<String>,
}

/// One file in a row's server-side manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// File name relative to the row's attachment set.
    pub filename: String,
    /// Content hash, `md5:<hex>`.
    pub md5hash: String,
    /// Direct download URL, if the server offers one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Content length in bytes.
    #[serde(default)]
    pub content_length: u64,
}

/// A row's server-side file manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RowManifest {
    /// Files on the server.
    pub entries: Vec<ManifestEntry>,
}

/// Body of a batch download request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Wanted file names.
    pub filenames: Vec<String>,
}

json_codec!(
    RowChange,
    ChangesetPage,
    AlterRowsRequest,
    AlterRowsResponse,
    RemoteTableState,
    RowManifest,
    DownloadRequest,
);
