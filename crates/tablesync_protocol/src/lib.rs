//! # tablesync protocol
//!
//! Row model and wire messages shared by the tablesync engine, the local
//! store and the reference server.
//!
//! This crate provides:
//! - Typed identifiers (`TableId`, `RowId`, `ColumnKey`)
//! - The row state model (`Row`, `SyncState`, `ConflictType`)
//! - Column typing (`ElementDataType`, `ScalarValue`, `TableSchema`)
//! - Changeset, push and manifest messages with JSON codecs
//! - Conflict resolution vocabulary
//! - Attachment content hashing and the multipart file codec
//! - REST routes shared by the client adapter and the server
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Key Invariants
//!
//! - A row id maps to exactly one physical row unless it is `in_conflict`,
//!   in which case it maps to one local-tagged and one server-tagged row
//! - ETags are opaque; only equality is meaningful

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod digest;
mod error;
mod ids;
mod messages;
pub mod multipart;
mod row;
pub mod routes;
mod schema;
mod value;

pub use conflict::{ConflictPolicy, ConflictResolution};
pub use digest::{content_md5, Md5Stream};
pub use error::{ProtocolError, ProtocolResult};
pub use ids::{ColumnKey, RowId, TableId};
pub use messages::{
    AlterRowsRequest, AlterRowsResponse, ChangesetPage, DownloadRequest, ManifestEntry,
    RemoteTableState, RowChange, RowManifest, RowOutcome, RowOutcomeKind,
};
pub use multipart::{FilePart, MultipartKind};
pub use row::{
    ConflictType, FilterType, Row, RowFilterScope, RowMetadata, RowSide, SavepointType, SyncState,
};
pub use routes::Route;
pub use schema::{ColumnDefinition, TableSchema, TableSyncState};
pub use value::{ElementDataType, ScalarValue};

/// Maximum number of rows the server accepts in one `alterRows` call.
pub const MAX_ALTER_ROWS_BATCH: usize = 500;

/// Prefix used for content hashes in manifests (`md5:<hex>`).
pub const MD5_PREFIX: &str = "md5:";
