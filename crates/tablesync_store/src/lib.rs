//! # tablesync store
//!
//! Local storage interfaces consumed by the tablesync engine, with
//! reference implementations.
//!
//! The engine never talks to a database directly. It reads and mutates rows
//! through [`RowStore`], touches row files through [`AttachmentStore`] and
//! remembers server ETags through [`EtagStore`].
//!
//! ## Design Principles
//!
//! - Every multi-row mutation runs inside one closure transaction: the
//!   closure's `Ok` commits, its `Err` rolls back
//! - The store enforces the conflict-pairing invariant at commit time
//! - Column type restrictions come from an immutable [`StoreConfig`]
//!   injected at construction
//! - Stores must be `Send + Sync`; tables are synchronized concurrently
//!
//! ## Available Implementations
//!
//! - [`MemoryRowStore`] - in-memory rows for tests and ephemeral replicas
//! - [`MemoryAttachmentStore`] / [`DirAttachmentStore`] - row files
//! - [`MemoryEtagStore`] / [`FileEtagStore`] - ETag cache persistence
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use tablesync_protocol::{
//!     ColumnDefinition, ColumnKey, ElementDataType, ScalarValue, TableId, TableSchema,
//! };
//! use tablesync_store::{edits, MemoryRowStore, RowStore, StoreConfig};
//!
//! let schema = TableSchema::new(
//!     "visits",
//!     vec![ColumnDefinition::new("name", ElementDataType::String)],
//! );
//! let store = MemoryRowStore::new(StoreConfig::new().with_table(schema));
//! let table = TableId::from("visits");
//! let columns = BTreeMap::from([(ColumnKey::from("name"), ScalarValue::from("Ada"))]);
//! let row_id = store
//!     .transaction(&table, |txn| {
//!         edits::insert_local_row(txn, columns, Default::default())
//!     })
//!     .unwrap();
//! assert_eq!(store.physical_rows(&table, &row_id).unwrap().len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attachments;
mod config;
pub mod edits;
mod error;
mod etag;
mod memory;
mod row_store;

pub use attachments::{AttachmentStore, DirAttachmentStore, LocalFile, MemoryAttachmentStore};
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use etag::{EtagKey, EtagStore, FileEtagStore, MemoryEtagStore};
pub use memory::MemoryRowStore;
pub use row_store::{check_row_pairing, RowStore, RowTransaction};
