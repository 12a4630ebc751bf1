//! # tablesync engine
//!
//! Row-level offline sync for tabular data.
//!
//! This crate provides:
//! - Row reconciler (classifies a changeset page against local rows)
//! - Conflict resolver (conflict pairs, resolution strategies, policies)
//! - Attachment synchronizer (manifest diff, byte-capped multipart batches)
//! - ETag / manifest cache
//! - Remote API traits, a REST adapter and a scriptable mock
//! - Per-table sync state machine and a concurrent multi-table coordinator
//!
//! ## Architecture
//!
//! Each table is synchronized **pull-then-push**:
//! 1. Compare schema ETags; a stale schema stops the table
//! 2. Pull changeset pages since the stored data ETag and apply them
//! 3. Push local changes in batches; a 409 sends the table back to pull
//! 4. Transfer attachments of rows left in `synced_pending_files`
//!
//! ## Key Invariants
//!
//! - Every multi-row mutation runs in one local-store transaction
//! - A row id has one physical row, or exactly two while in conflict
//! - Applying the same page twice changes nothing the second time
//! - One table's failure never aborts another, except authentication
//!   failures, which stop the whole run

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod attachments;
mod config;
mod coordinator;
mod error;
mod etag_cache;
mod http;
mod orchestrator;
mod outcome;
mod progress;
pub mod reconciler;
mod remote;
pub mod resolver;

pub use attachments::{AttachmentSynchronizer, RowTransfer, TransferPlan, TransferStatus};
pub use config::{AttachmentPolicy, RetryConfig, SyncConfig};
pub use coordinator::SyncCoordinator;
pub use error::{SyncError, SyncResult};
pub use etag_cache::EtagCache;
pub use http::{
    HttpClient, HttpClientError, HttpMethod, HttpRequest, HttpResponse, LoopbackClient,
    LoopbackServer, RestRemote,
};
pub use orchestrator::SyncEngine;
pub use outcome::{TableCounters, TableOutcome, TablePhase, TableSyncResult, SyncRunResult};
pub use progress::{NoProgress, SyncProgress};
pub use reconciler::{classify, Classification};
pub use remote::{AttachmentApi, ManifestResponse, MockRemote, Remote, RemoteTableApi};
pub use resolver::{ConflictPair, Resolved};
