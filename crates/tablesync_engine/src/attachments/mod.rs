//! Attachment synchronizer.
//!
//! For each row with attachment references, fetches the row's server
//! manifest, diffs it against the local files and transfers the difference:
//! downloads in one multipart batch, uploads in byte-capped batches.
//!
//! A row's attachments count as synced only when every queued transfer
//! succeeded. Any failure leaves the row in `synced_pending_files` for a
//! later pass and is never fatal to the table, except authentication
//! failures and cancellation.

mod batch;
mod diff;

pub use batch::partition_by_size;
pub use diff::{diff_attachments, AttachmentDiff, HashedFile};

use crate::config::AttachmentPolicy;
use crate::error::{SyncError, SyncResult};
use crate::etag_cache::EtagCache;
use crate::remote::{AttachmentApi, ManifestResponse};
use std::collections::BTreeSet;
use tablesync_protocol::{FilePart, Row, RowId, RowManifest, TableId};
use tablesync_store::{AttachmentStore, LocalFile};
use tracing::{debug, warn};

/// How a row's attachment pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Every file matches the server; the row can become `synced`.
    Synced,
    /// Nothing failed, but this pass could not finish the row.
    Deferred,
    /// At least one transfer failed; retry later.
    Failed,
}

/// Result of one row's attachment pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowTransfer {
    /// Final status.
    pub status: TransferStatus,
    /// Files uploaded.
    pub uploaded: u64,
    /// Files downloaded.
    pub downloaded: u64,
}

impl RowTransfer {
    fn new(status: TransferStatus) -> Self {
        Self {
            status,
            uploaded: 0,
            downloaded: 0,
        }
    }
}

/// Transfers row files between an [`AttachmentStore`] and the server.
pub struct AttachmentSynchronizer<'a, R: AttachmentApi + ?Sized> {
    remote: &'a R,
    files: &'a dyn AttachmentStore,
    cache: &'a EtagCache,
    policy: AttachmentPolicy,
    byte_cap: u64,
}

impl<'a, R: AttachmentApi + ?Sized> AttachmentSynchronizer<'a, R> {
    /// Creates a synchronizer for one pass.
    pub fn new(
        remote: &'a R,
        files: &'a dyn AttachmentStore,
        cache: &'a EtagCache,
        policy: AttachmentPolicy,
        byte_cap: u64,
    ) -> Self {
        Self {
            remote,
            files,
            cache,
            policy,
            byte_cap,
        }
    }

    /// Hashes a row's local files through the cache.
    pub fn hash_local_files(&self, table_id: &TableId, row_id: &RowId) -> SyncResult<Vec<HashedFile>> {
        self.files
            .list(table_id, row_id)?
            .into_iter()
            .map(|file| {
                let md5 = self.cache.file_md5(self.files, table_id, row_id, &file)?;
                Ok(HashedFile { file, md5 })
            })
            .collect()
    }

    /// Reconciles one row's files with the server.
    ///
    /// `checkpoint` is called between transfers and aborts the pass when it
    /// returns an error.
    ///
    /// # Errors
    ///
    /// Only authentication failures and checkpoint errors are returned;
    /// everything else is reported as [`TransferStatus::Failed`].
    pub fn sync_row(
        &self,
        table_id: &TableId,
        row: &Row,
        checkpoint: &dyn Fn() -> SyncResult<()>,
    ) -> SyncResult<RowTransfer> {
        if self.policy == AttachmentPolicy::None {
            return Ok(RowTransfer::new(TransferStatus::Deferred));
        }
        match self.transfer_row(table_id, row, checkpoint) {
            Ok(transfer) => Ok(transfer),
            Err(err) if fatal(&err) => Err(err),
            Err(err) => {
                warn!(table = %table_id, row = %row.row_id, error = %err, "attachment sync failed");
                Ok(RowTransfer::new(TransferStatus::Failed))
            }
        }
    }

    fn transfer_row(
        &self,
        table_id: &TableId,
        row: &Row,
        checkpoint: &dyn Fn() -> SyncResult<()>,
    ) -> SyncResult<RowTransfer> {
        let row_id = &row.row_id;
        let manifest_uri = self.remote.manifest_uri(table_id, row_id);
        let cached = self
            .cache
            .manifest_etag(&manifest_uri, table_id, self.policy.is_push_pass())?;

        let (manifest, manifest_etag) = match self
            .remote
            .row_manifest(table_id, row_id, cached.as_deref())?
        {
            ManifestResponse::NotModified => {
                debug!(table = %table_id, row = %row_id, "manifest unchanged");
                return Ok(RowTransfer::new(TransferStatus::Deferred));
            }
            ManifestResponse::Manifest { manifest, etag } => (manifest, etag),
        };

        let local = self.hash_local_files(table_id, row_id)?;
        let diff = diff_attachments(&local, &manifest, &row.attachment_refs);
        debug!(
            table = %table_id,
            row = %row_id,
            uploads = diff.uploads.len(),
            downloads = diff.downloads.len(),
            "attachment diff"
        );

        let mut transfer = RowTransfer::new(TransferStatus::Synced);
        let mut failed = !diff.missing.is_empty();
        let mut deferred = false;
        if failed {
            warn!(table = %table_id, row = %row_id, missing = ?diff.missing, "referenced files exist nowhere");
        }

        if !diff.downloads.is_empty() {
            if self.policy.allows_download() {
                checkpoint()?;
                match self.download(table_id, row_id, &diff.downloads) {
                    Ok((count, complete)) => {
                        transfer.downloaded = count;
                        failed |= !complete;
                    }
                    Err(err) if fatal(&err) => return Err(err),
                    Err(err) => {
                        warn!(table = %table_id, row = %row_id, error = %err, "download failed");
                        failed = true;
                    }
                }
            } else {
                deferred = true;
            }
        }

        if !diff.uploads.is_empty() {
            if self.policy.allows_upload() {
                let wanted: BTreeSet<&str> = diff.uploads.iter().map(String::as_str).collect();
                let files: Vec<LocalFile> = local
                    .into_iter()
                    .map(|h| h.file)
                    .filter(|f| wanted.contains(f.filename.as_str()))
                    .collect();
                for batch in partition_by_size(files, self.byte_cap, |f| f.len) {
                    checkpoint()?;
                    match self.upload(table_id, row_id, &batch) {
                        Ok(()) => transfer.uploaded += batch.len() as u64,
                        Err(err) if fatal(&err) => return Err(err),
                        Err(err) => {
                            warn!(table = %table_id, row = %row_id, error = %err, "upload failed");
                            failed = true;
                        }
                    }
                }
            } else {
                deferred = true;
            }
        }

        transfer.status = if failed {
            TransferStatus::Failed
        } else if deferred {
            TransferStatus::Deferred
        } else {
            let refetch = transfer.uploaded > 0;
            self.remember_manifest(table_id, row_id, &manifest_uri, manifest_etag, refetch)?;
            TransferStatus::Synced
        };
        Ok(transfer)
    }

    fn download(
        &self,
        table_id: &TableId,
        row_id: &RowId,
        filenames: &[String],
    ) -> SyncResult<(u64, bool)> {
        let parts = self.remote.download_files(table_id, row_id, filenames)?;
        let mut outstanding: BTreeSet<&str> = filenames.iter().map(String::as_str).collect();
        let mut written = 0;
        for part in &parts {
            if !outstanding.remove(part.filename.as_str()) {
                warn!(table = %table_id, row = %row_id, file = %part.filename, "unrequested part ignored");
                continue;
            }
            self.files
                .write(table_id, row_id, &part.filename, &part.contents)?;
            written += 1;
        }
        if !outstanding.is_empty() {
            warn!(table = %table_id, row = %row_id, missing = ?outstanding, "download incomplete");
        }
        Ok((written, outstanding.is_empty()))
    }

    fn upload(&self, table_id: &TableId, row_id: &RowId, batch: &[LocalFile]) -> SyncResult<()> {
        let parts = batch
            .iter()
            .map(|file| {
                let contents = self.files.read(table_id, row_id, &file.filename)?;
                Ok(FilePart::new(file.filename.clone(), contents))
            })
            .collect::<SyncResult<Vec<_>>>()?;
        self.remote.upload_files(table_id, row_id, &parts)
    }

    /// Stores the manifest ETag of a fully synced row. After uploads the
    /// manifest is refetched, since the ETag seen before them is stale.
    fn remember_manifest(
        &self,
        table_id: &TableId,
        row_id: &RowId,
        manifest_uri: &str,
        seen: Option<String>,
        refetch: bool,
    ) -> SyncResult<()> {
        let etag = if refetch {
            match self.remote.row_manifest(table_id, row_id, None)? {
                ManifestResponse::Manifest { etag, .. } => etag,
                ManifestResponse::NotModified => None,
            }
        } else {
            seen
        };
        match etag {
            Some(etag) => self.cache.store_manifest_etag(manifest_uri, table_id, etag),
            None => self.cache.forget_manifest(manifest_uri, table_id),
        }
    }
}

fn fatal(err: &SyncError) -> bool {
    err.aborts_run() || matches!(err, SyncError::Cancelled | SyncError::Aborted)
}

/// Computes what a pass would transfer for a row, without transferring.
pub fn plan_row(local: &[HashedFile], manifest: &RowManifest, referenced: &[String], cap: u64) -> TransferPlan {
    let diff = diff_attachments(local, manifest, referenced);
    let sizes: Vec<(String, u64)> = local
        .iter()
        .filter(|h| diff.uploads.contains(&h.file.filename))
        .map(|h| (h.file.filename.clone(), h.file.len))
        .collect();
    TransferPlan {
        upload_batches: partition_by_size(sizes, cap, |(_, len)| *len)
            .into_iter()
            .map(|batch| batch.into_iter().map(|(name, _)| name).collect())
            .collect(),
        diff,
    }
}

/// Transfers a pass would perform for one row.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TransferPlan {
    /// The raw diff.
    pub diff: AttachmentDiff,
    /// Upload file names, grouped into requests.
    pub upload_batches: Vec<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemote;
    use std::sync::Arc;
    use tablesync_protocol::SyncState;
    use tablesync_store::{MemoryAttachmentStore, MemoryEtagStore};

    struct Fixture {
        remote: MockRemote,
        files: MemoryAttachmentStore,
        cache: EtagCache,
        t: TableId,
        row: Row,
    }

    impl Fixture {
        fn new() -> Self {
            let mut row = Row::new("r", SyncState::SyncedPendingFiles);
            row.attachment_refs = vec!["a.jpg".into(), "b.jpg".into()];
            Self {
                remote: MockRemote::new(),
                files: MemoryAttachmentStore::new(),
                cache: EtagCache::new(Arc::new(MemoryEtagStore::new())),
                t: TableId::from("t"),
                row,
            }
        }

        fn sync(&self, policy: AttachmentPolicy, cap: u64) -> RowTransfer {
            AttachmentSynchronizer::new(&self.remote, &self.files, &self.cache, policy, cap)
                .sync_row(&self.t, &self.row, &|| Ok(()))
                .unwrap()
        }
    }

    #[test]
    fn uploads_and_downloads_then_caches_manifest() {
        let f = Fixture::new();
        let r = f.row.row_id.clone();
        f.files.write(&f.t, &r, "a.jpg", b"local-a").unwrap();
        f.remote.put_server_file(&f.t, &r, "b.jpg", b"server-b");

        let transfer = f.sync(AttachmentPolicy::Sync, 1024);
        assert_eq!(transfer.status, TransferStatus::Synced);
        assert_eq!((transfer.uploaded, transfer.downloaded), (1, 1));
        assert_eq!(f.files.read(&f.t, &r, "b.jpg").unwrap(), b"server-b");
        assert_eq!(f.remote.server_file(&f.t, &r, "a.jpg").unwrap(), b"local-a");

        let uri = f.remote.manifest_uri(&f.t, &r);
        assert!(f.cache.manifest_etag(&uri, &f.t, false).unwrap().is_some());
    }

    #[test]
    fn server_wins_on_content_mismatch() {
        let f = Fixture::new();
        let r = f.row.row_id.clone();
        f.files.write(&f.t, &r, "a.jpg", b"stale").unwrap();
        f.remote.put_server_file(&f.t, &r, "a.jpg", b"fresh");
        f.remote.put_server_file(&f.t, &r, "b.jpg", b"b");

        let transfer = f.sync(AttachmentPolicy::Sync, 1024);
        assert_eq!(transfer.status, TransferStatus::Synced);
        assert_eq!(f.files.read(&f.t, &r, "a.jpg").unwrap(), b"fresh");
        assert!(f.remote.uploads().is_empty());
    }

    #[test]
    fn upload_failure_keeps_row_pending() {
        let f = Fixture::new();
        let r = f.row.row_id.clone();
        f.files.write(&f.t, &r, "a.jpg", b"a").unwrap();
        f.files.write(&f.t, &r, "b.jpg", b"b").unwrap();
        f.remote.set_fail_uploads(true);

        let transfer = f.sync(AttachmentPolicy::Sync, 1024);
        assert_eq!(transfer.status, TransferStatus::Failed);
        let uri = f.remote.manifest_uri(&f.t, &r);
        assert!(f.cache.manifest_etag(&uri, &f.t, false).unwrap().is_none());
    }

    #[test]
    fn uploads_are_batched_by_byte_cap() {
        let f = Fixture::new();
        let r = f.row.row_id.clone();
        f.files.write(&f.t, &r, "a.jpg", &[0; 6]).unwrap();
        f.files.write(&f.t, &r, "b.jpg", &[0; 6]).unwrap();

        let transfer = f.sync(AttachmentPolicy::UploadOnly, 10);
        assert_eq!(transfer.uploaded, 2);
        assert_eq!(f.remote.uploads().len(), 2);
    }

    #[test]
    fn download_only_pass_defers_uploads() {
        let f = Fixture::new();
        let r = f.row.row_id.clone();
        f.files.write(&f.t, &r, "a.jpg", b"a").unwrap();
        f.remote.put_server_file(&f.t, &r, "b.jpg", b"b");

        let transfer = f.sync(AttachmentPolicy::DownloadOnly, 1024);
        assert_eq!(transfer.status, TransferStatus::Deferred);
        assert_eq!(transfer.downloaded, 1);
        assert!(f.remote.uploads().is_empty());
    }

    #[test]
    fn unchanged_manifest_short_circuits_pull_only_pass() {
        let f = Fixture::new();
        let r = f.row.row_id.clone();
        f.remote.put_server_file(&f.t, &r, "a.jpg", b"a");
        f.remote.put_server_file(&f.t, &r, "b.jpg", b"b");
        assert_eq!(f.sync(AttachmentPolicy::Sync, 1024).status, TransferStatus::Synced);
        let calls = f.remote.manifest_calls();

        let transfer = f.sync(AttachmentPolicy::DownloadOnly, 1024);
        assert_eq!(transfer.status, TransferStatus::Deferred);
        assert_eq!(transfer.downloaded, 0);
        assert_eq!(f.remote.manifest_calls(), calls + 1);
    }

    #[test]
    fn auth_failure_is_not_swallowed() {
        let f = Fixture::new();
        f.remote.set_fail_auth(true);
        let result = AttachmentSynchronizer::new(
            &f.remote,
            &f.files,
            &f.cache,
            AttachmentPolicy::Sync,
            1024,
        )
        .sync_row(&f.t, &f.row, &|| Ok(()));
        assert!(matches!(result, Err(SyncError::AuthenticationFailed(_))));
    }

    #[test]
    fn plan_groups_uploads() {
        let hashed = |name: &str, len: u64| HashedFile {
            file: LocalFile {
                filename: name.into(),
                uri: name.into(),
                len,
                last_modified: 0,
            },
            md5: format!("md5:{name}"),
        };
        let plan = plan_row(
            &[hashed("a", 8), hashed("b", 8), hashed("c", 1)],
            &RowManifest::default(),
            &[],
            10,
        );
        assert_eq!(
            plan.upload_batches,
            vec![vec!["a".to_string()], vec!["b".to_string(), "c".to_string()]]
        );
    }
}
