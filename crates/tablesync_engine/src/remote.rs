//! Remote API abstraction.
//!
//! The engine sees the server through two traits: [`RemoteTableApi`] for row
//! data and [`AttachmentApi`] for row files. [`crate::RestRemote`] implements
//! both over HTTP; [`MockRemote`] is a scriptable in-memory fake for tests.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use tablesync_protocol::{
    content_md5, AlterRowsRequest, AlterRowsResponse, ChangesetPage, FilePart, ManifestEntry,
    RemoteTableState, RowId, RowManifest, RowOutcome, RowOutcomeKind, TableId,
};

/// Row-data half of the remote API.
pub trait RemoteTableApi: Send + Sync {
    /// Returns the table's current schema and data ETags.
    fn table_state(&self, table_id: &TableId) -> SyncResult<RemoteTableState>;

    /// Fetches one page of changes made since `since_data_etag`.
    ///
    /// `cursor` is the previous page's `next_cursor`; `None` starts a new
    /// pagination.
    fn get_updates(
        &self,
        table_id: &TableId,
        since_data_etag: Option<&str>,
        cursor: Option<&str>,
        page_size_hint: usize,
    ) -> SyncResult<ChangesetPage>;

    /// Applies a batch of row changes atomically.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::DataEtagConflict` when `prior_data_etag` is stale.
    fn alter_rows(
        &self,
        table_id: &TableId,
        request: &AlterRowsRequest,
    ) -> SyncResult<AlterRowsResponse>;
}

/// Response to a conditional manifest fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestResponse {
    /// The cached ETag still matches (HTTP 304).
    NotModified,
    /// The current manifest and its ETag.
    Manifest {
        /// Files on the server.
        manifest: RowManifest,
        /// ETag to cache, if the server sent one.
        etag: Option<String>,
    },
}

/// Attachment half of the remote API.
pub trait AttachmentApi: Send + Sync {
    /// Stable URI of a row's manifest, used as its cache key.
    fn manifest_uri(&self, table_id: &TableId, row_id: &RowId) -> String;

    /// Fetches a row's manifest, conditionally on `if_none_match`.
    fn row_manifest(
        &self,
        table_id: &TableId,
        row_id: &RowId,
        if_none_match: Option<&str>,
    ) -> SyncResult<ManifestResponse>;

    /// Uploads a batch of files in one request.
    fn upload_files(&self, table_id: &TableId, row_id: &RowId, files: &[FilePart])
        -> SyncResult<()>;

    /// Downloads a batch of files in one request. Files the server could not
    /// serve are absent from the result.
    fn download_files(
        &self,
        table_id: &TableId,
        row_id: &RowId,
        filenames: &[String],
    ) -> SyncResult<Vec<FilePart>>;
}

/// Everything the engine needs from the server.
pub trait Remote: RemoteTableApi + AttachmentApi {}

impl<T: RemoteTableApi + AttachmentApi> Remote for T {}

#[derive(Default)]
struct MockState {
    tables: BTreeMap<TableId, RemoteTableState>,
    pages: BTreeMap<TableId, VecDeque<SyncResult<ChangesetPage>>>,
    alter_results: BTreeMap<TableId, VecDeque<SyncResult<AlterRowsResponse>>>,
    pushed: Vec<(TableId, AlterRowsRequest)>,
    manifests: BTreeMap<(TableId, RowId), (RowManifest, String)>,
    files: BTreeMap<(TableId, RowId, String), Vec<u8>>,
    uploads: Vec<(TableId, RowId, Vec<String>)>,
    manifest_calls: usize,
    fail_uploads: bool,
    fail_auth: bool,
    version: u64,
}

impl MockState {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn refresh_manifest(&mut self, table_id: &TableId, row_id: &RowId) {
        let entries: Vec<ManifestEntry> = self
            .files
            .iter()
            .filter(|((t, r, _), _)| t == table_id && r == row_id)
            .map(|((_, _, name), contents)| ManifestEntry {
                filename: name.clone(),
                md5hash: content_md5(contents),
                download_url: None,
                content_length: contents.len() as u64,
            })
            .collect();
        let etag = format!("m{}", self.next_version());
        self.manifests.insert(
            (table_id.clone(), row_id.clone()),
            (RowManifest { entries }, etag),
        );
    }
}

/// A scriptable in-memory remote for tests.
///
/// Changeset pages and push results are queued per table. With nothing
/// queued, `get_updates` returns an empty final page and `alter_rows`
/// accepts every row.
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<MockState>,
}

impl MockRemote {
    /// Creates an empty mock remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the table state returned by `table_state`.
    pub fn set_table_state(&self, state: RemoteTableState) {
        self.state.lock().tables.insert(state.table_id.clone(), state);
    }

    /// Queues a `get_updates` result.
    pub fn queue_page(&self, table_id: &TableId, page: SyncResult<ChangesetPage>) {
        self.state
            .lock()
            .pages
            .entry(table_id.clone())
            .or_default()
            .push_back(page);
    }

    /// Queues an `alter_rows` result.
    pub fn queue_alter_result(&self, table_id: &TableId, result: SyncResult<AlterRowsResponse>) {
        self.state
            .lock()
            .alter_results
            .entry(table_id.clone())
            .or_default()
            .push_back(result);
    }

    /// Push requests received so far.
    pub fn pushed(&self) -> Vec<(TableId, AlterRowsRequest)> {
        self.state.lock().pushed.clone()
    }

    /// Places a file on the server and refreshes the row's manifest.
    pub fn put_server_file(&self, table_id: &TableId, row_id: &RowId, filename: &str, contents: &[u8]) {
        let mut state = self.state.lock();
        state.files.insert(
            (table_id.clone(), row_id.clone(), filename.to_string()),
            contents.to_vec(),
        );
        state.refresh_manifest(table_id, row_id);
    }

    /// Returns a server file's contents.
    pub fn server_file(&self, table_id: &TableId, row_id: &RowId, filename: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .files
            .get(&(table_id.clone(), row_id.clone(), filename.to_string()))
            .cloned()
    }

    /// Upload batches received so far, as file name lists.
    pub fn uploads(&self) -> Vec<(TableId, RowId, Vec<String>)> {
        self.state.lock().uploads.clone()
    }

    /// Number of manifest requests received.
    pub fn manifest_calls(&self) -> usize {
        self.state.lock().manifest_calls
    }

    /// Makes every upload fail with a transport error.
    pub fn set_fail_uploads(&self, fail: bool) {
        self.state.lock().fail_uploads = fail;
    }

    /// Makes every call fail with 401.
    pub fn set_fail_auth(&self, fail: bool) {
        self.state.lock().fail_auth = fail;
    }

    fn check_auth(state: &MockState) -> SyncResult<()> {
        if state.fail_auth {
            Err(SyncError::AuthenticationFailed("mock credentials rejected".into()))
        } else {
            Ok(())
        }
    }
}

impl RemoteTableApi for MockRemote {
    fn table_state(&self, table_id: &TableId) -> SyncResult<RemoteTableState> {
        let state = self.state.lock();
        Self::check_auth(&state)?;
        state
            .tables
            .get(table_id)
            .cloned()
            .ok_or_else(|| SyncError::transport_fatal(format!("no such table: {table_id}")))
    }

    fn get_updates(
        &self,
        table_id: &TableId,
        _since_data_etag: Option<&str>,
        _cursor: Option<&str>,
        _page_size_hint: usize,
    ) -> SyncResult<ChangesetPage> {
        let mut state = self.state.lock();
        Self::check_auth(&state)?;
        if let Some(page) = state.pages.get_mut(table_id).and_then(VecDeque::pop_front) {
            return page;
        }
        let etag = state
            .tables
            .get(table_id)
            .and_then(|t| t.data_etag.clone())
            .unwrap_or_else(|| "d0".to_string());
        Ok(ChangesetPage::last(Vec::new(), etag))
    }

    fn alter_rows(
        &self,
        table_id: &TableId,
        request: &AlterRowsRequest,
    ) -> SyncResult<AlterRowsResponse> {
        let mut state = self.state.lock();
        Self::check_auth(&state)?;
        state.pushed.push((table_id.clone(), request.clone()));
        if let Some(result) = state
            .alter_results
            .get_mut(table_id)
            .and_then(VecDeque::pop_front)
        {
            return result;
        }

        let version = state.next_version();
        let outcomes = request
            .rows
            .iter()
            .map(|row| {
                let mut accepted = row.clone();
                accepted.row_etag = Some(format!("{}-v{version}", row.row_id));
                RowOutcome::new(accepted, RowOutcomeKind::Success)
            })
            .collect();
        let data_etag = format!("d{version}");
        if let Some(table) = state.tables.get_mut(table_id) {
            table.data_etag = Some(data_etag.clone());
        }
        Ok(AlterRowsResponse {
            outcomes,
            data_etag,
        })
    }
}

impl AttachmentApi for MockRemote {
    fn manifest_uri(&self, table_id: &TableId, row_id: &RowId) -> String {
        format!("mock://{table_id}/{row_id}/manifest")
    }

    fn row_manifest(
        &self,
        table_id: &TableId,
        row_id: &RowId,
        if_none_match: Option<&str>,
    ) -> SyncResult<ManifestResponse> {
        let mut state = self.state.lock();
        Self::check_auth(&state)?;
        state.manifest_calls += 1;
        match state.manifests.get(&(table_id.clone(), row_id.clone())) {
            Some((_, etag)) if if_none_match == Some(etag.as_str()) => {
                Ok(ManifestResponse::NotModified)
            }
            Some((manifest, etag)) => Ok(ManifestResponse::Manifest {
                manifest: manifest.clone(),
                etag: Some(etag.clone()),
            }),
            None => Ok(ManifestResponse::Manifest {
                manifest: RowManifest::default(),
                etag: None,
            }),
        }
    }

    fn upload_files(
        &self,
        table_id: &TableId,
        row_id: &RowId,
        files: &[FilePart],
    ) -> SyncResult<()> {
        let mut state = self.state.lock();
        Self::check_auth(&state)?;
        if state.fail_uploads {
            return Err(SyncError::transport_retryable("mock upload failure"));
        }
        for file in files {
            state.files.insert(
                (table_id.clone(), row_id.clone(), file.filename.clone()),
                file.contents.clone(),
            );
        }
        state.uploads.push((
            table_id.clone(),
            row_id.clone(),
            files.iter().map(|f| f.filename.clone()).collect(),
        ));
        state.refresh_manifest(table_id, row_id);
        Ok(())
    }

    fn download_files(
        &self,
        table_id: &TableId,
        row_id: &RowId,
        filenames: &[String],
    ) -> SyncResult<Vec<FilePart>> {
        let state = self.state.lock();
        Self::check_auth(&state)?;
        Ok(filenames
            .iter()
            .filter_map(|name| {
                state
                    .files
                    .get(&(table_id.clone(), row_id.clone(), name.clone()))
                    .map(|contents| FilePart::new(name.clone(), contents.clone()))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_protocol::RowChange;

    #[test]
    fn default_push_accepts_every_row() {
        let remote = MockRemote::new();
        let t = TableId::from("t");
        remote.set_table_state(RemoteTableState {
            table_id: t.clone(),
            schema_etag: "s1".into(),
            data_etag: Some("d0".into()),
        });
        let response = remote
            .alter_rows(
                &t,
                &AlterRowsRequest {
                    prior_data_etag: Some("d0".into()),
                    rows: vec![RowChange::update("a", "e0")],
                },
            )
            .unwrap();
        assert_eq!(response.outcomes[0].outcome, RowOutcomeKind::Success);
        assert_eq!(
            remote.table_state(&t).unwrap().data_etag,
            Some(response.data_etag)
        );
        assert_eq!(remote.pushed().len(), 1);
    }

    #[test]
    fn queued_results_come_first() {
        let remote = MockRemote::new();
        let t = TableId::from("t");
        remote.queue_alter_result(
            &t,
            Err(SyncError::DataEtagConflict {
                table_id: "t".into(),
            }),
        );
        let request = AlterRowsRequest {
            prior_data_etag: None,
            rows: Vec::new(),
        };
        assert!(remote.alter_rows(&t, &request).is_err());
        assert!(remote.alter_rows(&t, &request).is_ok());
    }

    #[test]
    fn manifests_are_conditional() {
        let remote = MockRemote::new();
        let (t, r) = (TableId::from("t"), RowId::from("r"));
        remote.put_server_file(&t, &r, "a.jpg", b"abc");

        let ManifestResponse::Manifest { manifest, etag } =
            remote.row_manifest(&t, &r, None).unwrap()
        else {
            panic!("expected a manifest");
        };
        assert_eq!(manifest.entries[0].md5hash, content_md5(b"abc"));
        assert_eq!(
            remote.row_manifest(&t, &r, etag.as_deref()).unwrap(),
            ManifestResponse::NotModified
        );
        assert_eq!(remote.manifest_calls(), 2);
    }
}
