//! Server-side table state.
//!
//! Each table keeps the latest version of every row (deletions stay as
//! tombstones so diffs can report them) and a version counter that is
//! bumped once per accepted write. The data ETag is `d<version>`; a diff
//! since `d<n>` returns every row written after version `n`.

use crate::error::{ServerError, ServerResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tablesync_protocol::{
    content_md5, AlterRowsRequest, AlterRowsResponse, ChangesetPage, FilePart, FilterType,
    ManifestEntry, RemoteTableState, RowChange, RowId, RowManifest, RowOutcome, RowOutcomeKind,
    TableId,
};
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredRow {
    change: RowChange,
    version: u64,
}

#[derive(Debug, Default)]
struct ServerTable {
    schema_etag: String,
    version: u64,
    rows: BTreeMap<RowId, StoredRow>,
    files: BTreeMap<(RowId, String), Vec<u8>>,
    manifest_versions: BTreeMap<RowId, u64>,
}

impl ServerTable {
    fn data_etag(&self) -> String {
        format!("d{}", self.version)
    }

    fn write(&mut self, version: u64, mut change: RowChange) -> RowChange {
        change.row_etag = Some(format!("r{version}"));
        self.rows.insert(
            change.row_id.clone(),
            StoredRow {
                change: change.clone(),
                version,
            },
        );
        change
    }

    fn manifest_etag(&self, row_id: &RowId) -> String {
        let version = self.manifest_versions.get(row_id).copied().unwrap_or(0);
        format!("\"m{version}\"")
    }

    /// Decides one pushed row against the current state. `next` is the
    /// version accepted writes get.
    fn alter_row(&mut self, change: &RowChange, next: u64) -> RowOutcome {
        let existing = self.rows.get(&change.row_id).map(|row| row.change.clone());
        let Some(existing) = existing else {
            return if change.deleted {
                RowOutcome::new(change.clone(), RowOutcomeKind::Failed)
            } else {
                RowOutcome::new(self.write(next, change.clone()), RowOutcomeKind::Success)
            };
        };

        if matches!(
            existing.metadata.filter.filter_type,
            FilterType::ReadOnly | FilterType::Hidden
        ) {
            return RowOutcome::new(change.clone(), RowOutcomeKind::Denied);
        }
        if existing.deleted && change.deleted {
            return RowOutcome::new(change.clone(), RowOutcomeKind::Failed);
        }
        if existing.row_etag != change.row_etag {
            return RowOutcome::new(existing, RowOutcomeKind::InConflict);
        }

        let mut accepted = change.clone();
        if accepted.deleted {
            accepted.values.clear();
        }
        RowOutcome::new(self.write(next, accepted), RowOutcomeKind::Success)
    }
}

fn parse_version(data_etag: &str) -> Option<u64> {
    data_etag.strip_prefix('d')?.parse().ok()
}

fn encode_cursor(row: &StoredRow) -> String {
    format!("{}:{}", row.version, row.change.row_id)
}

fn decode_cursor(cursor: &str) -> ServerResult<(u64, RowId)> {
    cursor
        .split_once(':')
        .and_then(|(version, row)| Some((version.parse().ok()?, RowId::from(row))))
        .ok_or_else(|| ServerError::InvalidRequest(format!("bad cursor {cursor:?}")))
}

/// All tables served by one server.
#[derive(Debug, Default)]
pub struct ServerTables {
    tables: RwLock<BTreeMap<TableId, ServerTable>>,
}

impl ServerTables {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, table_id: &TableId, f: impl FnOnce(&ServerTable) -> ServerResult<T>) -> ServerResult<T> {
        let tables = self.tables.read();
        let table = tables
            .get(table_id)
            .ok_or_else(|| ServerError::NotFound(format!("table {table_id}")))?;
        f(table)
    }

    fn write<T>(
        &self,
        table_id: &TableId,
        f: impl FnOnce(&mut ServerTable) -> ServerResult<T>,
    ) -> ServerResult<T> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(table_id)
            .ok_or_else(|| ServerError::NotFound(format!("table {table_id}")))?;
        f(table)
    }

    /// Creates a table, or replaces its schema ETag if it exists.
    pub fn create_table(&self, table_id: impl Into<TableId>, schema_etag: impl Into<String>) {
        let mut tables = self.tables.write();
        let table = tables.entry(table_id.into()).or_default();
        table.schema_etag = schema_etag.into();
    }

    /// Returns the ids of every table.
    pub fn table_ids(&self) -> Vec<TableId> {
        self.tables.read().keys().cloned().collect()
    }

    /// Returns a table's schema and data ETags.
    pub fn table_state(&self, table_id: &TableId) -> ServerResult<RemoteTableState> {
        self.read(table_id, |table| {
            Ok(RemoteTableState {
                table_id: table_id.clone(),
                schema_etag: table.schema_etag.clone(),
                data_etag: Some(table.data_etag()),
            })
        })
    }

    /// Returns one page of rows written since `since`.
    ///
    /// Without `since` (or with an ETag this server never issued) the page
    /// sequence is a full snapshot and omits tombstones.
    pub fn diff(
        &self,
        table_id: &TableId,
        since: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> ServerResult<ChangesetPage> {
        let after = cursor.map(decode_cursor).transpose()?;
        self.read(table_id, |table| {
            let since = since
                .and_then(parse_version)
                .filter(|version| *version <= table.version);
            let mut rows: Vec<&StoredRow> = table
                .rows
                .values()
                .filter(|row| row.version > since.unwrap_or(0))
                .filter(|row| since.is_some() || !row.change.deleted)
                .collect();
            rows.sort_by(|a, b| (a.version, &a.change.row_id).cmp(&(b.version, &b.change.row_id)));
            if let Some((version, row_id)) = &after {
                rows.retain(|row| (row.version, &row.change.row_id) > (*version, row_id));
            }

            let limit = limit.max(1);
            let has_more = rows.len() > limit;
            rows.truncate(limit);
            let page_rows = rows.iter().map(|row| row.change.clone()).collect();
            Ok(match rows.last() {
                Some(last) if has_more => {
                    ChangesetPage::partial(page_rows, table.data_etag(), encode_cursor(last))
                }
                _ => ChangesetPage::last(page_rows, table.data_etag()),
            })
        })
    }

    /// Applies a push batch.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::DataEtagConflict` if `prior_data_etag` is not
    /// the table's current data ETag. Nothing is applied in that case.
    pub fn alter_rows(
        &self,
        table_id: &TableId,
        request: &AlterRowsRequest,
    ) -> ServerResult<AlterRowsResponse> {
        self.write(table_id, |table| {
            let current = table.data_etag();
            if request.prior_data_etag.as_deref() != Some(current.as_str()) {
                return Err(ServerError::DataEtagConflict {
                    table_id: table_id.to_string(),
                    current,
                    actual: request.prior_data_etag.clone(),
                });
            }

            let next = table.version + 1;
            let outcomes: Vec<RowOutcome> = request
                .rows
                .iter()
                .map(|change| table.alter_row(change, next))
                .collect();
            if outcomes
                .iter()
                .any(|o| o.outcome == RowOutcomeKind::Success)
            {
                table.version = next;
            }
            debug!(table = %table_id, rows = outcomes.len(), data_etag = %table.data_etag(), "alter rows");
            Ok(AlterRowsResponse {
                outcomes,
                data_etag: table.data_etag(),
            })
        })
    }

    /// Writes a row as another client would, returning the stored change.
    pub fn put_row(&self, table_id: &TableId, change: RowChange) -> ServerResult<RowChange> {
        self.write(table_id, |table| {
            table.version += 1;
            let version = table.version;
            Ok(table.write(version, change))
        })
    }

    /// Deletes a row as another client would. Returns false if it did not exist.
    pub fn delete_row(&self, table_id: &TableId, row_id: &RowId) -> ServerResult<bool> {
        self.write(table_id, |table| {
            let Some(existing) = table.rows.get(row_id).filter(|row| !row.change.deleted) else {
                return Ok(false);
            };
            let mut tombstone = existing.change.clone();
            tombstone.deleted = true;
            tombstone.values.clear();
            table.version += 1;
            let version = table.version;
            table.write(version, tombstone);
            Ok(true)
        })
    }

    /// Returns the stored version of a row, tombstones included.
    pub fn row(&self, table_id: &TableId, row_id: &RowId) -> Option<RowChange> {
        self.read(table_id, |table| {
            Ok(table.rows.get(row_id).map(|row| row.change.clone()))
        })
        .ok()
        .flatten()
    }

    /// Returns a row's file manifest and its ETag.
    pub fn manifest(&self, table_id: &TableId, row_id: &RowId) -> ServerResult<(RowManifest, String)> {
        self.read(table_id, |table| {
            let entries = table
                .files
                .iter()
                .filter(|((row, _), _)| row == row_id)
                .map(|((_, filename), contents)| ManifestEntry {
                    filename: filename.clone(),
                    md5hash: content_md5(contents),
                    download_url: None,
                    content_length: contents.len() as u64,
                })
                .collect();
            Ok((RowManifest { entries }, table.manifest_etag(row_id)))
        })
    }

    /// Stores uploaded files, replacing files with the same name.
    pub fn store_files(&self, table_id: &TableId, row_id: &RowId, parts: Vec<FilePart>) -> ServerResult<()> {
        if parts.iter().any(|p| p.filename.is_empty()) {
            return Err(ServerError::InvalidRequest("part without a file name".into()));
        }
        self.write(table_id, |table| {
            for part in parts {
                table
                    .files
                    .insert((row_id.clone(), part.filename), part.contents);
            }
            *table.manifest_versions.entry(row_id.clone()).or_default() += 1;
            Ok(())
        })
    }

    /// Returns the requested files that exist.
    pub fn files(&self, table_id: &TableId, row_id: &RowId, filenames: &[String]) -> ServerResult<Vec<FilePart>> {
        self.read(table_id, |table| {
            Ok(filenames
                .iter()
                .filter_map(|name| {
                    table
                        .files
                        .get(&(row_id.clone(), name.clone()))
                        .map(|contents| FilePart::new(name.clone(), contents.clone()))
                })
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> (ServerTables, TableId) {
        let tables = ServerTables::new();
        tables.create_table("t", "s1");
        (tables, TableId::from("t"))
    }

    fn push(tables: &ServerTables, t: &TableId, prior: &str, rows: Vec<RowChange>) -> AlterRowsResponse {
        tables
            .alter_rows(
                t,
                &AlterRowsRequest {
                    prior_data_etag: Some(prior.into()),
                    rows,
                },
            )
            .unwrap()
    }

    #[test]
    fn diff_pages_in_version_order() {
        let (tables, t) = tables();
        for id in ["c", "a", "b"] {
            tables.put_row(&t, RowChange::update(id, "")).unwrap();
        }
        let first = tables.diff(&t, None, None, 2).unwrap();
        let ids: Vec<_> = first.rows.iter().map(|r| r.row_id.as_str()).collect();
        assert_eq!(ids, ["c", "a"]);
        assert!(first.has_more);

        let second = tables
            .diff(&t, None, first.next_cursor.as_deref(), 2)
            .unwrap();
        assert_eq!(second.rows.len(), 1);
        assert!(!second.has_more);
        assert_eq!(second.data_etag, "d3");

        let since = tables.diff(&t, Some("d2"), None, 10).unwrap();
        assert_eq!(since.rows.len(), 1);
        assert_eq!(since.rows[0].row_id.as_str(), "b");
    }

    #[test]
    fn tombstones_only_in_incremental_diffs() {
        let (tables, t) = tables();
        tables.put_row(&t, RowChange::update("a", "")).unwrap();
        assert!(tables.delete_row(&t, &"a".into()).unwrap());
        assert!(!tables.delete_row(&t, &"a".into()).unwrap());

        assert!(tables.diff(&t, None, None, 10).unwrap().rows.is_empty());
        let since = tables.diff(&t, Some("d1"), None, 10).unwrap();
        assert!(since.rows[0].deleted);
    }

    #[test]
    fn stale_push_is_rejected_whole() {
        let (tables, t) = tables();
        let err = tables
            .alter_rows(
                &t,
                &AlterRowsRequest {
                    prior_data_etag: Some("d7".into()),
                    rows: vec![RowChange::update("a", "")],
                },
            )
            .unwrap_err();
        assert_eq!(err.status(), 409);
        assert!(tables.row(&t, &"a".into()).is_none());
    }

    #[test]
    fn push_outcomes() {
        let (tables, t) = tables();
        let a = tables.put_row(&t, RowChange::update("a", "")).unwrap();
        let mut locked = RowChange::update("l", "");
        locked.metadata.filter.filter_type = FilterType::ReadOnly;
        let locked = tables.put_row(&t, locked).unwrap();

        let response = push(
            &tables,
            &t,
            "d2",
            vec![
                RowChange::update("new", "").with_value("n", 1i64),
                RowChange::update("a", "stale"),
                RowChange::deletion("ghost", "r1"),
                RowChange::update("l", locked.row_etag.clone().unwrap_or_default()),
            ],
        );
        let kinds: Vec<_> = response.outcomes.iter().map(|o| o.outcome).collect();
        assert_eq!(
            kinds,
            [
                RowOutcomeKind::Success,
                RowOutcomeKind::InConflict,
                RowOutcomeKind::Failed,
                RowOutcomeKind::Denied
            ]
        );
        assert_eq!(response.outcomes[1].row, a);
        assert_eq!(response.data_etag, "d3");
        assert_eq!(response.outcomes[0].row.row_etag.as_deref(), Some("r3"));

        let delete = push(&tables, &t, "d3", vec![RowChange::deletion("a", "r1")]);
        assert_eq!(delete.outcomes[0].outcome, RowOutcomeKind::Success);
        assert!(tables.row(&t, &"a".into()).unwrap().deleted);
    }

    #[test]
    fn uploads_bump_the_manifest_etag() {
        let (tables, t) = tables();
        let r = RowId::from("r");
        let (empty, etag0) = tables.manifest(&t, &r).unwrap();
        assert!(empty.entries.is_empty());

        tables
            .store_files(&t, &r, vec![FilePart::new("a.jpg", b"abc".to_vec())])
            .unwrap();
        let (manifest, etag1) = tables.manifest(&t, &r).unwrap();
        assert_ne!(etag0, etag1);
        assert_eq!(manifest.entries[0].md5hash, content_md5(b"abc"));

        let files = tables
            .files(&t, &r, &["a.jpg".into(), "missing.jpg".into()])
            .unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn unknown_table_is_not_found() {
        let tables = ServerTables::new();
        assert_eq!(
            tables.table_state(&"nope".into()).unwrap_err().status(),
            404
        );
    }
}
