//! Local attachment file stores.

use crate::error::{StoreError, StoreResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::UNIX_EPOCH;
use tablesync_protocol::{RowId, TableId};
use tracing::{debug, warn};

/// A file attached to a local row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    /// File name relative to the row's attachment set (`/` separated).
    pub filename: String,
    /// Stable identity of the file's location, used as a cache key.
    pub uri: String,
    /// Size in bytes.
    pub len: u64,
    /// Last modification time in milliseconds since the Unix epoch.
    pub last_modified: i64,
}

/// Storage for the files attached to local rows.
///
/// Only content identity and transfer semantics matter to the engine; where
/// the bytes live is up to the implementation.
pub trait AttachmentStore: Send + Sync {
    /// Lists the files attached to a row, ordered by file name.
    fn list(&self, table_id: &TableId, row_id: &RowId) -> StoreResult<Vec<LocalFile>>;

    /// Reads a file's contents.
    fn read(&self, table_id: &TableId, row_id: &RowId, filename: &str) -> StoreResult<Vec<u8>>;

    /// Creates or replaces a file.
    fn write(
        &self,
        table_id: &TableId,
        row_id: &RowId,
        filename: &str,
        contents: &[u8],
    ) -> StoreResult<()>;

    /// Removes every file attached to a row.
    fn remove_row(&self, table_id: &TableId, row_id: &RowId) -> StoreResult<()>;
}

/// Encodes an id as a single path component. The empty id maps to `%`,
/// which no non-empty id encodes to.
fn dir_name(id: &str) -> String {
    if id.is_empty() {
        return "%".to_string();
    }
    urlencoding::encode(id).replace('.', "%2E")
}

fn validate_filename(filename: &str) -> StoreResult<()> {
    let path = Path::new(filename);
    let normal = !filename.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if normal {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(filename.to_string()))
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    contents: Vec<u8>,
    modified: i64,
}

/// An in-memory attachment store for tests.
///
/// Modification times come from a logical clock that advances on every
/// write, so rewriting a file always changes its `last_modified`.
#[derive(Debug, Default)]
pub struct MemoryAttachmentStore {
    files: RwLock<BTreeMap<(TableId, RowId), BTreeMap<String, MemoryFile>>>,
    clock: AtomicI64,
}

impl MemoryAttachmentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of files across all rows.
    pub fn file_count(&self) -> usize {
        self.files.read().values().map(BTreeMap::len).sum()
    }
}

impl AttachmentStore for MemoryAttachmentStore {
    fn list(&self, table_id: &TableId, row_id: &RowId) -> StoreResult<Vec<LocalFile>> {
        let files = self.files.read();
        let Some(row) = files.get(&(table_id.clone(), row_id.clone())) else {
            return Ok(Vec::new());
        };
        Ok(row
            .iter()
            .map(|(name, file)| LocalFile {
                filename: name.clone(),
                uri: format!("mem://{table_id}/{row_id}/{name}"),
                len: file.contents.len() as u64,
                last_modified: file.modified,
            })
            .collect())
    }

    fn read(&self, table_id: &TableId, row_id: &RowId, filename: &str) -> StoreResult<Vec<u8>> {
        self.files
            .read()
            .get(&(table_id.clone(), row_id.clone()))
            .and_then(|row| row.get(filename))
            .map(|f| f.contents.clone())
            .ok_or_else(|| {
                StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{table_id}/{row_id}/{filename}"),
                ))
            })
    }

    fn write(
        &self,
        table_id: &TableId,
        row_id: &RowId,
        filename: &str,
        contents: &[u8],
    ) -> StoreResult<()> {
        validate_filename(filename)?;
        let modified = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        self.files
            .write()
            .entry((table_id.clone(), row_id.clone()))
            .or_default()
            .insert(
                filename.to_string(),
                MemoryFile {
                    contents: contents.to_vec(),
                    modified,
                },
            );
        Ok(())
    }

    fn remove_row(&self, table_id: &TableId, row_id: &RowId) -> StoreResult<()> {
        self.files
            .write()
            .remove(&(table_id.clone(), row_id.clone()));
        Ok(())
    }
}

/// Attachment store rooted at a directory.
///
/// Layout: `<root>/<table>/<row>/<filename>`. Table and row directory names
/// are percent-encoded (dots included), so distinct ids never share a
/// directory and no id can name a parent directory.
#[derive(Debug, Clone)]
pub struct DirAttachmentStore {
    root: PathBuf,
}

impl DirAttachmentStore {
    /// Creates a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory holding a row's files.
    pub fn row_dir(&self, table_id: &TableId, row_id: &RowId) -> PathBuf {
        self.root
            .join(dir_name(table_id.as_str()))
            .join(dir_name(row_id.as_str()))
    }

    fn collect(dir: &Path, prefix: &str, out: &mut Vec<LocalFile>) -> StoreResult<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // Partially written files from an interrupted write.
            if name.ends_with(".partial") {
                continue;
            }
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                Self::collect(&entry.path(), &relative, out)?;
            } else {
                let last_modified = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
                    .unwrap_or(0);
                out.push(LocalFile {
                    filename: relative,
                    uri: entry.path().display().to_string(),
                    len: metadata.len(),
                    last_modified,
                });
            }
        }
        Ok(())
    }
}

impl AttachmentStore for DirAttachmentStore {
    fn list(&self, table_id: &TableId, row_id: &RowId) -> StoreResult<Vec<LocalFile>> {
        let dir = self.row_dir(table_id, row_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        Self::collect(&dir, "", &mut files)?;
        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(files)
    }

    fn read(&self, table_id: &TableId, row_id: &RowId, filename: &str) -> StoreResult<Vec<u8>> {
        validate_filename(filename)?;
        Ok(fs::read(self.row_dir(table_id, row_id).join(filename))?)
    }

    fn write(
        &self,
        table_id: &TableId,
        row_id: &RowId,
        filename: &str,
        contents: &[u8],
    ) -> StoreResult<()> {
        validate_filename(filename)?;
        let path = self.row_dir(table_id, row_id).join(filename);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut partial = path.clone().into_os_string();
        partial.push(".partial");
        let written = fs::write(&partial, contents).and_then(|()| fs::rename(&partial, &path));
        if let Err(err) = written {
            if let Err(cleanup) = fs::remove_file(&partial) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %cleanup, "partial file left behind");
                }
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn remove_row(&self, table_id: &TableId, row_id: &RowId) -> StoreResult<()> {
        let dir = self.row_dir(table_id, row_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(table = %table_id, row = %row_id, "removed row files");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
