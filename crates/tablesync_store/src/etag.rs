//! ETag cache persistence.

use crate::error::{StoreError, StoreResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tablesync_protocol::TableId;

/// Key of a cached ETag.
///
/// Manifests are keyed by `(uri, table, None)`. Local file content hashes
/// are keyed by `(file uri, table, Some(last_modified))` so a touched file
/// misses the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EtagKey {
    /// Resource URI.
    pub uri: String,
    /// Owning table, if the resource belongs to one.
    pub table_id: Option<TableId>,
    /// Modification time the ETag was computed at.
    pub last_modified: Option<i64>,
}

impl EtagKey {
    /// Key for a server resource such as a row manifest.
    pub fn resource(uri: impl Into<String>, table_id: &TableId) -> Self {
        Self {
            uri: uri.into(),
            table_id: Some(table_id.clone()),
            last_modified: None,
        }
    }

    /// Key for a local file's content hash at a given modification time.
    pub fn file(uri: impl Into<String>, table_id: &TableId, last_modified: i64) -> Self {
        Self {
            uri: uri.into(),
            table_id: Some(table_id.clone()),
            last_modified: Some(last_modified),
        }
    }
}

/// Persistent point-lookup store for ETags.
pub trait EtagStore: Send + Sync {
    /// Looks up an ETag.
    fn get(&self, key: &EtagKey) -> StoreResult<Option<String>>;

    /// Stores an ETag, replacing any previous value for the key.
    fn put(&self, key: EtagKey, etag: String) -> StoreResult<()>;

    /// Removes an ETag.
    fn remove(&self, key: &EtagKey) -> StoreResult<()>;

    /// Removes every entry for `uri`, whatever its table or modification time.
    fn remove_uri(&self, uri: &str) -> StoreResult<usize>;

    /// Removes every entry belonging to a table.
    fn remove_table(&self, table_id: &TableId) -> StoreResult<usize>;

    /// Returns all entries, ordered by key.
    fn entries(&self) -> StoreResult<Vec<(EtagKey, String)>>;
}

/// An in-memory ETag store.
#[derive(Debug, Default)]
pub struct MemoryEtagStore {
    entries: RwLock<BTreeMap<EtagKey, String>>,
}

impl MemoryEtagStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EtagStore for MemoryEtagStore {
    fn get(&self, key: &EtagKey) -> StoreResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: EtagKey, etag: String) -> StoreResult<()> {
        self.entries.write().insert(key, etag);
        Ok(())
    }

    fn remove(&self, key: &EtagKey) -> StoreResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn remove_uri(&self, uri: &str) -> StoreResult<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|k, _| k.uri != uri);
        Ok(before - entries.len())
    }

    fn remove_table(&self, table_id: &TableId) -> StoreResult<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|k, _| k.table_id.as_ref() != Some(table_id));
        Ok(before - entries.len())
    }

    fn entries(&self) -> StoreResult<Vec<(EtagKey, String)>> {
        Ok(self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// An ETag store persisted to a single CBOR file.
///
/// The whole map is rewritten on every mutation (write to a sibling
/// temporary file, then rename), so a crash leaves either the old or the
/// new cache on disk.
#[derive(Debug)]
pub struct FileEtagStore {
    path: PathBuf,
    inner: MemoryEtagStore,
}

impl FileEtagStore {
    /// Opens (or creates) the cache file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or decoded.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let inner = MemoryEtagStore::new();
        if path.exists() {
            for (key, etag) in Self::load(&path)? {
                inner.put(key, etag)?;
            }
        }
        Ok(Self { path, inner })
    }

    /// Reads the entries of a cache file without opening it for writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or decoded.
    pub fn load(path: &Path) -> StoreResult<Vec<(EtagKey, String)>> {
        let bytes = fs::read(path)?;
        ciborium::from_reader(bytes.as_slice()).map_err(|e| StoreError::Codec(e.to_string()))
    }

    /// Returns the cache file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> StoreResult<()> {
        let entries = self.inner.entries()?;
        let mut bytes = Vec::new();
        ciborium::into_writer(&entries, &mut bytes).map_err(|e| StoreError::Codec(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl EtagStore for FileEtagStore {
    fn get(&self, key: &EtagKey) -> StoreResult<Option<String>> {
        self.inner.get(key)
    }

    fn put(&self, key: EtagKey, etag: String) -> StoreResult<()> {
        self.inner.put(key, etag)?;
        self.persist()
    }

    fn remove(&self, key: &EtagKey) -> StoreResult<()> {
        self.inner.remove(key)?;
        self.persist()
    }

    fn remove_uri(&self, uri: &str) -> StoreResult<usize> {
        let removed = self.inner.remove_uri(uri)?;
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    fn remove_table(&self, table_id: &TableId) -> StoreResult<usize> {
        let removed = self.inner.remove_table(table_id)?;
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    fn entries(&self) -> StoreResult<Vec<(EtagKey, String)>> {
        self.inner.entries()
    }
}
