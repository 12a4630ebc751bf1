//! ETag / manifest cache.
//!
//! Two kinds of entries share one [`EtagStore`]:
//! - row manifest ETags, keyed `(manifest uri, table, None)`, sent as
//!   `If-None-Match` so an unchanged manifest short-circuits the diff
//! - local file content hashes, keyed `(file uri, table, last_modified)`, so
//!   unchanged files are not re-hashed

use crate::error::SyncResult;
use std::sync::Arc;
use tablesync_protocol::{content_md5, RowId, TableId};
use tablesync_store::{AttachmentStore, EtagKey, EtagStore, LocalFile};
use tracing::trace;

/// Cache of server manifest ETags and local file hashes.
#[derive(Clone)]
pub struct EtagCache {
    store: Arc<dyn EtagStore>,
}

impl std::fmt::Debug for EtagCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtagCache").finish_non_exhaustive()
    }
}

impl EtagCache {
    /// Wraps a persistent store.
    pub fn new(store: Arc<dyn EtagStore>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn EtagStore> {
        &self.store
    }

    /// ETag to send with a manifest request, or `None` to force a full fetch.
    ///
    /// A push pass always bypasses the cache: the diff must see the
    /// server's post-push state.
    pub fn manifest_etag(
        &self,
        manifest_uri: &str,
        table_id: &TableId,
        push_pass: bool,
    ) -> SyncResult<Option<String>> {
        if push_pass {
            return Ok(None);
        }
        Ok(self.store.get(&EtagKey::resource(manifest_uri, table_id))?)
    }

    /// Remembers the manifest ETag of a fully synced row.
    pub fn store_manifest_etag(
        &self,
        manifest_uri: &str,
        table_id: &TableId,
        etag: String,
    ) -> SyncResult<()> {
        self.store
            .put(EtagKey::resource(manifest_uri, table_id), etag)?;
        Ok(())
    }

    /// Drops a row's manifest ETag.
    pub fn forget_manifest(&self, manifest_uri: &str, table_id: &TableId) -> SyncResult<()> {
        self.store
            .remove(&EtagKey::resource(manifest_uri, table_id))?;
        Ok(())
    }

    /// Returns the `md5:<hex>` hash of a local file, hashing only on a miss.
    pub fn file_md5(
        &self,
        files: &dyn AttachmentStore,
        table_id: &TableId,
        row_id: &RowId,
        file: &LocalFile,
    ) -> SyncResult<String> {
        let key = EtagKey::file(file.uri.as_str(), table_id, file.last_modified);
        if let Some(hash) = self.store.get(&key)? {
            return Ok(hash);
        }

        trace!(uri = %file.uri, "hashing attachment");
        let hash = content_md5(&files.read(table_id, row_id, &file.filename)?);
        // entries for older modification times are dead
        self.store.remove_uri(&file.uri)?;
        self.store.put(key, hash.clone())?;
        Ok(hash)
    }

    /// Drops every entry belonging to a table.
    pub fn clear_table(&self, table_id: &TableId) -> SyncResult<usize> {
        Ok(self.store.remove_table(table_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_store::{MemoryAttachmentStore, MemoryEtagStore};

    #[test]
    fn push_pass_bypasses_manifest_cache() {
        let cache = EtagCache::new(Arc::new(MemoryEtagStore::new()));
        let t = TableId::from("t");
        cache
            .store_manifest_etag("m/r1", &t, "W/1".into())
            .unwrap();
        assert_eq!(
            cache.manifest_etag("m/r1", &t, false).unwrap().as_deref(),
            Some("W/1")
        );
        assert_eq!(cache.manifest_etag("m/r1", &t, true).unwrap(), None);

        cache.forget_manifest("m/r1", &t).unwrap();
        assert_eq!(cache.manifest_etag("m/r1", &t, false).unwrap(), None);
    }

    #[test]
    fn file_hash_is_cached_per_modification_time() {
        let etags = Arc::new(MemoryEtagStore::new());
        let cache = EtagCache::new(etags.clone());
        let files = MemoryAttachmentStore::new();
        let (t, r) = (TableId::from("t"), RowId::from("r"));

        files.write(&t, &r, "a.txt", b"abc").unwrap();
        let file = files.list(&t, &r).unwrap().remove(0);
        let hash = cache.file_md5(&files, &t, &r, &file).unwrap();
        assert_eq!(hash, "md5:900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(etags.entries().unwrap().len(), 1);

        // a rewrite bumps the modification time and replaces the entry
        files.write(&t, &r, "a.txt", b"abcd").unwrap();
        let file = files.list(&t, &r).unwrap().remove(0);
        let rehashed = cache.file_md5(&files, &t, &r, &file).unwrap();
        assert_ne!(rehashed, hash);
        assert_eq!(etags.entries().unwrap().len(), 1);

        assert_eq!(cache.clear_table(&t).unwrap(), 1);
    }
}
