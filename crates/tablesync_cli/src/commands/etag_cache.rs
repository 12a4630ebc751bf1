//! ETag cache dump command implementation.

use serde::Serialize;
use std::path::Path;
use tablesync_store::FileEtagStore;
use tracing::debug;

/// One cache entry for output.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct EtagEntryInfo {
    /// Resource or file URI.
    pub uri: String,
    /// Owning table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Modification time the hash was taken at (file entries only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
    /// Cached ETag or content hash.
    pub etag: String,
}

/// Loads the cache at `path`, keeping entries of `table` if given.
pub fn load(path: &Path, table: Option<&str>) -> Result<Vec<EtagEntryInfo>, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No ETag cache found at {:?}", path).into());
    }
    Ok(FileEtagStore::load(path)?
        .into_iter()
        .filter(|(key, _)| {
            table.map_or(true, |t| key.table_id.as_ref().map(|id| id.as_str()) == Some(t))
        })
        .map(|(key, etag)| EtagEntryInfo {
            uri: key.uri,
            table: key.table_id.map(|id| id.to_string()),
            last_modified: key.last_modified,
            etag,
        })
        .collect())
}

/// Runs the etag-cache command.
pub fn run(path: &Path, table: Option<&str>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let entries = load(path, table)?;
    debug!(path = %path.display(), entries = entries.len(), "loaded ETag cache");

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            println!("ETag cache: {} entries", entries.len());
            for entry in &entries {
                let kind = if entry.last_modified.is_some() { "file" } else { "resource" };
                println!(
                    "  [{kind}] {} {} = {}",
                    entry.table.as_deref().unwrap_or("-"),
                    entry.uri,
                    entry.etag
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_protocol::TableId;
    use tablesync_store::{EtagKey, EtagStore};

    #[test]
    fn filters_by_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etags.cbor");
        let store = FileEtagStore::open(&path).unwrap();
        store
            .put(EtagKey::resource("m/a", &TableId::from("visits")), "\"m1\"".into())
            .unwrap();
        store
            .put(EtagKey::file("f/a.jpg", &TableId::from("notes"), 42), "md5:00".into())
            .unwrap();

        assert_eq!(load(&path, None).unwrap().len(), 2);
        let visits = load(&path, Some("visits")).unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].etag, "\"m1\"");
        assert!(load(&dir.path().join("missing"), None).is_err());
    }
}
