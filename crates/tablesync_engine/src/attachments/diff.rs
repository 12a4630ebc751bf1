//! Local files vs. server manifest.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tablesync_protocol::RowManifest;
use tablesync_store::LocalFile;

/// A local file with its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedFile {
    /// The file.
    pub file: LocalFile,
    /// `md5:<hex>` of its contents.
    pub md5: String,
}

/// Transfers needed to reconcile a row's files with its manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttachmentDiff {
    /// Local files the server lacks, ordered by name.
    pub uploads: Vec<String>,
    /// Server files missing or different locally, ordered by name.
    pub downloads: Vec<String>,
    /// Referenced files that exist on neither side.
    pub missing: Vec<String>,
}

impl AttachmentDiff {
    /// Returns true if nothing needs transferring.
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty() && self.downloads.is_empty()
    }
}

/// Diffs local files against a manifest. The server wins on content
/// mismatch.
pub fn diff_attachments(
    local: &[HashedFile],
    manifest: &RowManifest,
    referenced: &[String],
) -> AttachmentDiff {
    let mut unaccounted: BTreeMap<&str, &HashedFile> = local
        .iter()
        .map(|f| (f.file.filename.as_str(), f))
        .collect();
    let mut on_server = BTreeSet::new();
    let mut downloads = BTreeSet::new();

    for entry in &manifest.entries {
        on_server.insert(entry.filename.as_str());
        match unaccounted.remove(entry.filename.as_str()) {
            Some(file) if file.md5 == entry.md5hash => {}
            _ => {
                downloads.insert(entry.filename.clone());
            }
        }
    }

    let present: BTreeSet<&str> = local.iter().map(|f| f.file.filename.as_str()).collect();
    let missing = referenced
        .iter()
        .filter(|name| !present.contains(name.as_str()) && !on_server.contains(name.as_str()))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    AttachmentDiff {
        uploads: unaccounted.into_keys().map(str::to_string).collect(),
        downloads: downloads.into_iter().collect(),
        missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_protocol::{content_md5, ManifestEntry};

    fn local(name: &str, contents: &[u8]) -> HashedFile {
        HashedFile {
            file: LocalFile {
                filename: name.into(),
                uri: format!("mem://{name}"),
                len: contents.len() as u64,
                last_modified: 1,
            },
            md5: content_md5(contents),
        }
    }

    fn manifest(entries: &[(&str, &[u8])]) -> RowManifest {
        RowManifest {
            entries: entries
                .iter()
                .map(|(name, contents)| ManifestEntry {
                    filename: name.to_string(),
                    md5hash: content_md5(contents),
                    download_url: None,
                    content_length: contents.len() as u64,
                })
                .collect(),
        }
    }

    #[test]
    fn matching_file_uploads_only_the_new_one() {
        let files = [local("a", b"A"), local("b", b"B")];
        let diff = diff_attachments(&files, &manifest(&[("a", b"A")]), &[]);
        assert_eq!(diff.uploads, vec!["b".to_string()]);
        assert!(diff.downloads.is_empty());
    }

    #[test]
    fn mismatched_content_downloads() {
        let files = [local("a", b"A-local"), local("b", b"B")];
        let diff = diff_attachments(&files, &manifest(&[("a", b"A")]), &[]);
        assert_eq!(diff.uploads, vec!["b".to_string()]);
        assert_eq!(diff.downloads, vec!["a".to_string()]);
    }

    #[test]
    fn server_only_files_download_and_unknown_refs_are_missing() {
        let diff = diff_attachments(
            &[],
            &manifest(&[("s.jpg", b"S")]),
            &["s.jpg".into(), "ghost.jpg".into()],
        );
        assert_eq!(diff.downloads, vec!["s.jpg".to_string()]);
        assert_eq!(diff.missing, vec!["ghost.jpg".to_string()]);
        assert!(!diff.is_empty());
    }
}
