//! Attachments command implementation.

use std::path::Path;
use std::sync::Arc;
use tablesync_engine::attachments::{plan_row, HashedFile};
use tablesync_engine::{EtagCache, TransferPlan};
use tablesync_protocol::{RowId, RowManifest, TableId};
use tablesync_store::{AttachmentStore, DirAttachmentStore, MemoryEtagStore};
use tracing::debug;

/// Which row to plan and how.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    /// Table id.
    pub table: TableId,
    /// Row id.
    pub row: RowId,
    /// File names the row references.
    pub refs: Vec<String>,
    /// Upload byte cap per request.
    pub cap: u64,
}

/// Hashes the row's files under `root` and plans against `manifest`.
pub fn compute(
    root: &Path,
    manifest: &RowManifest,
    request: &PlanRequest,
) -> Result<TransferPlan, Box<dyn std::error::Error>> {
    let files = DirAttachmentStore::new(root);
    let cache = EtagCache::new(Arc::new(MemoryEtagStore::new()));
    let local = files
        .list(&request.table, &request.row)?
        .into_iter()
        .map(|file| {
            let md5 = cache.file_md5(&files, &request.table, &request.row, &file)?;
            Ok(HashedFile { file, md5 })
        })
        .collect::<Result<Vec<_>, tablesync_engine::SyncError>>()?;
    debug!(files = local.len(), entries = manifest.entries.len(), "hashed local files");
    Ok(plan_row(&local, manifest, &request.refs, request.cap))
}

/// Runs the attachments command.
pub fn run(
    root: &Path,
    manifest_path: &Path,
    request: &PlanRequest,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = RowManifest::decode(&std::fs::read(manifest_path)?)?;
    let plan = compute(root, &manifest, request)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        _ => {
            println!("Attachment plan for {}/{}", request.table, request.row);
            println!();
            println!("Downloads: {}", list(&plan.diff.downloads));
            println!("Uploads:   {}", list(&plan.diff.uploads));
            println!("Missing:   {}", list(&plan.diff.missing));
            for (i, batch) in plan.upload_batches.iter().enumerate() {
                println!("  request {}: {}", i + 1, list(batch));
            }
        }
    }

    Ok(())
}

fn list(names: &[String]) -> String {
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(", ")
    }
}
