//! Classify command implementation.

use serde::Serialize;
use std::path::Path;
use tablesync_engine::{classify, Classification};
use tablesync_protocol::{ChangesetPage, Row};
use tracing::debug;

/// Classification result with the page's paging fields.
#[derive(Debug, Serialize)]
pub struct ClassifyResult {
    /// Data ETag the page was cut at.
    pub data_etag: String,
    /// Whether more pages follow.
    pub has_more: bool,
    /// The four action lists.
    pub plan: Classification,
}

/// Classifies `page` against `local`.
pub fn compute(local: &[Row], page: &ChangesetPage) -> ClassifyResult {
    ClassifyResult {
        data_etag: page.data_etag.clone(),
        has_more: page.has_more,
        plan: classify(local, &page.rows),
    }
}

/// Runs the classify command.
pub fn run(local_path: &Path, page_path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let local: Vec<Row> = serde_json::from_slice(&std::fs::read(local_path)?)?;
    let page = ChangesetPage::decode(&std::fs::read(page_path)?)?;
    debug!(local = local.len(), changes = page.rows.len(), "classifying page");
    let result = compute(&local, &page);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &ClassifyResult) {
    println!("Changeset Classification");
    println!("========================");
    println!();
    println!("Data ETag: {}", result.data_etag);
    println!("More pages: {}", if result.has_more { "yes" } else { "no" });
    println!();
    println!("Insert ({}):", result.plan.to_insert.len());
    for change in &result.plan.to_insert {
        println!("  {}", change.row_id);
    }
    println!("Update ({}):", result.plan.to_update.len());
    for update in &result.plan.to_update {
        println!("  {} ({:?})", update.change.row_id, update.kind);
    }
    println!("Delete ({}):", result.plan.to_delete.len());
    for row_id in &result.plan.to_delete {
        println!("  {row_id}");
    }
    println!("Conflict ({}):", result.plan.to_conflict.len());
    for case in &result.plan.to_conflict {
        println!("  {} ({:?})", case.change.row_id, case.local_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_protocol::{RowChange, SyncState};

    #[test]
    fn snapshot_files_round_trip_through_json() {
        let local = vec![Row::new("a", SyncState::Changed).with_etag("e0")];
        let bytes = serde_json::to_vec(&local).unwrap();
        let parsed: Vec<Row> = serde_json::from_slice(&bytes).unwrap();

        let page = ChangesetPage::last(
            vec![
                RowChange::update("a", "e1").with_value("name", "x"),
                RowChange::update("b", "e1"),
            ],
            "d9",
        );
        let result = compute(&parsed, &page);
        assert_eq!(result.data_etag, "d9");
        assert_eq!(result.plan.to_insert.len(), 1);
        assert_eq!(result.plan.to_conflict.len(), 1);
    }
}
