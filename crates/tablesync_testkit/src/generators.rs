//! Property-based test generators using proptest.
//!
//! Row ids are drawn from a small pool so that local rows and server pages
//! overlap often enough to exercise every reconciler branch.

use proptest::prelude::*;
use std::collections::BTreeMap;
use tablesync_protocol::{ConflictType, FilePart, Row, RowChange, RowId, SyncState};

/// Strategy for row ids from a pool of eight.
pub fn row_id_strategy() -> impl Strategy<Value = RowId> {
    (0u8..8).prop_map(|n| RowId::new(format!("row-{n}")))
}

/// Strategy for row ETags from a pool of three.
pub fn etag_strategy() -> impl Strategy<Value = String> {
    (0u8..3).prop_map(|n| format!("e{n}"))
}

/// Strategy for short name values.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["Ada", "Grace", "Linus", "Barbara"]).prop_map(str::to_string)
}

/// Strategy for states a single (non-conflict) local row can be in.
pub fn local_state_strategy() -> impl Strategy<Value = SyncState> {
    prop::sample::select(
        SyncState::ALL
            .into_iter()
            .filter(|s| *s != SyncState::InConflict)
            .collect::<Vec<_>>(),
    )
}

/// Strategy for one server change.
pub fn row_change_strategy() -> impl Strategy<Value = RowChange> {
    prop_oneof![
        4 => (row_id_strategy(), etag_strategy(), name_strategy())
            .prop_map(|(id, etag, name)| RowChange::update(id, etag).with_value("name", name)),
        1 => (row_id_strategy(), etag_strategy())
            .prop_map(|(id, etag)| RowChange::deletion(id, etag)),
    ]
}

/// Strategy for one local row.
pub fn local_row_strategy() -> impl Strategy<Value = Row> {
    (
        row_id_strategy(),
        local_state_strategy(),
        etag_strategy(),
        name_strategy(),
    )
        .prop_map(|(id, state, etag, name)| {
            let row = Row::new(id, state).with_value("name", name);
            if state == SyncState::NewRow {
                row
            } else {
                row.with_etag(etag)
            }
        })
}

/// Strategy for a local snapshot with distinct row ids.
pub fn local_rows_strategy(max_rows: usize) -> impl Strategy<Value = Vec<Row>> {
    prop::collection::vec(local_row_strategy(), 0..max_rows).prop_map(|rows| {
        let unique: BTreeMap<RowId, Row> =
            rows.into_iter().map(|row| (row.row_id.clone(), row)).collect();
        unique.into_values().collect()
    })
}

/// Strategy for a conflict pair: a tagged local row and its server copy.
pub fn conflict_pair_strategy() -> impl Strategy<Value = [Row; 2]> {
    (
        row_id_strategy(),
        etag_strategy(),
        name_strategy(),
        name_strategy(),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(id, etag, mine, theirs, local_deleted, server_deleted)| {
            let mut local = Row::new(id.clone(), SyncState::InConflict)
                .with_etag("e0")
                .with_value("name", mine);
            local.conflict_type = Some(ConflictType::for_local(local_deleted));
            let mut server = Row::new(id, SyncState::InConflict)
                .with_etag(etag)
                .with_value("name", theirs);
            server.conflict_type = Some(ConflictType::for_server(server_deleted));
            [local, server]
        })
}

/// Strategy for a local snapshot mixing every local state with conflict
/// pairs. Each row id appears once, or twice when it is a pair.
pub fn mixed_local_rows_strategy(max_rows: usize) -> impl Strategy<Value = Vec<Row>> {
    let entry = prop_oneof![
        3 => local_row_strategy().prop_map(|row| vec![row]),
        1 => conflict_pair_strategy().prop_map(Vec::from),
    ];
    prop::collection::vec(entry, 0..max_rows).prop_map(|entries| {
        let unique: BTreeMap<RowId, Vec<Row>> = entries
            .into_iter()
            .map(|rows| (rows[0].row_id.clone(), rows))
            .collect();
        unique.into_values().flatten().collect()
    })
}

/// Strategy for a changeset page with distinct row ids.
pub fn changeset_rows_strategy(max_rows: usize) -> impl Strategy<Value = Vec<RowChange>> {
    prop::collection::vec(row_change_strategy(), 0..max_rows).prop_map(|changes| {
        let unique: BTreeMap<RowId, RowChange> = changes
            .into_iter()
            .map(|change| (change.row_id.clone(), change))
            .collect();
        unique.into_values().collect()
    })
}

/// Strategy for an attachment file with up to `max_len` bytes.
pub fn file_part_strategy(max_len: usize) -> impl Strategy<Value = FilePart> {
    (
        prop::string::string_regex("[a-z]{1,8}\\.(jpg|txt|bin)").expect("Invalid regex"),
        prop::collection::vec(any::<u8>(), 0..max_len),
    )
        .prop_map(|(name, contents)| FilePart::new(name, contents))
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
