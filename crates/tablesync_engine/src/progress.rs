//! Progress reporting.

use crate::outcome::TablePhase;
use tablesync_protocol::TableId;

/// Receives progress updates between the major steps of a table sync.
///
/// Called from table tasks, possibly concurrently for different tables.
pub trait SyncProgress: Send + Sync {
    /// Reports that `table` is in `phase`, roughly `percent` complete.
    fn on_progress(&self, table: &TableId, phase: TablePhase, percent: u8);
}

/// Discards progress updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl SyncProgress for NoProgress {
    fn on_progress(&self, _table: &TableId, _phase: TablePhase, _percent: u8) {}
}

impl<F> SyncProgress for F
where
    F: Fn(&TableId, TablePhase, u8) + Send + Sync,
{
    fn on_progress(&self, table: &TableId, phase: TablePhase, percent: u8) {
        self(table, phase, percent)
    }
}

/// Percentage inside a phase's band, given `done` of `total` steps.
pub(crate) fn percent_within(phase: TablePhase, done: usize, total: usize) -> u8 {
    let start = u64::from(phase.base_percent());
    let end = match phase {
        TablePhase::Working => TablePhase::SchemaCheck.base_percent(),
        TablePhase::SchemaCheck => TablePhase::Pull.base_percent(),
        TablePhase::Pull | TablePhase::ClassifyApply => TablePhase::Push.base_percent(),
        TablePhase::Push => TablePhase::Attachments.base_percent(),
        TablePhase::Attachments => 99,
        TablePhase::Done => 100,
    };
    let end = u64::from(end);
    if total == 0 || done >= total {
        return u8::try_from(end).unwrap_or(100);
    }
    let span = end.saturating_sub(start);
    let value = start + span * done as u64 / total as u64;
    u8::try_from(value).unwrap_or(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn closures_receive_updates() {
        let seen = Mutex::new(Vec::new());
        let listener = |table: &TableId, phase: TablePhase, percent: u8| {
            seen.lock().push((table.to_string(), phase, percent));
        };
        listener.on_progress(&"t".into(), TablePhase::Push, 50);
        assert_eq!(seen.lock().as_slice(), &[("t".to_string(), TablePhase::Push, 50)]);
    }

    #[test]
    fn percent_stays_in_band() {
        assert_eq!(percent_within(TablePhase::Push, 0, 4), 50);
        assert_eq!(percent_within(TablePhase::Push, 2, 4), 62);
        assert_eq!(percent_within(TablePhase::Push, 4, 4), 75);
        assert_eq!(percent_within(TablePhase::Attachments, 0, 0), 99);
    }
}
