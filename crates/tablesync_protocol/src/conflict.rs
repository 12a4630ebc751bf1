//! Conflict resolution vocabulary.

use crate::row::RowMetadata;
use serde::{Deserialize, Serialize};

/// A resolution applied to a conflict pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Keep local values, adopt the server's row ETag and filter scope.
    TakeLocal,
    /// Keep local values plus a caller-chosen subset of server values.
    TakeLocalPlusServerDeltas,
    /// Take the server's version (or its deletion).
    TakeServer,
}

impl ConflictResolution {
    /// Converts to a code.
    pub fn to_code(&self) -> u8 {
        match self {
            ConflictResolution::TakeLocal => 1,
            ConflictResolution::TakeLocalPlusServerDeltas => 2,
            ConflictResolution::TakeServer => 3,
        }
    }

    /// Converts from a code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ConflictResolution::TakeLocal),
            2 => Some(ConflictResolution::TakeLocalPlusServerDeltas),
            3 => Some(ConflictResolution::TakeServer),
            _ => None,
        }
    }
}

/// Policy for resolving conflicts as soon as they are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Leave conflict pairs for a human.
    #[default]
    Manual,
    /// Server always wins.
    ServerWins,
    /// Client always wins.
    ClientWins,
    /// Newer savepoint timestamp wins; ties go to the server.
    LastWriteWins,
}

impl ConflictPolicy {
    /// Returns true if this policy automatically resolves conflicts.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictPolicy::Manual)
    }

    /// Picks a resolution for a pair, or `None` under `Manual`.
    pub fn resolve(&self, local: &RowMetadata, server: &RowMetadata) -> Option<ConflictResolution> {
        match self {
            ConflictPolicy::Manual => None,
            ConflictPolicy::ServerWins => Some(ConflictResolution::TakeServer),
            ConflictPolicy::ClientWins => Some(ConflictResolution::TakeLocal),
            ConflictPolicy::LastWriteWins => {
                if local.savepoint_timestamp > server.savepoint_timestamp {
                    Some(ConflictResolution::TakeLocal)
                } else {
                    Some(ConflictResolution::TakeServer)
                }
            }
        }
    }
}
