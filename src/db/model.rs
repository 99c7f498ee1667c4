//! Database view models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::SuggestionReason;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Result of swapping the mirror to a new snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaceOutcome {
    pub added: Vec<i64>,
    pub removed: Vec<i64>,
    pub total: i64,
    pub snapshot_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MirrorStats {
    pub count: i64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Changes applied to the scan-state cache after a mirror replace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReconcile {
    pub created: usize,
    pub removed: usize,
    pub retitled: usize,
}

/// A recommendation about to be stored as a suggestion.
#[derive(Debug, Clone)]
pub struct NewSuggestion {
    pub source_key: String,
    pub payload: Value,
    pub base_genres: Vec<String>,
    pub reasons: Vec<SuggestionReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestionUpsert {
    Inserted(i64),
    /// An existing row matched by source key or payload; reasons were merged into it.
    Merged(i64),
}

impl SuggestionUpsert {
    pub fn id(&self) -> i64 {
        match self {
            SuggestionUpsert::Inserted(id) | SuggestionUpsert::Merged(id) => *id,
        }
    }
}

/// Counts from replacing the externally mirrored wanted entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WantedReplace {
    pub inserted: usize,
    pub removed: usize,
}
