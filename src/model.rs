use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scan state of a library book against the external catalog.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Ok,
    NotMatched,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Ok => "ok",
            ScanStatus::NotMatched => "not_matched",
        }
    }

    pub fn parse_state(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ScanStatus::Pending),
            "ok" => Some(ScanStatus::Ok),
            "not_matched" => Some(ScanStatus::NotMatched),
            _ => None,
        }
    }
}

/// Where a wanted entry came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WantedSource {
    Manual,
    External,
}

impl WantedSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            WantedSource::Manual => "manual",
            WantedSource::External => "external",
        }
    }

    pub fn parse_source(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(WantedSource::Manual),
            "external" => Some(WantedSource::External),
            _ => None,
        }
    }
}

/// A book as mirrored from the local library.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibraryRecord {
    pub id: i64,
    pub title: String,
    pub authors: Vec<String>,
    pub isbn: Option<String>,
    pub rating: Option<f64>,
    pub added_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub relative_path: Option<String>,
    pub has_cover: bool,
    pub formats: Vec<String>,
    pub tags: Vec<String>,
    pub publisher: Option<String>,
    pub series: Option<String>,
    pub size_mb: Option<f64>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub external_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl LibraryRecord {
    /// Minimal record, mostly useful for tests and fixtures.
    pub fn new(id: i64, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            authors: Vec::new(),
            isbn: None,
            rating: None,
            added_at: None,
            published_at: None,
            relative_path: None,
            has_cover: false,
            formats: Vec::new(),
            tags: Vec::new(),
            publisher: None,
            series: None,
            size_mb: None,
            description: None,
            cover_url: None,
            external_id: None,
            updated_at: Utc::now(),
        }
    }
}

/// Local id to external id, `None` meaning "looked up, not found".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityMapping {
    pub local_id: i64,
    pub external_id: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl IdentityMapping {
    /// True when the stored id looks like a catalog id we can trust without re-querying.
    pub fn is_resolved(&self) -> bool {
        self.external_id
            .as_deref()
            .map(is_numeric_id)
            .unwrap_or(false)
    }

    /// A completed lookup that found nothing. Mappings carrying an error are
    /// not known misses and stay eligible for another attempt.
    pub fn is_known_miss(&self) -> bool {
        self.external_id.is_none() && self.last_error.is_none()
    }
}

pub fn is_numeric_id(value: &str) -> bool {
    let trimmed = value.trim();
    !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit())
}

/// Per-book scan state against the external catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalCacheEntry {
    pub local_id: i64,
    pub local_title: String,
    pub external_id: Option<String>,
    pub external_title: Option<String>,
    pub lists_found: i64,
    pub recommendations_found: i64,
    pub checked_at: Option<DateTime<Utc>>,
    pub status: ScanStatus,
    pub base_genres: Vec<String>,
    pub lists: Value,
    pub recommendations: Value,
}

/// Provenance of a suggestion: which list surfaced it, for which local book.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuggestionReason {
    pub list_id: String,
    pub list_name: String,
    pub local_id: i64,
    pub local_title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuggestedCandidate {
    pub id: i64,
    pub payload: Value,
    pub source_key: String,
    pub base_genres: Vec<String>,
    pub reasons: Vec<SuggestionReason>,
    pub hidden: bool,
    pub score: Option<i64>,
    pub rank: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WantedEntry {
    pub key: String,
    pub payload: Value,
    pub source: WantedSource,
    pub created_at: DateTime<Utc>,
}
