//! Recommendations harvested from the catalog lists a resolved book is on.

use crate::catalog::model::CatalogList;
use crate::catalog::{CatalogError, CatalogService};
use crate::config;
use crate::db::{self, NewSuggestion, Pool, SuggestionUpsert};
use crate::model::{ExternalCacheEntry, LibraryRecord, ScanStatus, SuggestionReason};
use crate::payload;
use crate::resolver::{self, RecordResolution, ResolutionKind};
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSettings {
    pub lists_per_book: u32,
    pub items_per_list: u32,
    pub min_rating: Option<f64>,
    pub request_delay: Duration,
}

impl AggregateSettings {
    pub fn from_config(cfg: &config::Catalog) -> Self {
        Self {
            lists_per_book: cfg.lists_per_book,
            items_per_list: cfg.items_per_list,
            min_rating: cfg.min_rating,
            request_delay: cfg.request_delay(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub key: String,
    pub payload: Value,
    pub count: usize,
    pub reasons: Vec<SuggestionReason>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Neighbors {
    pub base_genres: Vec<String>,
    pub lists: Vec<CatalogList>,
    /// Sorted by how many lists they share with the base book.
    pub recommendations: Vec<Recommendation>,
    /// Set when the walk over lists stopped early on cancellation.
    pub cancelled: bool,
}

/// Collect books that share lists with `external_id`.
///
/// `base_book` is the catalog document of the local book when at hand; its
/// genres become the base genres, otherwise the local tags are used. The
/// request delay between lists is interrupted by `cancel`, which leaves the
/// result partial and marked `cancelled`.
#[instrument(skip_all, fields(local_id = record.id, external_id = external_id))]
pub async fn find_neighbors(
    catalog: &dyn CatalogService,
    record: &LibraryRecord,
    external_id: &str,
    base_book: Option<&Value>,
    settings: &AggregateSettings,
    cancel: &CancellationToken,
) -> Result<Neighbors, CatalogError> {
    let base_genres = match base_book.map(payload::genres) {
        Some(genres) if !genres.is_empty() => genres,
        _ => payload::genres_from_tags(&json!(record.tags)),
    };

    let mut lists = catalog
        .lists_containing(external_id, settings.lists_per_book)
        .await?;
    lists.truncate(settings.lists_per_book as usize);

    let self_key = format!("id:{external_id}");
    let mut order: Vec<String> = Vec::new();
    let mut by_key: HashMap<String, Recommendation> = HashMap::new();
    let mut cancelled = false;

    for (idx, list) in lists.iter().enumerate() {
        if idx > 0 && !resolver::pace(settings.request_delay, cancel).await {
            debug!(done = idx, "list walk cancelled");
            cancelled = true;
            break;
        }
        let books = catalog
            .list_books(&list.id, settings.items_per_list.saturating_add(1))
            .await?;
        let reason = SuggestionReason {
            list_id: list.id.clone(),
            list_name: list.name.clone(),
            local_id: record.id,
            local_title: record.title.clone(),
        };

        let mut taken = 0u32;
        for book in books {
            let Some(key) = payload::source_key(&book) else {
                continue;
            };
            if key == self_key {
                continue;
            }
            if taken >= settings.items_per_list {
                break;
            }
            taken += 1;

            if let (Some(min), Some(rating)) = (settings.min_rating, payload::rating(&book)) {
                if rating < min {
                    continue;
                }
            }

            match by_key.get_mut(&key) {
                Some(existing) => {
                    existing.count += 1;
                    if !existing.reasons.contains(&reason) {
                        existing.reasons.push(reason.clone());
                    }
                }
                None => {
                    order.push(key.clone());
                    by_key.insert(
                        key.clone(),
                        Recommendation {
                            key,
                            payload: book,
                            count: 1,
                            reasons: vec![reason.clone()],
                        },
                    );
                }
            }
        }
    }

    let mut recommendations: Vec<Recommendation> = order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect();
    recommendations.sort_by(|a, b| b.count.cmp(&a.count));

    debug!(
        lists = lists.len(),
        recommendations = recommendations.len(),
        "neighbors collected"
    );
    Ok(Neighbors {
        base_genres,
        lists,
        recommendations,
        cancelled,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub lists_found: usize,
    pub recommendations_found: usize,
    pub inserted: usize,
    pub merged: usize,
    pub skipped_owned: usize,
    /// Nothing was written; the entry keeps its previous state.
    pub cancelled: bool,
}

/// Persist the scan outcome of one resolved (or unresolved) record.
///
/// Status becomes `ok` when any list or recommendation was found,
/// `not_matched` after a clean lookup without a match (this round or a known
/// miss from an earlier one), and stays `pending` when the lookup failed or
/// the scan found nothing. Recommendations whose ISBN is already in
/// `library_isbns` are not stored. A scan cut short by `cancel` writes
/// nothing.
#[instrument(skip_all, fields(local_id = record.id))]
pub async fn scan_record(
    pool: &Pool,
    catalog: &dyn CatalogService,
    record: &LibraryRecord,
    resolution: &RecordResolution,
    library_isbns: &HashSet<String>,
    settings: &AggregateSettings,
    cancel: &CancellationToken,
) -> Result<ScanSummary> {
    let previous = db::get_scan_entry(pool, record.id).await?;
    let mut entry = ExternalCacheEntry {
        local_id: record.id,
        local_title: record.title.clone(),
        external_id: resolution.external_id.clone(),
        external_title: resolution
            .book
            .as_ref()
            .and_then(payload::title)
            .or_else(|| previous.as_ref().and_then(|p| p.external_title.clone())),
        lists_found: 0,
        recommendations_found: 0,
        checked_at: Some(Utc::now()),
        status: ScanStatus::Pending,
        base_genres: previous
            .as_ref()
            .map(|p| p.base_genres.clone())
            .unwrap_or_default(),
        lists: json!([]),
        recommendations: json!([]),
    };

    let Some(external_id) = resolution.external_id.as_deref() else {
        if matches!(
            resolution.kind,
            ResolutionKind::NotFound | ResolutionKind::AlreadyMapped
        ) {
            entry.status = ScanStatus::NotMatched;
        }
        db::save_scan_entry(pool, &entry).await?;
        return Ok(ScanSummary::default());
    };

    let neighbors = match find_neighbors(
        catalog,
        record,
        external_id,
        resolution.book.as_ref(),
        settings,
        cancel,
    )
    .await
    {
        Ok(neighbors) if neighbors.cancelled => {
            info!("scan cancelled; leaving entry untouched");
            return Ok(ScanSummary {
                cancelled: true,
                ..ScanSummary::default()
            });
        }
        Ok(neighbors) => neighbors,
        Err(err) => {
            warn!(?err, "neighbor lookup failed; leaving scan pending");
            db::save_scan_entry(pool, &entry).await?;
            return Ok(ScanSummary::default());
        }
    };

    let mut summary = ScanSummary {
        lists_found: neighbors.lists.len(),
        recommendations_found: neighbors.recommendations.len(),
        ..ScanSummary::default()
    };
    for rec in &neighbors.recommendations {
        let owned = payload::isbns(&rec.payload)
            .iter()
            .any(|isbn| library_isbns.contains(isbn));
        if owned {
            summary.skipped_owned += 1;
            continue;
        }
        let upsert = db::upsert_suggestion(
            pool,
            &NewSuggestion {
                source_key: rec.key.clone(),
                payload: rec.payload.clone(),
                base_genres: neighbors.base_genres.clone(),
                reasons: rec.reasons.clone(),
            },
        )
        .await?;
        match upsert {
            SuggestionUpsert::Inserted(_) => summary.inserted += 1,
            SuggestionUpsert::Merged(_) => summary.merged += 1,
        }
    }

    entry.lists_found = neighbors.lists.len() as i64;
    entry.recommendations_found = neighbors.recommendations.len() as i64;
    entry.base_genres = neighbors.base_genres.clone();
    entry.lists = serde_json::to_value(&neighbors.lists).unwrap_or_else(|_| json!([]));
    entry.recommendations = Value::Array(
        neighbors
            .recommendations
            .iter()
            .map(|r| json!({"key": r.key, "title": payload::title(&r.payload), "count": r.count}))
            .collect(),
    );
    entry.status = if entry.lists_found > 0 || entry.recommendations_found > 0 {
        ScanStatus::Ok
    } else {
        ScanStatus::Pending
    };
    db::save_scan_entry(pool, &entry).await?;

    info!(?summary, status = entry.status.as_str(), "book scanned");
    Ok(summary)
}

/// Normalized ISBNs of every mirrored book.
pub fn library_isbns(records: &[LibraryRecord]) -> HashSet<String> {
    records
        .iter()
        .filter_map(|r| r.isbn.as_deref())
        .filter_map(payload::normalize_isbn)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_isbns_are_normalized() {
        let mut a = LibraryRecord::new(1, "A");
        a.isbn = Some("978-0-441-17271-9".into());
        let b = LibraryRecord::new(2, "B");
        let set = library_isbns(&[a, b]);
        assert_eq!(set.len(), 1);
        assert!(set.contains("9780441172719"));
    }
}
