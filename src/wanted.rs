//! Wanted books: added by hand or mirrored from the catalog's want-to-read
//! shelf, pruned once the book shows up in the local library.

use crate::catalog::CatalogService;
use crate::db::{self, Pool};
use crate::model::{WantedEntry, WantedSource};
use crate::payload;
use anyhow::{bail, Result};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MirrorStats {
    pub fetched: usize,
    pub inserted: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneSummary {
    pub matched: usize,
    pub local_deleted: usize,
    pub external_removed: usize,
    pub suggestions_deleted: u64,
    pub errors: usize,
}

pub async fn add_manual(pool: &Pool, key: &str, payload: &Value) -> Result<()> {
    let key = key.trim();
    if key.is_empty() {
        bail!("wanted key must be non-empty");
    }
    db::upsert_wanted(pool, key, payload, WantedSource::Manual).await
}

pub async fn remove(pool: &Pool, key: &str) -> Result<bool> {
    db::delete_wanted(pool, key).await
}

pub async fn list(pool: &Pool) -> Result<Vec<WantedEntry>> {
    db::list_wanted(pool).await
}

/// Replace the externally sourced entries with the catalog's current
/// want-to-read shelf.
#[instrument(skip_all)]
pub async fn mirror_want_to_read(pool: &Pool, catalog: &dyn CatalogService) -> Result<MirrorStats> {
    let books = catalog.want_to_read().await?;
    let fetched = books.len();
    let mut seen = HashSet::new();
    let entries: Vec<(String, Value)> = books
        .into_iter()
        .filter_map(|book| payload::source_key(&book).map(|key| (key, book)))
        .filter(|(key, _)| seen.insert(key.clone()))
        .collect();
    let replaced = db::replace_external_wanted(pool, &entries).await?;
    let stats = MirrorStats {
        fetched,
        inserted: replaced.inserted,
        removed: replaced.removed,
    };
    info!(?stats, "want-to-read mirrored");
    Ok(stats)
}

#[derive(Debug, Default)]
struct CascadeResult {
    local_deleted: bool,
    external_removed: bool,
    suggestions_deleted: u64,
    errors: usize,
}

async fn cascade(
    pool: &Pool,
    catalog: &dyn CatalogService,
    entry: &WantedEntry,
    suggestion_keys: &[String],
) -> CascadeResult {
    let external = async {
        match payload::external_id(&entry.payload) {
            Some(id) => match catalog.remove_want_to_read(&id).await {
                Ok(()) => Ok(true),
                Err(err) => Err(anyhow::Error::from(err)),
            },
            None => Ok(false),
        }
    };
    let local = db::delete_wanted(pool, &entry.key);
    let suggestions = async {
        let mut deleted = 0;
        for key in suggestion_keys {
            deleted += db::delete_suggestions_by_key(pool, key).await?;
        }
        Ok::<u64, anyhow::Error>(deleted)
    };

    let (external, local, suggestions) = futures::join!(external, local, suggestions);
    let mut result = CascadeResult::default();
    match external {
        Ok(removed) => result.external_removed = removed,
        Err(err) => {
            warn!(?err, key = %entry.key, "external want-to-read removal failed");
            result.errors += 1;
        }
    }
    match local {
        Ok(deleted) => result.local_deleted = deleted,
        Err(err) => {
            warn!(?err, key = %entry.key, "wanted entry delete failed");
            result.errors += 1;
        }
    }
    match suggestions {
        Ok(n) => result.suggestions_deleted = n,
        Err(err) => {
            warn!(?err, key = %entry.key, "suggestion cleanup failed");
            result.errors += 1;
        }
    }
    result
}

/// Drop wanted entries whose ISBN is now owned, along with their catalog
/// shelf entry and any suggestion for the same book. Each step is
/// best-effort; failures are counted, never returned.
#[instrument(skip_all, fields(isbns = isbns.len()))]
pub async fn prune_for_isbns(
    pool: &Pool,
    catalog: &dyn CatalogService,
    isbns: &HashSet<String>,
) -> PruneSummary {
    let mut summary = PruneSummary::default();
    if isbns.is_empty() {
        return summary;
    }
    let entries = match db::list_wanted(pool).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(?err, "failed to load wanted entries for pruning");
            summary.errors += 1;
            return summary;
        }
    };
    let owned = |value: &Value| payload::isbns(value).iter().any(|i| isbns.contains(i));
    let matched: Vec<WantedEntry> = entries.into_iter().filter(|e| owned(&e.payload)).collect();
    if matched.is_empty() {
        return summary;
    }

    let owned_suggestions: Vec<(String, Vec<String>)> = match db::list_suggestions(pool, true).await {
        Ok(all) => all
            .into_iter()
            .map(|s| (s.source_key, payload::isbns(&s.payload)))
            .filter(|(_, found)| found.iter().any(|i| isbns.contains(i)))
            .collect(),
        Err(err) => {
            warn!(?err, "failed to load suggestions for pruning");
            summary.errors += 1;
            Vec::new()
        }
    };

    // Suggestions for the same book are found by shared ISBN as well as by key.
    let per_entry_keys: Vec<Vec<String>> = matched
        .iter()
        .map(|entry| {
            let entry_isbns: HashSet<String> = payload::isbns(&entry.payload).into_iter().collect();
            let mut keys = vec![entry.key.clone()];
            for (key, found) in &owned_suggestions {
                if !keys.contains(key) && found.iter().any(|i| entry_isbns.contains(i)) {
                    keys.push(key.clone());
                }
            }
            keys
        })
        .collect();

    let results = join_all(
        matched
            .iter()
            .zip(per_entry_keys.iter())
            .map(|(entry, keys)| cascade(pool, catalog, entry, keys)),
    )
    .await;

    summary.matched = matched.len();
    for result in results {
        summary.local_deleted += usize::from(result.local_deleted);
        summary.external_removed += usize::from(result.external_removed);
        summary.suggestions_deleted += result.suggestions_deleted;
        summary.errors += result.errors;
    }
    info!(?summary, "wanted entries pruned");
    summary
}
