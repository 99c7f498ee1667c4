use super::model::{
    MirrorStats, NewSuggestion, ReplaceOutcome, ScanReconcile, SuggestionUpsert, WantedReplace,
};
use super::schema;
use crate::model::{
    ExternalCacheEntry, IdentityMapping, LibraryRecord, ScanStatus, SuggestedCandidate,
    SuggestionReason, WantedEntry, WantedSource,
};
use crate::payload;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

pub type Pool = SqlitePool;

const LAST_SNAPSHOT_KEY: &str = "last_snapshot_at";

/// Open the store. In-memory URLs get a single long-lived connection so every
/// caller sees the same database.
pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let url = expand_sqlite_url(database_url);
    let in_memory = url.contains(":memory:") || url.contains("mode=memory");
    let options = SqliteConnectOptions::from_str(&url)
        .with_context(|| format!("invalid database url {database_url}"))?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(10));
    let options = if in_memory {
        options
    } else {
        options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
    };

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(4)
    };
    let pool = pool_options
        .connect_with(options)
        .await
        .context("failed to open sqlite store")?;
    Ok(pool)
}

/// Expand a leading `~/` in file-backed SQLite URLs and create the parent
/// directory. Other URLs pass through untouched.
fn expand_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    schema::migrate(pool).await
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Decode a stored JSON blob, degrading to the default on malformed data.
fn from_json<T: DeserializeOwned + Default>(raw: Option<String>) -> T {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Mirror: library_books
// ---------------------------------------------------------------------------

fn record_from_row(row: &SqliteRow) -> Result<LibraryRecord> {
    Ok(LibraryRecord {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        authors: from_json(row.try_get("authors_json")?),
        isbn: row.try_get("isbn")?,
        rating: row.try_get("rating")?,
        added_at: row.try_get("added_at")?,
        published_at: row.try_get("published_at")?,
        relative_path: row.try_get("relative_path")?,
        has_cover: row.try_get("has_cover")?,
        formats: from_json(row.try_get("formats_json")?),
        tags: from_json(row.try_get("tags_json")?),
        publisher: row.try_get("publisher")?,
        series: row.try_get("series")?,
        size_mb: row.try_get("size_mb")?,
        description: row.try_get("description")?,
        cover_url: row.try_get("cover_url")?,
        external_id: row.try_get("external_id")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn insert_record_tx(
    tx: &mut Transaction<'_, Sqlite>,
    record: &LibraryRecord,
    external_id: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO library_books (id, title, authors_json, isbn, rating, added_at, published_at, \
         relative_path, has_cover, formats_json, tags_json, publisher, series, size_mb, description, \
         cover_url, external_id, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(record.id)
    .bind(&record.title)
    .bind(to_json(&record.authors))
    .bind(&record.isbn)
    .bind(record.rating)
    .bind(record.added_at)
    .bind(record.published_at)
    .bind(&record.relative_path)
    .bind(record.has_cover)
    .bind(to_json(&record.formats))
    .bind(to_json(&record.tags))
    .bind(&record.publisher)
    .bind(&record.series)
    .bind(record.size_mb)
    .bind(&record.description)
    .bind(&record.cover_url)
    .bind(external_id)
    .bind(record.updated_at)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to insert library book {}", record.id))?;
    Ok(())
}

/// Swap the whole mirror to `records` in one transaction.
///
/// An external id already resolved for a book that is still present survives
/// the swap when the new snapshot doesn't carry one. Any failure leaves the
/// previous mirror untouched.
#[instrument(skip_all, fields(records = records.len()))]
pub async fn replace_all(pool: &Pool, records: &[LibraryRecord]) -> Result<ReplaceOutcome> {
    let snapshot_at = Utc::now();
    let mut tx = pool.begin().await?;

    let previous: Vec<(i64, Option<String>)> =
        sqlx::query_as("SELECT id, external_id FROM library_books")
            .fetch_all(&mut *tx)
            .await?;
    let mapped: Vec<(i64, String)> = sqlx::query_as(
        "SELECT local_id, external_id FROM identity_mappings WHERE external_id IS NOT NULL",
    )
    .fetch_all(&mut *tx)
    .await?;

    let mut carried: HashMap<i64, String> = previous
        .iter()
        .filter_map(|(id, ext)| {
            ext.as_ref()
                .filter(|e| !e.trim().is_empty())
                .map(|e| (*id, e.clone()))
        })
        .collect();
    carried.extend(mapped);

    let old_ids: HashSet<i64> = previous.iter().map(|(id, _)| *id).collect();

    sqlx::query("DELETE FROM library_books")
        .execute(&mut *tx)
        .await?;
    for record in records {
        let external_id = record
            .external_id
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .or_else(|| carried.get(&record.id).map(String::as_str));
        insert_record_tx(&mut tx, record, external_id).await?;
    }

    sqlx::query(
        "INSERT INTO mirror_meta (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(LAST_SNAPSHOT_KEY)
    .bind(snapshot_at.to_rfc3339())
    .execute(&mut *tx)
    .await?;

    tx.commit().await.context("mirror replace commit failed")?;

    let new_ids: HashSet<i64> = records.iter().map(|r| r.id).collect();
    let mut added: Vec<i64> = new_ids.difference(&old_ids).copied().collect();
    let mut removed: Vec<i64> = old_ids.difference(&new_ids).copied().collect();
    added.sort_unstable();
    removed.sort_unstable();

    info!(
        total = records.len(),
        added = added.len(),
        removed = removed.len(),
        "mirror replaced"
    );
    Ok(ReplaceOutcome {
        added,
        removed,
        total: records.len() as i64,
        snapshot_at: Some(snapshot_at),
    })
}

/// Mirror snapshot, newest additions first. `limit <= 0` returns everything.
#[instrument(skip_all)]
pub async fn get_all(pool: &Pool, limit: i64) -> Result<Vec<LibraryRecord>> {
    let base = "SELECT * FROM library_books ORDER BY COALESCE(added_at, updated_at) DESC, id DESC";
    let rows = if limit > 0 {
        sqlx::query(&format!("{base} LIMIT ?"))
            .bind(limit)
            .fetch_all(pool)
            .await?
    } else {
        sqlx::query(base).fetch_all(pool).await?
    };
    rows.iter().map(record_from_row).collect()
}

pub async fn get_record(pool: &Pool, id: i64) -> Result<Option<LibraryRecord>> {
    let row = sqlx::query("SELECT * FROM library_books WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(record_from_row).transpose()
}

pub async fn get_stats(pool: &Pool) -> Result<MirrorStats> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM library_books")
        .fetch_one(pool)
        .await?;
    let last: Option<String> = sqlx::query_scalar("SELECT value FROM mirror_meta WHERE key = ?")
        .bind(LAST_SNAPSHOT_KEY)
        .fetch_optional(pool)
        .await?;
    let last_updated = last
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    Ok(MirrorStats {
        count,
        last_updated,
    })
}

// ---------------------------------------------------------------------------
// Identity mappings
// ---------------------------------------------------------------------------

fn mapping_from_row(row: &SqliteRow) -> Result<IdentityMapping> {
    Ok(IdentityMapping {
        local_id: row.try_get("local_id")?,
        external_id: row.try_get("external_id")?,
        checked_at: row.try_get("checked_at")?,
        last_error: row.try_get("last_error")?,
    })
}

pub async fn get_mapping(pool: &Pool, local_id: i64) -> Result<Option<IdentityMapping>> {
    let row = sqlx::query("SELECT * FROM identity_mappings WHERE local_id = ?")
        .bind(local_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(mapping_from_row).transpose()
}

pub async fn list_mappings(pool: &Pool) -> Result<Vec<IdentityMapping>> {
    let rows = sqlx::query("SELECT * FROM identity_mappings ORDER BY local_id")
        .fetch_all(pool)
        .await?;
    rows.iter().map(mapping_from_row).collect()
}

/// Record a lookup attempt. A stored external id is never replaced by `None`,
/// and a resolved id is copied onto the mirrored book.
#[instrument(skip_all, fields(local_id = local_id))]
pub async fn upsert_mapping(
    pool: &Pool,
    local_id: i64,
    external_id: Option<&str>,
    last_error: Option<&str>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO identity_mappings (local_id, external_id, checked_at, last_error) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT(local_id) DO UPDATE SET \
            external_id = COALESCE(excluded.external_id, identity_mappings.external_id), \
            checked_at = excluded.checked_at, \
            last_error = excluded.last_error",
    )
    .bind(local_id)
    .bind(external_id)
    .bind(Utc::now())
    .bind(last_error)
    .execute(&mut *tx)
    .await?;
    if let Some(external_id) = external_id {
        sqlx::query("UPDATE library_books SET external_id = ? WHERE id = ?")
            .bind(external_id)
            .bind(local_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Refresh `checked_at` of an existing mapping without touching its id.
pub async fn touch_mapping(pool: &Pool, local_id: i64) -> Result<()> {
    sqlx::query("UPDATE identity_mappings SET checked_at = ?, last_error = NULL WHERE local_id = ?")
        .bind(Utc::now())
        .bind(local_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Scan state: catalog_scan
// ---------------------------------------------------------------------------

fn scan_from_row(row: &SqliteRow) -> Result<ExternalCacheEntry> {
    let status: String = row.try_get("status")?;
    Ok(ExternalCacheEntry {
        local_id: row.try_get("local_id")?,
        local_title: row.try_get("local_title")?,
        external_id: row.try_get("external_id")?,
        external_title: row.try_get("external_title")?,
        lists_found: row.try_get("lists_found")?,
        recommendations_found: row.try_get("recommendations_found")?,
        checked_at: row.try_get("checked_at")?,
        status: ScanStatus::parse_state(&status).unwrap_or(ScanStatus::Pending),
        base_genres: from_json(row.try_get("base_genres_json")?),
        lists: from_json(row.try_get("lists_json")?),
        recommendations: from_json(row.try_get("recommendations_json")?),
    })
}

/// Align scan state with the mirror: drop rows for removed books, create
/// pending rows for new ones, refresh titles of retained ones.
#[instrument(skip_all, fields(records = records.len()))]
pub async fn reconcile_scan_state(pool: &Pool, records: &[LibraryRecord]) -> Result<ScanReconcile> {
    let mut tx = pool.begin().await?;
    let existing: Vec<(i64, String)> =
        sqlx::query_as("SELECT local_id, local_title FROM catalog_scan")
            .fetch_all(&mut *tx)
            .await?;
    let existing: HashMap<i64, String> = existing.into_iter().collect();
    let current: HashMap<i64, &str> = records.iter().map(|r| (r.id, r.title.as_str())).collect();

    let mut outcome = ScanReconcile::default();
    for id in existing.keys().filter(|id| !current.contains_key(id)) {
        sqlx::query("DELETE FROM catalog_scan WHERE local_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        outcome.removed += 1;
    }
    for (id, title) in &current {
        match existing.get(id) {
            None => {
                sqlx::query(
                    "INSERT INTO catalog_scan (local_id, local_title, status) VALUES (?, ?, ?)",
                )
                .bind(id)
                .bind(title)
                .bind(ScanStatus::Pending.as_str())
                .execute(&mut *tx)
                .await?;
                outcome.created += 1;
            }
            Some(old) if old != title => {
                sqlx::query("UPDATE catalog_scan SET local_title = ? WHERE local_id = ?")
                    .bind(title)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                outcome.retitled += 1;
            }
            Some(_) => {}
        }
    }
    tx.commit().await?;
    debug!(?outcome, "scan state reconciled");
    Ok(outcome)
}

/// Pending entries, never-checked ones first.
pub async fn pending_scan_entries(pool: &Pool, limit: i64) -> Result<Vec<ExternalCacheEntry>> {
    let rows = sqlx::query(
        "SELECT * FROM catalog_scan WHERE status = ? \
         ORDER BY checked_at IS NOT NULL, checked_at ASC, local_id ASC LIMIT ?",
    )
    .bind(ScanStatus::Pending.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(scan_from_row).collect()
}

pub async fn get_scan_entry(pool: &Pool, local_id: i64) -> Result<Option<ExternalCacheEntry>> {
    let row = sqlx::query("SELECT * FROM catalog_scan WHERE local_id = ?")
        .bind(local_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(scan_from_row).transpose()
}

pub async fn list_scan_entries(pool: &Pool) -> Result<Vec<ExternalCacheEntry>> {
    let rows = sqlx::query("SELECT * FROM catalog_scan ORDER BY local_id")
        .fetch_all(pool)
        .await?;
    rows.iter().map(scan_from_row).collect()
}

pub async fn save_scan_entry(pool: &Pool, entry: &ExternalCacheEntry) -> Result<()> {
    sqlx::query(
        "INSERT INTO catalog_scan (local_id, local_title, external_id, external_title, lists_found, \
         recommendations_found, checked_at, status, base_genres_json, lists_json, recommendations_json) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(local_id) DO UPDATE SET \
            local_title = excluded.local_title, \
            external_id = excluded.external_id, \
            external_title = excluded.external_title, \
            lists_found = excluded.lists_found, \
            recommendations_found = excluded.recommendations_found, \
            checked_at = excluded.checked_at, \
            status = excluded.status, \
            base_genres_json = excluded.base_genres_json, \
            lists_json = excluded.lists_json, \
            recommendations_json = excluded.recommendations_json",
    )
    .bind(entry.local_id)
    .bind(&entry.local_title)
    .bind(&entry.external_id)
    .bind(&entry.external_title)
    .bind(entry.lists_found)
    .bind(entry.recommendations_found)
    .bind(entry.checked_at)
    .bind(entry.status.as_str())
    .bind(to_json(&entry.base_genres))
    .bind(to_json(&entry.lists))
    .bind(to_json(&entry.recommendations))
    .execute(pool)
    .await
    .with_context(|| format!("failed to save scan state for {}", entry.local_id))?;
    Ok(())
}

pub async fn delete_scan_entry(pool: &Pool, local_id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM catalog_scan WHERE local_id = ?")
        .bind(local_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Base-genre lists of every scanned book.
pub async fn cached_base_genres(pool: &Pool) -> Result<Vec<Vec<String>>> {
    let raw: Vec<String> = sqlx::query_scalar(
        "SELECT base_genres_json FROM catalog_scan WHERE base_genres_json <> '[]'",
    )
    .fetch_all(pool)
    .await?;
    Ok(raw.into_iter().map(|s| from_json(Some(s))).collect())
}

// ---------------------------------------------------------------------------
// Suggestions
// ---------------------------------------------------------------------------

fn suggestion_from_row(row: &SqliteRow) -> Result<SuggestedCandidate> {
    Ok(SuggestedCandidate {
        id: row.try_get("id")?,
        payload: from_json::<Value>(row.try_get("payload_json")?),
        source_key: row.try_get("source_key")?,
        base_genres: from_json(row.try_get("base_genres_json")?),
        reasons: from_json(row.try_get("reasons_json")?),
        hidden: row.try_get("hidden")?,
        score: row.try_get("score")?,
        rank: row.try_get("rank")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn merge_reasons(into: &mut Vec<SuggestionReason>, from: &[SuggestionReason]) -> bool {
    let mut changed = false;
    for reason in from {
        if !into.contains(reason) {
            into.push(reason.clone());
            changed = true;
        }
    }
    changed
}

fn merge_genres(into: &mut Vec<String>, from: &[String]) -> bool {
    let mut seen: HashSet<String> = into.iter().map(|g| g.to_lowercase()).collect();
    let mut changed = false;
    for genre in from {
        if seen.insert(genre.to_lowercase()) {
            into.push(genre.clone());
            changed = true;
        }
    }
    changed
}

/// Store a recommendation unless a row with the same source key or the exact
/// same payload already exists, in which case its provenance is merged.
#[instrument(skip_all, fields(source_key = %new.source_key))]
pub async fn upsert_suggestion(pool: &Pool, new: &NewSuggestion) -> Result<SuggestionUpsert> {
    let payload_json = payload::fingerprint(&new.payload);
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let mut existing: Option<(i64, String, String)> = sqlx::query_as(
        "SELECT id, reasons_json, base_genres_json FROM suggestions WHERE source_key = ? ORDER BY id LIMIT 1",
    )
    .bind(&new.source_key)
    .fetch_optional(&mut *tx)
    .await?;
    if existing.is_none() {
        existing = sqlx::query_as(
            "SELECT id, reasons_json, base_genres_json FROM suggestions WHERE payload_json = ? ORDER BY id LIMIT 1",
        )
        .bind(&payload_json)
        .fetch_optional(&mut *tx)
        .await?;
    }

    let outcome = if let Some((id, reasons_json, genres_json)) = existing {
        let mut reasons: Vec<SuggestionReason> = from_json(Some(reasons_json));
        let mut genres: Vec<String> = from_json(Some(genres_json));
        let changed = merge_reasons(&mut reasons, &new.reasons) | merge_genres(&mut genres, &new.base_genres);
        if changed {
            sqlx::query(
                "UPDATE suggestions SET reasons_json = ?, base_genres_json = ?, updated_at = ? WHERE id = ?",
            )
            .bind(to_json(&reasons))
            .bind(to_json(&genres))
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        SuggestionUpsert::Merged(id)
    } else {
        let id: i64 = sqlx::query(
            "INSERT INTO suggestions (source_key, payload_json, base_genres_json, reasons_json, hidden, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 0, ?, ?) RETURNING id",
        )
        .bind(&new.source_key)
        .bind(&payload_json)
        .bind(to_json(&new.base_genres))
        .bind(to_json(&new.reasons))
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?
        .get("id");
        SuggestionUpsert::Inserted(id)
    };
    tx.commit().await?;
    Ok(outcome)
}

/// Suggestions by rank (unranked last), then insertion order.
pub async fn list_suggestions(pool: &Pool, include_hidden: bool) -> Result<Vec<SuggestedCandidate>> {
    let sql = if include_hidden {
        "SELECT * FROM suggestions ORDER BY rank IS NULL, rank ASC, id ASC"
    } else {
        "SELECT * FROM suggestions WHERE hidden = 0 ORDER BY rank IS NULL, rank ASC, id ASC"
    };
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    rows.iter().map(suggestion_from_row).collect()
}

pub async fn get_suggestion(pool: &Pool, id: i64) -> Result<Option<SuggestedCandidate>> {
    let row = sqlx::query("SELECT * FROM suggestions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(suggestion_from_row).transpose()
}

/// Soft-delete (or restore) a suggestion. Returns false when the id is unknown.
pub async fn set_suggestion_hidden(pool: &Pool, id: i64, hidden: bool) -> Result<bool> {
    let res = sqlx::query("UPDATE suggestions SET hidden = ?, updated_at = ? WHERE id = ?")
        .bind(hidden)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Persist `(id, score, rank)` triples; every other row loses its rank.
pub async fn update_suggestion_ranks(pool: &Pool, ranks: &[(i64, i64, i64)]) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE suggestions SET score = NULL, rank = NULL")
        .execute(&mut *tx)
        .await?;
    for (id, score, rank) in ranks {
        sqlx::query("UPDATE suggestions SET score = ?, rank = ? WHERE id = ?")
            .bind(score)
            .bind(rank)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn delete_suggestions_by_key(pool: &Pool, source_key: &str) -> Result<u64> {
    let res = sqlx::query("DELETE FROM suggestions WHERE source_key = ?")
        .bind(source_key)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

/// Collapse rows sharing a source key or payload into the oldest one,
/// merging provenance and keeping a hide from any of them. Returns the
/// number of rows removed.
#[instrument(skip_all)]
pub async fn dedup_suggestions(pool: &Pool) -> Result<usize> {
    let mut tx = pool.begin().await?;
    let rows = sqlx::query("SELECT * FROM suggestions ORDER BY id ASC")
        .fetch_all(&mut *tx)
        .await?;

    let mut keepers: Vec<SuggestedCandidate> = Vec::new();
    let mut dirty: HashSet<usize> = HashSet::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();
    let mut by_payload: HashMap<String, usize> = HashMap::new();
    let mut doomed: Vec<i64> = Vec::new();

    for row in &rows {
        let candidate = suggestion_from_row(row)?;
        let fingerprint = payload::fingerprint(&candidate.payload);
        let keeper = by_key
            .get(&candidate.source_key)
            .or_else(|| by_payload.get(&fingerprint))
            .copied();
        match keeper {
            Some(idx) => {
                let kept = &mut keepers[idx];
                let mut changed = merge_reasons(&mut kept.reasons, &candidate.reasons);
                changed |= merge_genres(&mut kept.base_genres, &candidate.base_genres);
                if candidate.hidden && !kept.hidden {
                    kept.hidden = true;
                    changed = true;
                }
                if changed {
                    dirty.insert(idx);
                }
                by_key.entry(candidate.source_key.clone()).or_insert(idx);
                by_payload.entry(fingerprint).or_insert(idx);
                doomed.push(candidate.id);
            }
            None => {
                let idx = keepers.len();
                by_key.insert(candidate.source_key.clone(), idx);
                by_payload.insert(fingerprint, idx);
                keepers.push(candidate);
            }
        }
    }

    for idx in dirty {
        let kept = &keepers[idx];
        sqlx::query(
            "UPDATE suggestions SET reasons_json = ?, base_genres_json = ?, hidden = ?, updated_at = ? WHERE id = ?",
        )
        .bind(to_json(&kept.reasons))
        .bind(to_json(&kept.base_genres))
        .bind(kept.hidden)
        .bind(Utc::now())
        .bind(kept.id)
        .execute(&mut *tx)
        .await?;
    }
    for id in &doomed {
        sqlx::query("DELETE FROM suggestions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    if !doomed.is_empty() {
        info!(removed = doomed.len(), "suggestion duplicates removed");
    }
    Ok(doomed.len())
}

// ---------------------------------------------------------------------------
// Wanted
// ---------------------------------------------------------------------------

fn wanted_from_row(row: &SqliteRow) -> Result<WantedEntry> {
    let source: String = row.try_get("source")?;
    Ok(WantedEntry {
        key: row.try_get("key")?,
        payload: from_json::<Value>(row.try_get("payload_json")?),
        source: WantedSource::parse_source(&source).unwrap_or(WantedSource::Manual),
        created_at: row.try_get("created_at")?,
    })
}

pub async fn upsert_wanted(
    pool: &Pool,
    key: &str,
    payload: &Value,
    source: WantedSource,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO wanted (key, payload_json, source, created_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET payload_json = excluded.payload_json",
    )
    .bind(key)
    .bind(to_json(payload))
    .bind(source.as_str())
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_wanted(pool: &Pool) -> Result<Vec<WantedEntry>> {
    let rows = sqlx::query("SELECT * FROM wanted ORDER BY created_at ASC, key ASC")
        .fetch_all(pool)
        .await?;
    rows.iter().map(wanted_from_row).collect()
}

pub async fn get_wanted(pool: &Pool, key: &str) -> Result<Option<WantedEntry>> {
    let row = sqlx::query("SELECT * FROM wanted WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(wanted_from_row).transpose()
}

pub async fn delete_wanted(pool: &Pool, key: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM wanted WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Replace the externally mirrored entries with `entries`; manual entries are
/// never touched, even when an external entry shares their key.
#[instrument(skip_all, fields(entries = entries.len()))]
pub async fn replace_external_wanted(
    pool: &Pool,
    entries: &[(String, Value)],
) -> Result<WantedReplace> {
    let mut tx = pool.begin().await?;
    let existing: Vec<(String, String)> = sqlx::query_as("SELECT key, source FROM wanted")
        .fetch_all(&mut *tx)
        .await?;
    let existing: HashMap<String, String> = existing.into_iter().collect();
    let incoming: HashSet<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();

    let mut outcome = WantedReplace::default();
    for (key, source) in &existing {
        if source == WantedSource::External.as_str() && !incoming.contains(key.as_str()) {
            sqlx::query("DELETE FROM wanted WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?;
            outcome.removed += 1;
        }
    }
    let now = Utc::now();
    for (key, payload) in entries {
        match existing.get(key) {
            None => {
                sqlx::query(
                    "INSERT INTO wanted (key, payload_json, source, created_at) VALUES (?, ?, ?, ?)",
                )
                .bind(key)
                .bind(to_json(payload))
                .bind(WantedSource::External.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await?;
                outcome.inserted += 1;
            }
            Some(source) if source == WantedSource::External.as_str() => {
                sqlx::query("UPDATE wanted SET payload_json = ? WHERE key = ?")
                    .bind(to_json(payload))
                    .bind(key)
                    .execute(&mut *tx)
                    .await?;
            }
            Some(_) => {}
        }
    }
    tx.commit().await?;
    Ok(outcome)
}
