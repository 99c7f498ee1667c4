//! Identity resolution between library books and catalog books.
//!
//! A book is matched by exact ISBN first, accepted only when the catalog
//! title (or an alternate title) equals the local one after normalization.
//! Without an ISBN match, a title search is tried and the first exact
//! normalized-title hit wins. Every attempt is recorded as an identity
//! mapping; a resolved mapping or a clean miss is trusted on later runs
//! without re-querying, while a mapping that recorded an error is retried.

use crate::catalog::CatalogService;
use crate::config;
use crate::db::{self, Pool};
use crate::list_push::{self, PushOutcome};
use crate::model::LibraryRecord;
use crate::payload;
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverSettings {
    /// Newly resolved ids are added to this external list.
    pub push_list_id: Option<String>,
    /// Pause between records that hit the network.
    pub request_delay: Duration,
}

impl ResolverSettings {
    pub fn from_config(cfg: &config::Catalog) -> Self {
        Self {
            push_list_id: cfg
                .push_list_id
                .clone()
                .filter(|id| !id.trim().is_empty()),
            request_delay: cfg.request_delay(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolveStats {
    pub attempted: usize,
    pub resolved: usize,
    pub missing_key: usize,
    pub fallback_used: usize,
    pub already_mapped: usize,
    pub failed: usize,
}

impl ResolveStats {
    pub fn record(&mut self, res: &RecordResolution) {
        match res.kind {
            ResolutionKind::AlreadyMapped => {
                self.already_mapped += 1;
                return;
            }
            ResolutionKind::ByIsbn => self.resolved += 1,
            ResolutionKind::ByTitle => {
                self.resolved += 1;
                self.fallback_used += 1;
            }
            ResolutionKind::NotFound => {}
            ResolutionKind::Failed => self.failed += 1,
        }
        self.attempted += 1;
        if res.missing_key {
            self.missing_key += 1;
        }
    }

    pub fn merge(&mut self, other: &ResolveStats) {
        self.attempted += other.attempted;
        self.resolved += other.resolved;
        self.missing_key += other.missing_key;
        self.fallback_used += other.fallback_used;
        self.already_mapped += other.already_mapped;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionKind {
    /// A trusted mapping (or known miss) existed; nothing was queried.
    AlreadyMapped,
    ByIsbn,
    ByTitle,
    /// Every lookup completed cleanly without an acceptable match.
    NotFound,
    /// No match and at least one lookup failed in transport.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordResolution {
    pub local_id: i64,
    pub kind: ResolutionKind,
    pub external_id: Option<String>,
    /// The matched catalog document, when one was accepted this round.
    pub book: Option<Value>,
    pub missing_key: bool,
    pub error: Option<String>,
    pub pushed: Option<PushOutcome>,
}

impl RecordResolution {
    pub fn is_resolved(&self) -> bool {
        self.external_id.is_some()
    }

    pub fn hit_network(&self) -> bool {
        self.kind != ResolutionKind::AlreadyMapped
    }
}

fn titles_match(book: &Value, wanted: &str) -> bool {
    payload::title(book)
        .into_iter()
        .chain(payload::alternate_titles(book))
        .any(|t| payload::normalize_title(&t) == wanted)
}

/// Resolve one record and persist the attempt.
#[instrument(skip_all, fields(local_id = record.id))]
pub async fn resolve_one(
    pool: &Pool,
    catalog: &dyn CatalogService,
    record: &LibraryRecord,
    settings: &ResolverSettings,
) -> Result<RecordResolution> {
    if let Some(mapping) = db::get_mapping(pool, record.id).await? {
        if mapping.is_resolved() || mapping.is_known_miss() {
            db::touch_mapping(pool, record.id).await?;
            return Ok(RecordResolution {
                local_id: record.id,
                kind: ResolutionKind::AlreadyMapped,
                external_id: mapping.external_id,
                book: None,
                missing_key: false,
                error: None,
                pushed: None,
            });
        }
    }

    let wanted_title = payload::normalize_title(&record.title);
    let isbn = record.isbn.as_deref().and_then(payload::normalize_isbn);
    let mut errors: Vec<String> = Vec::new();
    let mut matched: Option<(ResolutionKind, Value)> = None;

    if let Some(isbn) = &isbn {
        match catalog.search_by_isbn(isbn).await {
            Ok(results) => {
                if let Some(first) = results.first() {
                    if titles_match(first, &wanted_title) {
                        matched = Some((ResolutionKind::ByIsbn, first.clone()));
                    } else {
                        debug!(isbn, "isbn hit rejected on title");
                    }
                }
            }
            Err(err) => {
                warn!(?err, isbn, "isbn lookup failed");
                errors.push(err.to_string());
            }
        }
    }

    if matched.is_none() && !wanted_title.is_empty() {
        match catalog.search_by_title(&record.title).await {
            Ok(results) => {
                matched = results
                    .into_iter()
                    .find(|book| {
                        payload::title(book)
                            .map(|t| payload::normalize_title(&t) == wanted_title)
                            .unwrap_or(false)
                    })
                    .map(|book| (ResolutionKind::ByTitle, book));
            }
            Err(err) => {
                warn!(?err, "title lookup failed");
                errors.push(err.to_string());
            }
        }
    }

    let matched = matched.and_then(|(kind, book)| {
        payload::external_id(&book).map(|id| (kind, id, book))
    });

    let mut resolution = RecordResolution {
        local_id: record.id,
        kind: ResolutionKind::NotFound,
        external_id: None,
        book: None,
        missing_key: isbn.is_none(),
        error: None,
        pushed: None,
    };
    match matched {
        Some((kind, external_id, book)) => {
            db::upsert_mapping(pool, record.id, Some(&external_id), None).await?;
            info!(external_id, ?kind, "book resolved");
            resolution.kind = kind;
            resolution.external_id = Some(external_id);
            resolution.book = Some(book);
        }
        None if !errors.is_empty() => {
            let error = errors.join("; ");
            db::upsert_mapping(pool, record.id, None, Some(&error)).await?;
            resolution.kind = ResolutionKind::Failed;
            resolution.error = Some(error);
        }
        None => {
            db::upsert_mapping(pool, record.id, None, None).await?;
        }
    }

    if let (Some(list_id), Some(external_id)) = (&settings.push_list_id, &resolution.external_id) {
        resolution.pushed = Some(list_push::push_with_retry(catalog, list_id, external_id).await);
    }
    Ok(resolution)
}

/// Resolve a batch. Commits per record and stops early when `cancel` fires.
#[instrument(skip_all, fields(records = records.len()))]
pub async fn resolve(
    pool: &Pool,
    catalog: &dyn CatalogService,
    records: &[LibraryRecord],
    settings: &ResolverSettings,
    cancel: &CancellationToken,
) -> Result<ResolveStats> {
    let mut stats = ResolveStats::default();
    let mut pause_before_next = false;
    for record in records {
        if cancel.is_cancelled() {
            info!("resolution cancelled");
            break;
        }
        if pause_before_next && !pace(settings.request_delay, cancel).await {
            break;
        }
        let res = resolve_one(pool, catalog, record, settings).await?;
        pause_before_next = res.hit_network();
        stats.record(&res);
    }
    info!(?stats, "resolution finished");
    Ok(stats)
}

/// Sleep for `delay` unless cancelled first. Returns false on cancellation.
pub async fn pace(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
