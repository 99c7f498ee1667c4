//! Library sync cycle: snapshot the local library into the mirror, then
//! resolve and scan pending books, prune wanted entries that are now owned
//! and re-rank suggestions.

use crate::aggregator::{self, AggregateSettings};
use crate::catalog::CatalogService;
use crate::config::Config;
use crate::covers;
use crate::db::{self, Pool};
use crate::ranker;
use crate::resolver::{self, ResolveStats, ResolverSettings};
use crate::source::LibrarySource;
use crate::wanted::{self, PruneSummary};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a library sync is already running")]
    AlreadyRunning,
    #[error("library source missing: {0}")]
    SourceMissing(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Idle,
    ValidatingSource,
    Snapshotting,
    ReplacingMirror,
    UpdatingIdentityCache,
    ResolvingPending,
    AggregatingRecommendations,
    PruningWanted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub added: usize,
    pub removed: usize,
    pub total: i64,
    pub resolve: ResolveStats,
    pub scanned: usize,
    pub pruned: PruneSummary,
    pub ranked: usize,
}

impl SyncOutcome {
    fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

/// Result of one pass over pending scan entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingPass {
    pub resolve: ResolveStats,
    pub scanned: usize,
    /// Set when another pass already held the lock.
    pub skipped: bool,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub library_root: Option<PathBuf>,
    pub metadata_file: String,
    pub content_dir: PathBuf,
    pub batch_size: i64,
    pub resolver: ResolverSettings,
    pub aggregate: AggregateSettings,
}

impl SyncSettings {
    pub fn from_config(cfg: &Config) -> Self {
        let root = cfg.library.path.trim();
        Self {
            library_root: (!root.is_empty()).then(|| PathBuf::from(root)),
            metadata_file: cfg.library.metadata_file.clone(),
            content_dir: PathBuf::from(&cfg.app.content_dir),
            batch_size: i64::from(cfg.schedule.resolve_batch_size),
            resolver: ResolverSettings::from_config(&cfg.catalog),
            aggregate: AggregateSettings::from_config(&cfg.catalog),
        }
    }
}

pub struct Syncer {
    pool: Pool,
    catalog: Arc<dyn CatalogService>,
    settings: SyncSettings,
    cycle_lock: Mutex<()>,
    pending_lock: Mutex<()>,
    stage: watch::Sender<SyncStage>,
}

impl Syncer {
    pub fn new(pool: Pool, catalog: Arc<dyn CatalogService>, settings: SyncSettings) -> Self {
        let (stage, _) = watch::channel(SyncStage::Idle);
        Self {
            pool,
            catalog,
            settings,
            cycle_lock: Mutex::new(()),
            pending_lock: Mutex::new(()),
            stage,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn stage(&self) -> SyncStage {
        *self.stage.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStage> {
        self.stage.subscribe()
    }

    fn set_stage(&self, stage: SyncStage) {
        self.stage.send_replace(stage);
    }

    /// Run one full library cycle. A cycle already in flight is rejected with
    /// [`SyncError::AlreadyRunning`]; every other failure is reported in the
    /// returned outcome.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<SyncOutcome, SyncError> {
        let _guard = self
            .cycle_lock
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning)?;
        let span = info_span!("sync_cycle", run_id = %Uuid::new_v4());
        let outcome = async {
            info!("sync cycle started");
            let result = self.cycle(cancel).await;
            self.set_stage(SyncStage::Idle);
            match result {
                Ok(outcome) => {
                    info!(
                        added = outcome.added,
                        removed = outcome.removed,
                        total = outcome.total,
                        scanned = outcome.scanned,
                        ranked = outcome.ranked,
                        "sync cycle finished"
                    );
                    outcome
                }
                Err(err) => {
                    warn!(error = %err, "sync cycle failed");
                    SyncOutcome::failed(err)
                }
            }
        }
        .instrument(span)
        .await;
        Ok(outcome)
    }

    async fn cycle(&self, cancel: &CancellationToken) -> Result<SyncOutcome, SyncError> {
        self.set_stage(SyncStage::ValidatingSource);
        let root = self
            .settings
            .library_root
            .clone()
            .ok_or_else(|| SyncError::SourceMissing("library.path is not configured".into()))?;
        let metadata = root.join(&self.settings.metadata_file);
        if !metadata.is_file() {
            return Err(SyncError::SourceMissing(metadata.display().to_string()));
        }

        self.set_stage(SyncStage::Snapshotting);
        let source = LibrarySource::open(&root, &self.settings.metadata_file).await?;
        let mut records = source.read_all().await?;
        for record in records.iter_mut().filter(|r| r.has_cover) {
            if let Some(path) = record.relative_path.clone() {
                record.cover_url =
                    covers::cover_url(&root, &path, record.id, &self.settings.content_dir).await;
            }
        }

        self.set_stage(SyncStage::ReplacingMirror);
        let replaced = db::replace_all(&self.pool, &records).await?;

        self.set_stage(SyncStage::UpdatingIdentityCache);
        db::reconcile_scan_state(&self.pool, &records).await?;

        let pass = self
            .pending_pass(cancel, |stage| self.set_stage(stage))
            .await?;

        self.set_stage(SyncStage::PruningWanted);
        let added: HashSet<i64> = replaced.added.iter().copied().collect();
        let added_isbns = aggregator::library_isbns(
            &records
                .iter()
                .filter(|r| added.contains(&r.id))
                .cloned()
                .collect::<Vec<_>>(),
        );
        let pruned = wanted::prune_for_isbns(&self.pool, self.catalog.as_ref(), &added_isbns).await;

        let ranked = match ranker::rank_and_store(&self.pool).await {
            Ok(ranked) => ranked.len(),
            Err(err) => {
                warn!(?err, "ranking failed");
                0
            }
        };

        Ok(SyncOutcome {
            success: true,
            error: None,
            added: replaced.added.len(),
            removed: replaced.removed.len(),
            total: replaced.total,
            resolve: pass.resolve,
            scanned: pass.scanned,
            pruned,
            ranked,
        })
    }

    /// Resolve and scan up to one batch of pending books. Used by the
    /// resolution job; a pass already in flight makes this a no-op.
    pub async fn resolve_pending(&self, cancel: &CancellationToken) -> anyhow::Result<PendingPass> {
        let pass = self.pending_pass(cancel, |_| {}).await?;
        if pass.scanned > 0 {
            if let Err(err) = ranker::rank_and_store(&self.pool).await {
                warn!(?err, "ranking after resolution failed");
            }
        }
        Ok(pass)
    }

    async fn pending_pass(
        &self,
        cancel: &CancellationToken,
        on_stage: impl Fn(SyncStage),
    ) -> anyhow::Result<PendingPass> {
        let Ok(_guard) = self.pending_lock.try_lock() else {
            info!("pending resolution already running; skipping");
            return Ok(PendingPass {
                skipped: true,
                ..PendingPass::default()
            });
        };

        let pending = db::pending_scan_entries(&self.pool, self.settings.batch_size).await?;
        if pending.is_empty() {
            return Ok(PendingPass::default());
        }
        let snapshot = db::get_all(&self.pool, 0).await?;
        let library_isbns = aggregator::library_isbns(&snapshot);
        let catalog = self.catalog.as_ref();

        let mut pass = PendingPass::default();
        let mut pause_before_next = false;
        for entry in pending {
            if cancel.is_cancelled() {
                info!("pending resolution cancelled");
                break;
            }
            let Some(record) = snapshot.iter().find(|r| r.id == entry.local_id) else {
                db::delete_scan_entry(&self.pool, entry.local_id).await?;
                continue;
            };
            if pause_before_next
                && !resolver::pace(self.settings.resolver.request_delay, cancel).await
            {
                break;
            }

            on_stage(SyncStage::ResolvingPending);
            let resolution =
                match resolver::resolve_one(&self.pool, catalog, record, &self.settings.resolver)
                    .await
                {
                    Ok(resolution) => resolution,
                    Err(err) => {
                        warn!(?err, local_id = record.id, "resolution failed");
                        continue;
                    }
                };
            pass.resolve.record(&resolution);
            pause_before_next = true;

            on_stage(SyncStage::AggregatingRecommendations);
            match aggregator::scan_record(
                &self.pool,
                catalog,
                record,
                &resolution,
                &library_isbns,
                &self.settings.aggregate,
                cancel,
            )
            .await
            {
                Ok(summary) if summary.cancelled => break,
                Ok(_) => pass.scanned += 1,
                Err(err) => warn!(?err, local_id = record.id, "scan failed"),
            }
        }
        info!(resolve = ?pass.resolve, scanned = pass.scanned, "pending pass finished");
        Ok(pass)
    }

    /// Mirror the catalog's want-to-read shelf into wanted entries.
    pub async fn mirror_wanted(&self) -> anyhow::Result<wanted::MirrorStats> {
        wanted::mirror_want_to_read(&self.pool, self.catalog.as_ref()).await
    }

    /// Merge duplicate suggestions and re-rank what remains.
    pub async fn dedup_sweep(&self) -> anyhow::Result<usize> {
        let removed = db::dedup_suggestions(&self.pool).await?;
        ranker::rank_and_store(&self.pool).await?;
        Ok(removed)
    }
}
