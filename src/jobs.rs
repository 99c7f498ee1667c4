//! Periodic background jobs.
//!
//! Each job runs once immediately and then once per interval inside its own
//! task. A run that outlasts the interval swallows the missed ticks, so a job
//! never overlaps with itself. A zero interval disables the job.

use crate::config::Schedule;
use crate::sync::{SyncError, Syncer};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    job: F,
) -> Option<JoinHandle<()>>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    if interval.is_zero() {
        info!(job = name, "job disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        info!(job = name, interval_secs = interval.as_secs(), "job started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(job = name, "job stopping");
                    break;
                }
                _ = ticker.tick() => {
                    debug!(job = name, "job tick");
                    if let Err(err) = job().await {
                        error!(job = name, error = %err, "job run failed");
                    }
                }
            }
        }
    }))
}

/// Start the library sync, pending resolution, want-to-read mirror and
/// suggestion dedup jobs.
pub fn spawn_all(
    syncer: Arc<Syncer>,
    schedule: &Schedule,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let minutes = Schedule::interval;
    let mut handles = Vec::new();

    let (s, c) = (syncer.clone(), cancel.clone());
    handles.extend(spawn_periodic(
        "library_sync",
        minutes(schedule.library_sync_minutes),
        cancel.clone(),
        move || {
            let (s, c) = (s.clone(), c.clone());
            async move {
                match s.run_cycle(&c).await {
                    Ok(outcome) if !outcome.success => {
                        warn!(error = ?outcome.error, "library sync did not complete");
                    }
                    Ok(_) => {}
                    Err(SyncError::AlreadyRunning) => debug!("library sync already running"),
                    Err(err) => return Err(anyhow::Error::from(err)),
                }
                Ok::<(), anyhow::Error>(())
            }
        },
    ));

    let (s, c) = (syncer.clone(), cancel.clone());
    handles.extend(spawn_periodic(
        "resolve_pending",
        minutes(schedule.resolve_minutes),
        cancel.clone(),
        move || {
            let (s, c) = (s.clone(), c.clone());
            async move {
                s.resolve_pending(&c).await?;
                Ok::<(), anyhow::Error>(())
            }
        },
    ));

    let s = syncer.clone();
    handles.extend(spawn_periodic(
        "want_to_read_mirror",
        minutes(schedule.want_to_read_minutes),
        cancel.clone(),
        move || {
            let s = s.clone();
            async move {
                s.mirror_wanted().await?;
                Ok::<(), anyhow::Error>(())
            }
        },
    ));

    let s = syncer;
    handles.extend(spawn_periodic(
        "suggestion_dedup",
        minutes(schedule.dedup_minutes),
        cancel,
        move || {
            let s = s.clone();
            async move {
                s.dedup_sweep().await?;
                Ok::<(), anyhow::Error>(())
            }
        },
    ));

    handles
}
