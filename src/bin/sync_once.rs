use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use shelf_sync::catalog::CatalogClient;
use shelf_sync::sync::{SyncSettings, Syncer};
use shelf_sync::{config, db, logging};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run one library sync cycle and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Also mirror the want-to-read shelf before syncing
    #[arg(long)]
    with_wanted: bool,

    /// Merge duplicate suggestions after the cycle
    #[arg(long)]
    dedup: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init()?;

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let catalog = Arc::new(CatalogClient::from_config(&cfg.catalog)?);
    let syncer = Syncer::new(pool, catalog, SyncSettings::from_config(&cfg));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current book");
            on_signal.cancel();
        }
    });

    if args.with_wanted {
        let stats = syncer.mirror_wanted().await?;
        info!(?stats, "want-to-read mirrored");
    }

    let outcome = syncer.run_cycle(&cancel).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if args.dedup {
        let removed = syncer.dedup_sweep().await?;
        info!(removed, "suggestion dedup finished");
    }

    if !outcome.success {
        anyhow::bail!(
            "sync failed: {}",
            outcome.error.unwrap_or_else(|| "unknown error".into())
        );
    }
    Ok(())
}
