use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use shelf_sync::catalog::CatalogClient;
use shelf_sync::sync::{SyncSettings, Syncer};
use shelf_sync::{config, db, jobs, logging};

#[derive(Debug, Parser)]
#[command(author, version, about = "Run the library sync, resolution, want-to-read and dedup jobs")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print an example config and exit
    #[arg(long)]
    print_example_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.print_example_config {
        print!("{}", config::example());
        return Ok(());
    }
    logging::init()?;

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let catalog = Arc::new(CatalogClient::from_config(&cfg.catalog)?);
    let syncer = Arc::new(Syncer::new(pool, catalog, SyncSettings::from_config(&cfg)));

    let cancel = CancellationToken::new();
    let handles = jobs::spawn_all(syncer, &cfg.schedule, cancel.clone());
    info!(jobs = handles.len(), "shelf-sync running");

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(?err, "failed to listen for shutdown signal");
    }
    info!("shutting down");
    cancel.cancel();
    for handle in handles {
        if let Err(err) = handle.await {
            error!(?err, "job task panicked");
        }
    }
    Ok(())
}
