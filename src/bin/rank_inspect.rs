use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use shelf_sync::{config, db, payload, ranker};

#[derive(Parser, Debug)]
#[command(about = "Print ranked suggestions with their score breakdown")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Number of suggestions to print
    #[arg(long, default_value = "25")]
    limit: usize,

    /// Write scores and ranks back to the store
    #[arg(long)]
    store: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let ranked = if args.store {
        ranker::rank_and_store(&pool).await?
    } else {
        let snapshot = db::get_all(&pool, 0).await?;
        let genres = db::cached_base_genres(&pool).await?;
        let candidates = db::list_suggestions(&pool, false).await?;
        ranker::rank(&snapshot, &genres, &candidates)
    };

    println!("{} suggestions", ranked.len());
    for (pos, item) in ranked.iter().take(args.limit).enumerate() {
        let title = match db::get_suggestion(&pool, item.candidate_id).await? {
            Some(s) => payload::title(&s.payload).unwrap_or_else(|| s.source_key.clone()),
            None => format!("#{}", item.candidate_id),
        };
        let b = &item.breakdown;
        println!(
            "{:>3}. [{:>2}] {}{}",
            pos + 1,
            item.score,
            title,
            if item.already_in_library { "  (owned)" } else { "" }
        );
        println!(
            "       title={} author={} isbn={} genre={} two_word={} raw={} words={} isbn_match={}",
            b.title_score,
            b.author_adjustment,
            b.isbn_adjustment,
            b.genre_adjustment,
            b.title_two_word_bonus,
            b.raw,
            item.title_word_match_count,
            item.matched_by_isbn
        );
    }
    Ok(())
}
