use anyhow::Result;
use std::path::Path;

use shelf_sync::catalog::{CatalogClient, CatalogService};
use shelf_sync::config;
use shelf_sync::payload;

// Talks to the real catalog using the local config.yaml.
// Run with `cargo test --test catalog_live -- --ignored`.
#[tokio::test]
#[ignore]
async fn catalog_live_lookup_and_lists() -> Result<()> {
    let cfg = config::load(Some(Path::new("./config.yaml")))?;
    let catalog = CatalogClient::from_config(&cfg.catalog)?;

    let books = catalog.search_by_isbn("9780441172719").await?;
    println!("isbn lookup returned {} book(s)", books.len());
    let Some(book) = books.first() else {
        return Ok(());
    };
    let id = payload::external_id(book).expect("catalog book without id");
    println!("resolved to {id}: {:?}", payload::title(book));

    let lists = catalog.lists_containing(&id, 3).await?;
    for list in &lists {
        let items = catalog.list_books(&list.id, 5).await?;
        println!("list {} ({}) -> {} item(s)", list.name, list.id, items.len());
        assert!(items.len() <= 5);
    }

    let shelf = catalog.want_to_read().await?;
    println!("want-to-read has {} book(s)", shelf.len());
    Ok(())
}
