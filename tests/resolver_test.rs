mod common;

use common::{setup_pool, RecordingCatalog};
use serde_json::json;
use shelf_sync::catalog::CatalogError;
use shelf_sync::db;
use shelf_sync::list_push::{self, PushOutcome, MAX_ATTEMPTS};
use shelf_sync::model::LibraryRecord;
use shelf_sync::resolver::{self, ResolutionKind, ResolverSettings};
use tokio_util::sync::CancellationToken;

fn dune() -> LibraryRecord {
    let mut record = LibraryRecord::new(1, "Dune");
    record.isbn = Some("978-0-441-17271-9".into());
    record
}

#[tokio::test]
async fn resolving_twice_does_not_query_again() {
    let pool = setup_pool().await;
    db::replace_all(&pool, &[dune()]).await.unwrap();
    let catalog = RecordingCatalog::default();
    catalog
        .on_isbn("9780441172719", vec![json!({"id": 312, "title": "Dune"})])
        .await;
    let settings = ResolverSettings::default();
    let cancel = CancellationToken::new();

    let first = resolver::resolve(&pool, &catalog, &[dune()], &settings, &cancel)
        .await
        .unwrap();
    assert_eq!(first.attempted, 1);
    assert_eq!(first.resolved, 1);
    assert_eq!(first.fallback_used, 0);
    let calls_after_first = catalog.calls().await.len();

    let second = resolver::resolve(&pool, &catalog, &[dune()], &settings, &cancel)
        .await
        .unwrap();
    assert_eq!(second.already_mapped, 1);
    assert_eq!(second.attempted, 0);
    assert_eq!(catalog.calls().await.len(), calls_after_first);

    let mapping = db::get_mapping(&pool, 1).await.unwrap().unwrap();
    assert_eq!(mapping.external_id.as_deref(), Some("312"));
    let record = db::get_record(&pool, 1).await.unwrap().unwrap();
    assert_eq!(record.external_id.as_deref(), Some("312"));
}

#[tokio::test]
async fn isbn_hit_with_other_title_falls_back_to_title_search() {
    let pool = setup_pool().await;
    let catalog = RecordingCatalog::default();
    catalog
        .on_isbn("9780441172719", vec![json!({"id": 9, "title": "Dune Messiah"})])
        .await;
    catalog
        .on_title(
            "Dune",
            vec![
                json!({"id": 11, "title": "Dune: The Graphic Novel"}),
                json!({"id": 10, "title": "  DUNE "}),
            ],
        )
        .await;

    let res = resolver::resolve_one(&pool, &catalog, &dune(), &ResolverSettings::default())
        .await
        .unwrap();
    assert_eq!(res.kind, ResolutionKind::ByTitle);
    assert_eq!(res.external_id.as_deref(), Some("10"));
    assert!(!res.missing_key);
}

#[tokio::test]
async fn isbn_alternate_title_is_accepted() {
    let pool = setup_pool().await;
    let catalog = RecordingCatalog::default();
    catalog
        .on_isbn(
            "9780441172719",
            vec![json!({"id": 5, "title": "Dune (40th Anniversary)", "alternative_titles": ["Dune"]})],
        )
        .await;
    let res = resolver::resolve_one(&pool, &catalog, &dune(), &ResolverSettings::default())
        .await
        .unwrap();
    assert_eq!(res.kind, ResolutionKind::ByIsbn);
    assert!(catalog.calls_starting_with("title:").await.is_empty());
}

#[tokio::test]
async fn missing_isbn_is_counted_and_clean_miss_is_not_found() {
    let pool = setup_pool().await;
    let catalog = RecordingCatalog::default();
    let record = LibraryRecord::new(2, "Unknown Book");
    let stats = resolver::resolve(
        &pool,
        &catalog,
        &[record],
        &ResolverSettings::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(stats.missing_key, 1);
    assert_eq!(stats.resolved, 0);
    assert_eq!(stats.failed, 0);

    let mapping = db::get_mapping(&pool, 2).await.unwrap().unwrap();
    assert!(mapping.external_id.is_none());
    assert!(mapping.last_error.is_none());
}

#[tokio::test]
async fn known_miss_is_not_queried_again() {
    let pool = setup_pool().await;
    let catalog = RecordingCatalog::default();
    let settings = ResolverSettings::default();
    let cancel = CancellationToken::new();

    let first = resolver::resolve(&pool, &catalog, &[dune()], &settings, &cancel)
        .await
        .unwrap();
    assert_eq!(first.attempted, 1);
    assert_eq!(first.resolved, 0);
    let calls_after_first = catalog.calls().await.len();
    assert_eq!(calls_after_first, 2);

    let second = resolver::resolve(&pool, &catalog, &[dune()], &settings, &cancel)
        .await
        .unwrap();
    assert_eq!(second.attempted, 0);
    assert_eq!(second.already_mapped, 1);
    assert_eq!(catalog.calls().await.len(), calls_after_first);

    let mapping = db::get_mapping(&pool, 1).await.unwrap().unwrap();
    assert!(mapping.external_id.is_none());
    assert!(mapping.last_error.is_none());
}

#[tokio::test]
async fn transport_failure_is_recorded_for_retry() {
    let pool = setup_pool().await;
    let catalog = RecordingCatalog::default();
    catalog.set_failing(true).await;

    let res = resolver::resolve_one(&pool, &catalog, &dune(), &ResolverSettings::default())
        .await
        .unwrap();
    assert_eq!(res.kind, ResolutionKind::Failed);
    let mapping = db::get_mapping(&pool, 1).await.unwrap().unwrap();
    assert!(mapping.external_id.is_none());
    assert!(mapping.last_error.unwrap().contains("502"));

    catalog.set_failing(false).await;
    catalog
        .on_isbn("9780441172719", vec![json!({"id": 312, "title": "Dune"})])
        .await;
    let res = resolver::resolve_one(&pool, &catalog, &dune(), &ResolverSettings::default())
        .await
        .unwrap();
    assert_eq!(res.kind, ResolutionKind::ByIsbn);
    let mapping = db::get_mapping(&pool, 1).await.unwrap().unwrap();
    assert!(mapping.last_error.is_none());
}

#[tokio::test]
async fn cancelled_batch_does_nothing() {
    let pool = setup_pool().await;
    let catalog = RecordingCatalog::default();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let stats = resolver::resolve(
        &pool,
        &catalog,
        &[dune()],
        &ResolverSettings::default(),
        &cancel,
    )
    .await
    .unwrap();
    assert_eq!(stats.attempted, 0);
    assert!(catalog.calls().await.is_empty());
}

#[tokio::test]
async fn new_resolution_is_pushed_to_configured_list() {
    let pool = setup_pool().await;
    let catalog = RecordingCatalog::default();
    catalog
        .on_isbn("9780441172719", vec![json!({"id": 312, "title": "Dune"})])
        .await;
    let settings = ResolverSettings {
        push_list_id: Some("77".into()),
        ..ResolverSettings::default()
    };
    let res = resolver::resolve_one(&pool, &catalog, &dune(), &settings)
        .await
        .unwrap();
    assert_eq!(res.pushed, Some(PushOutcome::Added { attempts: 1 }));
    assert_eq!(catalog.calls_starting_with("add:").await, vec!["add:77:312"]);

    // already mapped now: no second push
    let res = resolver::resolve_one(&pool, &catalog, &dune(), &settings)
        .await
        .unwrap();
    assert_eq!(res.kind, ResolutionKind::AlreadyMapped);
    assert_eq!(catalog.calls_starting_with("add:").await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_push_stops_at_attempt_ceiling() {
    let catalog = RecordingCatalog::default();
    catalog
        .queue_add_responses(vec![
            Err(CatalogError::RateLimited),
            Err(CatalogError::RateLimited),
            Err(CatalogError::RateLimited),
            Ok(()),
        ])
        .await;

    let outcome = list_push::push_with_retry(&catalog, "77", "312").await;
    assert_eq!(outcome, PushOutcome::Abandoned { attempts: MAX_ATTEMPTS });
    assert_eq!(catalog.calls_starting_with("add:").await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_push_recovers_within_ceiling() {
    let catalog = RecordingCatalog::default();
    catalog
        .queue_add_responses(vec![Err(CatalogError::RateLimited), Ok(())])
        .await;
    let outcome = list_push::push_with_retry(&catalog, "77", "312").await;
    assert_eq!(outcome, PushOutcome::Added { attempts: 2 });
}

#[tokio::test]
async fn other_push_errors_are_not_retried() {
    let catalog = RecordingCatalog::default();
    catalog
        .queue_add_responses(vec![Err(CatalogError::GraphQl("duplicate".into())), Ok(())])
        .await;
    let outcome = list_push::push_with_retry(&catalog, "77", "312").await;
    assert_eq!(outcome, PushOutcome::Abandoned { attempts: 1 });
    assert_eq!(catalog.calls_starting_with("add:").await.len(), 1);
}
