mod common;

use chrono::Utc;
use common::setup_pool;
use serde_json::{json, Value};
use shelf_sync::db::{self, NewSuggestion};
use shelf_sync::model::{LibraryRecord, SuggestedCandidate};
use shelf_sync::ranker::{self, MAX_SCORE, MIN_SCORE};

fn candidate(id: i64, payload: Value) -> SuggestedCandidate {
    SuggestedCandidate {
        id,
        payload,
        source_key: format!("id:{id}"),
        base_genres: vec![],
        reasons: vec![],
        hidden: false,
        score: None,
        rank: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn library() -> Vec<LibraryRecord> {
    let mut darkness = LibraryRecord::new(1, "The Left Hand of Darkness");
    darkness.authors = vec!["Ursula K. Le Guin".into()];
    darkness.isbn = Some("978-0-441-47812-5".into());
    let mut dune = LibraryRecord::new(2, "Dune");
    dune.authors = vec!["Frank Herbert".into()];
    dune.isbn = Some("9780441172719".into());
    vec![darkness, dune]
}

fn genres() -> Vec<Vec<String>> {
    vec![vec!["Science Fiction".into(), "Classics".into()]]
}

#[test]
fn isbn_match_marks_candidate_as_owned() {
    let cands = vec![candidate(
        10,
        json!({
            "title": "Dune (Special Edition)",
            "author_names": ["frank herbert"],
            "default_physical_edition": {"isbn_13": "978-0441172719"}
        }),
    )];
    let ranked = ranker::rank(&library(), &genres(), &cands);
    let r = &ranked[0];
    assert!(r.already_in_library);
    assert!(r.matched_by_isbn);
    assert_eq!(r.matched_local_id, Some(2));
    assert!(r.author_match);
    assert_eq!(r.breakdown.author_adjustment, 3);
    assert_eq!(r.breakdown.isbn_adjustment, 0);
    assert_eq!(r.breakdown.title_score, 5);
    // "dune" 5 + author 3 + isbn 0
    assert_eq!(r.score, 8);
}

#[test]
fn two_shared_title_words_earn_the_bonus() {
    let cands = vec![
        candidate(1, json!({"title": "Darkness Left Behind"})),
        candidate(2, json!({"title": "Darkness Rising"})),
    ];
    let ranked = ranker::rank(&library(), &genres(), &cands);
    let two = ranked.iter().find(|r| r.candidate_id == 1).unwrap();
    assert_eq!(two.title_word_match_count, 2);
    assert_eq!(two.breakdown.title_two_word_bonus, 1);
    assert_eq!(two.breakdown.title_score, 5);
    // 5 title - 1 author - 1 isbn + 1 bonus
    assert_eq!(two.score, 4);

    let one = ranked.iter().find(|r| r.candidate_id == 2).unwrap();
    assert_eq!(one.title_word_match_count, 1);
    assert_eq!(one.breakdown.title_two_word_bonus, 0);
    assert_eq!(one.score, 3);
    assert_eq!(ranked[0].candidate_id, 1);
}

#[test]
fn genre_words_count_against_library_genres() {
    let cands = vec![candidate(
        3,
        json!({"title": "Unrelated", "cached_tags": {"Genre": [{"tag": "Science Fiction"}, {"tag": "Romance"}]}}),
    )];
    let ranked = ranker::rank(&library(), &genres(), &cands);
    // "science" and "fiction" both appear in the library genre words
    assert_eq!(ranked[0].genre_match_count, 2);
    assert_eq!(ranked[0].breakdown.genre_adjustment, 2);
}

#[test]
fn scores_stay_in_bounds_and_ranking_is_deterministic() {
    let payloads = [
        json!({}),
        json!({"title": "Dune"}),
        json!({"title": "The Left Hand of Darkness", "author_names": ["Ursula K. Le Guin"], "isbn": "1"}),
        json!({"title": "x", "genres": "Science Fiction, Classics"}),
        json!({"title": null, "authors": 7}),
        json!({"title": "Hand Left Darkness Dune", "contributions": [{"author": {"name": "Frank Herbert"}}], "isbns": ["9780441172719"]}),
    ];
    let cands: Vec<SuggestedCandidate> = payloads
        .iter()
        .enumerate()
        .map(|(i, p)| candidate(i as i64 + 1, p.clone()))
        .collect();

    let first = ranker::rank(&library(), &genres(), &cands);
    for r in &first {
        assert!((MIN_SCORE..=MAX_SCORE).contains(&r.score), "{r:?}");
        assert_eq!(r.score, r.breakdown.score);
    }
    for pair in first.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }

    let mut reversed = cands.clone();
    reversed.reverse();
    let second = ranker::rank(&library(), &genres(), &reversed);
    assert_eq!(first, second);
}

#[tokio::test]
async fn rank_and_store_persists_positions() {
    let pool = setup_pool().await;
    db::replace_all(&pool, &library()).await.unwrap();
    let weak = db::upsert_suggestion(
        &pool,
        &NewSuggestion {
            source_key: "id:1".into(),
            payload: json!({"id": 1, "title": "Quiet"}),
            base_genres: vec![],
            reasons: vec![],
        },
    )
    .await
    .unwrap()
    .id();
    let strong = db::upsert_suggestion(
        &pool,
        &NewSuggestion {
            source_key: "id:2".into(),
            payload: json!({"id": 2, "title": "Children of Dune", "author_names": ["Frank Herbert"]}),
            base_genres: vec![],
            reasons: vec![],
        },
    )
    .await
    .unwrap()
    .id();
    let hidden = db::upsert_suggestion(
        &pool,
        &NewSuggestion {
            source_key: "id:3".into(),
            payload: json!({"id": 3, "title": "Dune Messiah"}),
            base_genres: vec![],
            reasons: vec![],
        },
    )
    .await
    .unwrap()
    .id();
    db::set_suggestion_hidden(&pool, hidden, true).await.unwrap();

    let ranked = ranker::rank_and_store(&pool).await.unwrap();
    assert_eq!(ranked.len(), 2);

    let visible = db::list_suggestions(&pool, false).await.unwrap();
    assert_eq!(visible[0].id, strong);
    assert_eq!(visible[0].rank, Some(1));
    assert_eq!(visible[0].score, Some(7));
    assert_eq!(visible[1].id, weak);
    assert_eq!(visible[1].rank, Some(2));
    let hidden_row = db::get_suggestion(&pool, hidden).await.unwrap().unwrap();
    assert_eq!(hidden_row.rank, None);
}
