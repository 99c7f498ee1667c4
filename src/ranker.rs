//! Heuristic scoring of stored suggestions against the local library.
//!
//! Scores are small integers in `1..=20` built from title keyword overlap,
//! author overlap, genre overlap and whether the candidate carries an ISBN.

use crate::db::{self, Pool};
use crate::model::{LibraryRecord, SuggestedCandidate};
use crate::payload;
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::{info, instrument};

pub const MIN_SCORE: i64 = 1;
pub const MAX_SCORE: i64 = 20;

const TITLE_HIT: i64 = 5;
const AUTHOR_HIT: i64 = 3;
const AUTHOR_MISS: i64 = -1;
const NO_ISBN: i64 = -1;
const TWO_WORD_BONUS: i64 = 1;

static TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9]+").unwrap());

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "and", "for", "with", "from", "into", "onto", "that", "this", "these", "those",
        "your", "you", "are", "was", "were", "but", "not", "all", "any", "our", "its", "his",
        "her", "their", "who", "what", "when", "where", "how", "why", "out", "over", "under",
        "about", "after", "before", "book", "books", "novel", "vol", "volume", "edition",
        "part", "series", "collection", "complete", "new",
    ]
    .into_iter()
    .collect()
});

/// Lowercase alphanumeric tokens of length >= 3, stopwords removed, deduped.
pub fn keywords(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut seen = HashSet::new();
    TOKEN
        .find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|t| t.len() >= 3 && !STOPWORDS.contains(t))
        .filter(|t| seen.insert(t.to_string()))
        .map(str::to_string)
        .collect()
}

/// Lowercase alphanumeric words of a genre label, deduped. Short words like
/// "fi" in "Sci-Fi" are kept.
pub fn genre_words(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut seen = HashSet::new();
    TOKEN
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScoreBreakdown {
    pub title_score: i64,
    pub author_adjustment: i64,
    pub isbn_adjustment: i64,
    pub genre_adjustment: i64,
    pub title_two_word_bonus: i64,
    pub raw: i64,
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedSuggestion {
    pub candidate_id: i64,
    pub score: i64,
    pub author_match: bool,
    pub genre_match_count: usize,
    pub title_word_match_count: usize,
    pub already_in_library: bool,
    pub matched_by_isbn: bool,
    pub matched_local_id: Option<i64>,
    pub breakdown: ScoreBreakdown,
}

/// Lookup structures derived once from the library snapshot.
#[derive(Debug, Default)]
pub struct LibraryIndex {
    authors: HashSet<String>,
    title_keywords: Vec<HashSet<String>>,
    all_keywords: HashSet<String>,
    isbn_to_id: HashMap<String, i64>,
    title_to_id: HashMap<String, i64>,
    genre_words: HashSet<String>,
}

impl LibraryIndex {
    pub fn build(snapshot: &[LibraryRecord], cached_genres: &[Vec<String>]) -> Self {
        let mut index = LibraryIndex::default();
        for record in snapshot {
            for author in &record.authors {
                let author = author.trim().to_lowercase();
                if !author.is_empty() {
                    index.authors.insert(author);
                }
            }
            let words: HashSet<String> = keywords(&record.title).into_iter().collect();
            index.all_keywords.extend(words.iter().cloned());
            index.title_keywords.push(words);

            if let Some(isbn) = record.isbn.as_deref().and_then(payload::normalize_isbn) {
                index.isbn_to_id.entry(isbn).or_insert(record.id);
            }
            let title = payload::normalize_title(&record.title);
            if !title.is_empty() {
                index.title_to_id.entry(title).or_insert(record.id);
            }
        }
        for genres in cached_genres {
            for genre in genres {
                index.genre_words.extend(genre_words(genre));
            }
        }
        index
    }

    pub fn score(&self, candidate: &SuggestedCandidate) -> RankedSuggestion {
        let book = &candidate.payload;
        let title = payload::title(book).unwrap_or_default();
        let candidate_words: HashSet<String> = keywords(&title).into_iter().collect();

        let title_hit = candidate_words.iter().any(|w| self.all_keywords.contains(w));
        let best_overlap = self
            .title_keywords
            .iter()
            .map(|local| local.intersection(&candidate_words).count())
            .max()
            .unwrap_or(0);

        let author_match = payload::authors(book)
            .iter()
            .any(|a| self.authors.contains(&a.trim().to_lowercase()));

        let isbns = payload::isbns(book);

        let candidate_genres: HashSet<String> = payload::genres(book)
            .iter()
            .flat_map(|g| genre_words(g))
            .collect();
        let genre_match_count = candidate_genres
            .iter()
            .filter(|w| self.genre_words.contains(*w))
            .count();

        let mut breakdown = ScoreBreakdown {
            title_score: if title_hit { TITLE_HIT } else { 0 },
            author_adjustment: if author_match { AUTHOR_HIT } else { AUTHOR_MISS },
            isbn_adjustment: if isbns.is_empty() { NO_ISBN } else { 0 },
            genre_adjustment: genre_match_count as i64,
            title_two_word_bonus: if best_overlap >= 2 { TWO_WORD_BONUS } else { 0 },
            ..ScoreBreakdown::default()
        };
        breakdown.raw = breakdown.title_score
            + breakdown.author_adjustment
            + breakdown.isbn_adjustment
            + breakdown.genre_adjustment
            + breakdown.title_two_word_bonus;
        breakdown.score = breakdown.raw.clamp(MIN_SCORE, MAX_SCORE);

        let isbn_hit = isbns.iter().find_map(|i| self.isbn_to_id.get(i).copied());
        let (matched_local_id, matched_by_isbn) = match isbn_hit {
            Some(id) => (Some(id), true),
            None => (
                self.title_to_id
                    .get(&payload::normalize_title(&title))
                    .copied()
                    .filter(|_| !title.trim().is_empty()),
                false,
            ),
        };

        RankedSuggestion {
            candidate_id: candidate.id,
            score: breakdown.score,
            author_match,
            genre_match_count,
            title_word_match_count: best_overlap,
            already_in_library: matched_local_id.is_some(),
            matched_by_isbn,
            matched_local_id,
            breakdown,
        }
    }
}

fn compare(a: &RankedSuggestion, b: &RankedSuggestion) -> Ordering {
    b.score
        .cmp(&a.score)
        .then(b.already_in_library.cmp(&a.already_in_library))
        .then(b.author_match.cmp(&a.author_match))
        .then(b.genre_match_count.cmp(&a.genre_match_count))
        .then(b.title_word_match_count.cmp(&a.title_word_match_count))
        .then(a.candidate_id.cmp(&b.candidate_id))
}

/// Score and order candidates. Pure; equal inputs give equal output.
pub fn rank(
    snapshot: &[LibraryRecord],
    cached_genres: &[Vec<String>],
    candidates: &[SuggestedCandidate],
) -> Vec<RankedSuggestion> {
    let index = LibraryIndex::build(snapshot, cached_genres);
    let mut ranked: Vec<RankedSuggestion> = candidates.iter().map(|c| index.score(c)).collect();
    ranked.sort_by(compare);
    ranked
}

/// Rank every visible suggestion and persist score and position.
#[instrument(skip_all)]
pub async fn rank_and_store(pool: &Pool) -> Result<Vec<RankedSuggestion>> {
    let snapshot = db::get_all(pool, 0).await?;
    let genres = db::cached_base_genres(pool).await?;
    let candidates = db::list_suggestions(pool, false).await?;
    let ranked = rank(&snapshot, &genres, &candidates);

    let rows: Vec<(i64, i64, i64)> = ranked
        .iter()
        .enumerate()
        .map(|(pos, r)| (r.candidate_id, r.score, pos as i64 + 1))
        .collect();
    db::update_suggestion_ranks(pool, &rows).await?;
    info!(ranked = ranked.len(), "suggestions ranked");
    Ok(ranked)
}
