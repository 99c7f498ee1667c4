//! Schema-tolerant extraction from opaque catalog book documents.
//!
//! Catalog responses vary in shape: tags arrive as strings, arrays, tag
//! objects or nested maps; authors hide in `author_names`, `authors`,
//! `contributions` or `cached_contributors`; ISBNs live on the book or on one
//! of its editions. Every function here is pure and returns an empty value
//! instead of failing.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9A-Za-z]").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

const GENRE_KEYS: &[&str] = &["Genre", "genre", "Genres", "genres", "GENRE"];
const TAG_NAME_KEYS: &[&str] = &["name", "tag", "title", "label", "value"];
const TAG_FIELDS: &[&str] = &["cached_tags", "tags", "genres"];
const ISBN_KEYS: &[&str] = &["isbn_13", "isbn13", "isbn_10", "isbn10", "isbn"];
const EDITION_KEYS: &[&str] = &["default_physical_edition", "default_ebook_edition", "edition"];

/// Lowercase, trim and collapse inner whitespace.
pub fn normalize_title(title: &str) -> String {
    WHITESPACE
        .replace_all(title.trim(), " ")
        .to_lowercase()
}

/// Strip everything but ASCII alphanumerics. Returns `None` when nothing is left.
pub fn normalize_isbn(raw: &str) -> Option<String> {
    let cleaned = NON_ALNUM.replace_all(raw, "").to_uppercase();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn non_empty_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn external_id(book: &Value) -> Option<String> {
    book.get("id").and_then(non_empty_str)
}

pub fn slug(book: &Value) -> Option<String> {
    book.get("slug").and_then(non_empty_str)
}

pub fn title(book: &Value) -> Option<String> {
    book.get("title").and_then(non_empty_str)
}

/// Alternate titles a book is known by, besides its main title.
pub fn alternate_titles(book: &Value) -> Vec<String> {
    let mut out = Vec::new();
    for key in ["alternative_titles", "alternate_titles"] {
        match book.get(key) {
            Some(Value::Array(items)) => out.extend(items.iter().filter_map(non_empty_str)),
            Some(other) => out.extend(non_empty_str(other)),
            None => {}
        }
    }
    out
}

/// Dedup key for a neighbor book: external id, else slug, else normalized title.
pub fn source_key(book: &Value) -> Option<String> {
    if let Some(id) = external_id(book) {
        return Some(format!("id:{id}"));
    }
    if let Some(slug) = slug(book) {
        return Some(format!("slug:{slug}"));
    }
    title(book).map(|t| format!("title:{}", normalize_title(&t)))
}

/// Canonical serialization used to detect byte-identical payloads.
pub fn fingerprint(book: &Value) -> String {
    // serde_json maps are ordered by key, so equal documents serialize equally.
    serde_json::to_string(book).unwrap_or_default()
}

pub fn rating(book: &Value) -> Option<f64> {
    for key in ["rating", "average_rating"] {
        match book.get(key) {
            Some(Value::Number(n)) => return n.as_f64(),
            Some(Value::String(s)) => {
                if let Ok(parsed) = s.trim().parse::<f64>() {
                    return Some(parsed);
                }
            }
            _ => {}
        }
    }
    None
}

fn push_unique(out: &mut Vec<String>, seen: &mut HashSet<String>, name: &str) {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return;
    }
    if seen.insert(trimmed.to_lowercase()) {
        out.push(trimmed.to_string());
    }
}

fn tag_name(item: &Value) -> Option<String> {
    match item {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => TAG_NAME_KEYS
            .iter()
            .filter_map(|k| map.get(*k))
            .find_map(tag_name),
        _ => None,
    }
}

fn collect_tags(value: &Value, out: &mut Vec<String>, seen: &mut HashSet<String>) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.starts_with('[') || trimmed.starts_with('{') {
                if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
                    collect_tags(&parsed, out, seen);
                    return;
                }
            }
            for part in trimmed.split(',') {
                push_unique(out, seen, part);
            }
        }
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Array(_) => collect_tags(item, out, seen),
                    _ => {
                        if let Some(name) = tag_name(item) {
                            push_unique(out, seen, &name);
                        }
                    }
                }
            }
        }
        Value::Object(map) => {
            if let Some(nested) = GENRE_KEYS.iter().find_map(|k| map.get(*k)) {
                collect_tags(nested, out, seen);
            } else if let Some(name) = tag_name(value) {
                push_unique(out, seen, &name);
            }
        }
    }
}

/// Genre names from a tags payload of any supported shape, deduplicated
/// case-insensitively in first-seen order.
pub fn genres_from_tags(tags: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    collect_tags(tags, &mut out, &mut seen);
    out
}

/// Genres of a whole book document, looking at the usual tag fields.
pub fn genres(book: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for field in TAG_FIELDS {
        if let Some(tags) = book.get(*field) {
            collect_tags(tags, &mut out, &mut seen);
        }
    }
    out
}

fn contributor_name(item: &Value) -> Option<String> {
    match item {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("author")
            .and_then(contributor_name)
            .or_else(|| map.get("name").and_then(non_empty_str)),
        _ => None,
    }
}

/// Author names, trying flat name arrays first and contributor shapes after.
pub fn authors(book: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for field in [
        "author_names",
        "authors",
        "contributions",
        "cached_contributors",
        "contributors",
    ] {
        match book.get(field) {
            Some(Value::Array(items)) => {
                for name in items.iter().filter_map(contributor_name) {
                    push_unique(&mut out, &mut seen, &name);
                }
            }
            Some(Value::String(s)) => push_unique(&mut out, &mut seen, s),
            _ => {}
        }
        if !out.is_empty() {
            break;
        }
    }
    out
}

fn collect_isbns(value: &Value, out: &mut Vec<String>, seen: &mut HashSet<String>) {
    for key in ISBN_KEYS {
        match value.get(*key) {
            Some(Value::Array(items)) => {
                for item in items {
                    if let Some(isbn) = non_empty_str(item).and_then(|s| normalize_isbn(&s)) {
                        if seen.insert(isbn.clone()) {
                            out.push(isbn);
                        }
                    }
                }
            }
            Some(other) => {
                if let Some(isbn) = non_empty_str(other).and_then(|s| normalize_isbn(&s)) {
                    if seen.insert(isbn.clone()) {
                        out.push(isbn);
                    }
                }
            }
            None => {}
        }
    }
    if let Some(Value::Array(items)) = value.get("isbns") {
        for isbn in items.iter().filter_map(non_empty_str).filter_map(|s| normalize_isbn(&s)) {
            if seen.insert(isbn.clone()) {
                out.push(isbn);
            }
        }
    }
}

/// Normalized ISBNs from the book itself and any of its editions.
pub fn isbns(book: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    collect_isbns(book, &mut out, &mut seen);
    for key in EDITION_KEYS {
        if let Some(edition) = book.get(*key).filter(|v| v.is_object()) {
            collect_isbns(edition, &mut out, &mut seen);
        }
    }
    if let Some(Value::Array(editions)) = book.get("editions") {
        for edition in editions {
            collect_isbns(edition, &mut out, &mut seen);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_genre_object_extracts_names() {
        let tags = json!({"Genre": [{"tag": {"name": "Horror"}}]});
        assert_eq!(genres_from_tags(&tags), vec!["Horror"]);
    }

    #[test]
    fn flat_array_is_kept_in_order() {
        let tags = json!(["Horror", "Sci-Fi"]);
        assert_eq!(genres_from_tags(&tags), vec!["Horror", "Sci-Fi"]);
    }

    #[test]
    fn empty_or_absent_tags_extract_nothing() {
        assert!(genres_from_tags(&Value::Null).is_empty());
        assert!(genres_from_tags(&json!([])).is_empty());
        assert!(genres_from_tags(&json!({})).is_empty());
        assert!(genres(&json!({"title": "Dune"})).is_empty());
    }

    #[test]
    fn tag_objects_and_strings_dedup_case_insensitively() {
        let tags = json!([
            {"tag": "Fantasy"},
            {"name": "fantasy"},
            {"tag": {"tag": "Epic"}},
            "EPIC",
            {"count": 3}
        ]);
        assert_eq!(genres_from_tags(&tags), vec!["Fantasy", "Epic"]);
    }

    #[test]
    fn flat_string_and_encoded_json_are_accepted() {
        assert_eq!(
            genres_from_tags(&json!("Mystery, Thriller")),
            vec!["Mystery", "Thriller"]
        );
        assert_eq!(
            genres_from_tags(&json!(r#"{"genre": ["Romance"]}"#)),
            vec!["Romance"]
        );
    }

    #[test]
    fn book_genres_read_cached_tags() {
        let book = json!({
            "cached_tags": {"Mood": [{"tag": "Dark"}], "Genre": [{"tag": "Horror"}]}
        });
        assert_eq!(genres(&book), vec!["Horror"]);
    }

    #[test]
    fn authors_fall_back_through_contributor_shapes() {
        assert_eq!(
            authors(&json!({"author_names": ["Frank Herbert"]})),
            vec!["Frank Herbert"]
        );
        assert_eq!(
            authors(&json!({"contributions": [{"author": {"name": "N. K. Jemisin"}}]})),
            vec!["N. K. Jemisin"]
        );
        assert_eq!(
            authors(&json!({"cached_contributors": [{"name": "Ann Leckie"}]})),
            vec!["Ann Leckie"]
        );
        assert!(authors(&json!({})).is_empty());
    }

    #[test]
    fn isbns_come_from_book_and_editions() {
        let book = json!({
            "isbn13": "978-0-441-01359-3",
            "editions": [{"isbn_10": "0441013597"}, {"isbn_13": "9780441013593"}],
            "default_physical_edition": {"isbn_13": null}
        });
        assert_eq!(isbns(&book), vec!["9780441013593", "0441013597"]);
        assert!(isbns(&json!({"title": "No ISBN"})).is_empty());
    }

    #[test]
    fn source_key_prefers_id_then_slug_then_title() {
        assert_eq!(source_key(&json!({"id": 42, "slug": "x"})).unwrap(), "id:42");
        assert_eq!(source_key(&json!({"slug": "dune", "title": "Dune"})).unwrap(), "slug:dune");
        assert_eq!(source_key(&json!({"title": "  The  Dune "})).unwrap(), "title:the dune");
        assert!(source_key(&json!({"id": ""})).is_none());
    }

    #[test]
    fn normalizers() {
        assert_eq!(normalize_title("  The   Fifth\tSeason "), "the fifth season");
        assert_eq!(normalize_isbn("0-19-852663-x").unwrap(), "019852663X");
        assert!(normalize_isbn(" - ").is_none());
    }

    #[test]
    fn rating_accepts_numbers_and_numeric_strings() {
        assert_eq!(rating(&json!({"rating": 4.2})), Some(4.2));
        assert_eq!(rating(&json!({"average_rating": "3.5"})), Some(3.5));
        assert_eq!(rating(&json!({"rating": null})), None);
    }
}
