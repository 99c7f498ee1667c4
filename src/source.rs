//! Read-only access to a Calibre `metadata.db`.
//!
//! Libraries differ in which link tables and `books` columns they carry, so
//! the database is inspected once when opened and the result kept as a
//! [`SourcePlan`]. Reads then only touch what the plan says exists.

use crate::db::schema::table_columns;
use crate::model::LibraryRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Optional tables and columns present in the opened library.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePlan {
    pub books_path: bool,
    pub books_has_cover: bool,
    pub books_timestamp: bool,
    pub books_pubdate: bool,
    pub books_isbn: bool,
    pub books_last_modified: bool,
    pub authors: bool,
    pub identifiers: bool,
    pub ratings: bool,
    pub tags: bool,
    pub publishers: bool,
    pub series: bool,
    pub formats: bool,
    pub comments: bool,
}

pub async fn detect_plan(pool: &SqlitePool) -> Result<SourcePlan> {
    let tables: HashSet<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
            .fetch_all(pool)
            .await
            .context("failed to list library tables")?
            .into_iter()
            .collect();
    if !tables.contains("books") {
        anyhow::bail!("library database has no books table");
    }
    let cols = table_columns(pool, "books").await?;
    let has = |names: &[&str]| names.iter().all(|n| tables.contains(*n));

    Ok(SourcePlan {
        books_path: cols.contains("path"),
        books_has_cover: cols.contains("has_cover"),
        books_timestamp: cols.contains("timestamp"),
        books_pubdate: cols.contains("pubdate"),
        books_isbn: cols.contains("isbn"),
        books_last_modified: cols.contains("last_modified"),
        authors: has(&["authors", "books_authors_link"]),
        identifiers: has(&["identifiers"]),
        ratings: has(&["ratings", "books_ratings_link"]),
        tags: has(&["tags", "books_tags_link"]),
        publishers: has(&["publishers", "books_publishers_link"]),
        series: has(&["series", "books_series_link"]),
        formats: has(&["data"]),
        comments: has(&["comments"]),
    })
}

/// Parse Calibre's timestamp text. Calibre stores "undefined" dates as year 101.
fn parse_calibre_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let parsed = DateTime::parse_from_rfc3339(&raw.replacen(' ', "T", 1))
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z").map(|dt| dt.with_timezone(&Utc))
        })
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").map(|n| n.and_utc())
        })
        .ok()?;
    (parsed.year() > 101).then_some(parsed)
}

type Multi = HashMap<i64, Vec<String>>;

async fn load_multi(pool: &SqlitePool, sql: &str) -> Result<Multi> {
    let rows: Vec<(i64, String)> = sqlx::query_as(sql).fetch_all(pool).await?;
    let mut out: Multi = HashMap::new();
    for (book, value) in rows {
        let value = value.trim().to_string();
        if !value.is_empty() {
            out.entry(book).or_default().push(value);
        }
    }
    Ok(out)
}

pub struct LibrarySource {
    pool: SqlitePool,
    plan: SourcePlan,
    root: PathBuf,
}

impl LibrarySource {
    /// Open `{root}/{metadata_file}` read-only and detect its capabilities.
    pub async fn open(root: &Path, metadata_file: &str) -> Result<Self> {
        let db_path = root.join(metadata_file);
        if !db_path.is_file() {
            anyhow::bail!("library database not found: {}", db_path.display());
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .read_only(true)
            .busy_timeout(std::time::Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        let plan = detect_plan(&pool).await?;
        debug!(?plan, "library capabilities detected");
        Ok(Self {
            pool,
            plan,
            root: root.to_path_buf(),
        })
    }

    pub fn plan(&self) -> &SourcePlan {
        &self.plan
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every book in the library, ordered by id.
    #[instrument(skip_all)]
    pub async fn read_all(&self) -> Result<Vec<LibraryRecord>> {
        let plan = &self.plan;
        let opt = |present: bool, column: &str| {
            if present {
                column.to_string()
            } else {
                format!("NULL AS {column}")
            }
        };
        let sql = format!(
            "SELECT id, title, {}, {}, {}, {}, {}, {} FROM books ORDER BY id",
            opt(plan.books_path, "path"),
            if plan.books_has_cover {
                "has_cover".to_string()
            } else {
                "0 AS has_cover".to_string()
            },
            opt(plan.books_timestamp, "timestamp"),
            opt(plan.books_pubdate, "pubdate"),
            opt(plan.books_isbn, "isbn"),
            opt(plan.books_last_modified, "last_modified"),
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("failed to read books")?;

        let authors = if plan.authors {
            load_multi(
                &self.pool,
                "SELECT l.book, a.name FROM books_authors_link l JOIN authors a ON a.id = l.author ORDER BY l.id",
            )
            .await?
        } else {
            Multi::new()
        };
        let isbns = if plan.identifiers {
            load_multi(
                &self.pool,
                "SELECT book, val FROM identifiers WHERE lower(type) = 'isbn' ORDER BY id",
            )
            .await?
        } else {
            Multi::new()
        };
        let tags = if plan.tags {
            load_multi(
                &self.pool,
                "SELECT l.book, t.name FROM books_tags_link l JOIN tags t ON t.id = l.tag ORDER BY t.name",
            )
            .await?
        } else {
            Multi::new()
        };
        let publishers = if plan.publishers {
            load_multi(
                &self.pool,
                "SELECT l.book, p.name FROM books_publishers_link l JOIN publishers p ON p.id = l.publisher",
            )
            .await?
        } else {
            Multi::new()
        };
        let series = if plan.series {
            load_multi(
                &self.pool,
                "SELECT l.book, s.name FROM books_series_link l JOIN series s ON s.id = l.series",
            )
            .await?
        } else {
            Multi::new()
        };
        let comments = if plan.comments {
            load_multi(&self.pool, "SELECT book, text FROM comments").await?
        } else {
            Multi::new()
        };

        let ratings: HashMap<i64, f64> = if plan.ratings {
            let rows: Vec<(i64, i64)> = sqlx::query_as(
                "SELECT l.book, r.rating FROM books_ratings_link l JOIN ratings r ON r.id = l.rating",
            )
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter()
                .filter(|(_, r)| *r > 0)
                .map(|(book, r)| (book, r as f64 / 2.0))
                .collect()
        } else {
            HashMap::new()
        };

        let mut formats: Multi = HashMap::new();
        let mut sizes: HashMap<i64, i64> = HashMap::new();
        if plan.formats {
            let rows: Vec<(i64, String, Option<i64>)> =
                sqlx::query_as("SELECT book, format, uncompressed_size FROM data ORDER BY format")
                    .fetch_all(&self.pool)
                    .await?;
            for (book, format, size) in rows {
                formats.entry(book).or_default().push(format.to_uppercase());
                *sizes.entry(book).or_default() += size.unwrap_or(0);
            }
        }

        let now = Utc::now();
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let title: Option<String> = row.try_get("title")?;
            let mut record = LibraryRecord::new(id, title.unwrap_or_default());
            record.relative_path = row.try_get("path")?;
            record.has_cover = row.try_get::<Option<bool>, _>("has_cover")?.unwrap_or(false);
            record.added_at = parse_calibre_time(row.try_get("timestamp")?);
            record.published_at = parse_calibre_time(row.try_get("pubdate")?);
            record.updated_at = parse_calibre_time(row.try_get("last_modified")?).unwrap_or(now);

            let books_isbn: Option<String> = row.try_get("isbn")?;
            record.isbn = isbns
                .get(&id)
                .and_then(|v| v.first().cloned())
                .or(books_isbn.filter(|s| !s.trim().is_empty()));
            record.authors = authors.get(&id).cloned().unwrap_or_default();
            record.tags = tags.get(&id).cloned().unwrap_or_default();
            record.publisher = publishers.get(&id).and_then(|v| v.first().cloned());
            record.series = series.get(&id).and_then(|v| v.first().cloned());
            record.description = comments.get(&id).and_then(|v| v.first().cloned());
            record.rating = ratings.get(&id).copied();
            record.formats = formats.get(&id).cloned().unwrap_or_default();
            record.size_mb = sizes
                .get(&id)
                .filter(|bytes| **bytes > 0)
                .map(|bytes| (*bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0);
            records.push(record);
        }
        info!(count = records.len(), "library snapshot read");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn writable(path: &Path) -> SqlitePool {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap()
    }

    async fn exec(pool: &SqlitePool, sql: &str) {
        sqlx::query(sql).execute(pool).await.unwrap();
    }

    #[test]
    fn calibre_times_parse_and_undefined_is_none() {
        let dt = parse_calibre_time(Some("2023-01-15 10:20:30.123456+00:00".into())).unwrap();
        assert_eq!(dt.year(), 2023);
        assert!(parse_calibre_time(Some("0101-01-01 00:00:00+00:00".into())).is_none());
        assert!(parse_calibre_time(Some("".into())).is_none());
        assert!(parse_calibre_time(None).is_none());
    }

    #[tokio::test]
    async fn minimal_library_degrades_gracefully() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("metadata.db");
        let pool = writable(&db).await;
        exec(&pool, "CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT)").await;
        exec(&pool, "INSERT INTO books (id, title) VALUES (1, 'Dune'), (2, 'Emma')").await;
        pool.close().await;

        let source = LibrarySource::open(dir.path(), "metadata.db").await.unwrap();
        assert_eq!(source.plan(), &SourcePlan::default());
        let records = source.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].title, "Dune");
        assert!(records[0].authors.is_empty());
        assert!(!records[0].has_cover);
    }

    #[tokio::test]
    async fn full_library_reads_linked_metadata() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("metadata.db");
        let pool = writable(&db).await;
        for sql in [
            "CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT, path TEXT, has_cover BOOL, timestamp TEXT, pubdate TEXT, isbn TEXT, last_modified TEXT)",
            "CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT)",
            "CREATE TABLE books_authors_link (id INTEGER PRIMARY KEY, book INTEGER, author INTEGER)",
            "CREATE TABLE identifiers (id INTEGER PRIMARY KEY, book INTEGER, type TEXT, val TEXT)",
            "CREATE TABLE ratings (id INTEGER PRIMARY KEY, rating INTEGER)",
            "CREATE TABLE books_ratings_link (id INTEGER PRIMARY KEY, book INTEGER, rating INTEGER)",
            "CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT)",
            "CREATE TABLE books_tags_link (id INTEGER PRIMARY KEY, book INTEGER, tag INTEGER)",
            "CREATE TABLE data (id INTEGER PRIMARY KEY, book INTEGER, format TEXT, uncompressed_size INTEGER)",
            "INSERT INTO books VALUES (1, 'Dune', 'Frank Herbert/Dune (1)', 1, '2023-01-15 10:20:30+00:00', '0101-01-01 00:00:00+00:00', '', '2023-02-01 00:00:00+00:00')",
            "INSERT INTO authors VALUES (1, 'Frank Herbert')",
            "INSERT INTO books_authors_link VALUES (1, 1, 1)",
            "INSERT INTO identifiers VALUES (1, 1, 'isbn', '978-0-441-17271-9')",
            "INSERT INTO ratings VALUES (1, 8)",
            "INSERT INTO books_ratings_link VALUES (1, 1, 1)",
            "INSERT INTO tags VALUES (1, 'Science Fiction')",
            "INSERT INTO books_tags_link VALUES (1, 1, 1)",
            "INSERT INTO data VALUES (1, 1, 'epub', 2097152)",
        ] {
            exec(&pool, sql).await;
        }
        pool.close().await;

        let source = LibrarySource::open(dir.path(), "metadata.db").await.unwrap();
        assert!(source.plan().authors);
        assert!(!source.plan().series);
        let records = source.read_all().await.unwrap();
        let dune = &records[0];
        assert_eq!(dune.authors, vec!["Frank Herbert".to_string()]);
        assert_eq!(dune.isbn.as_deref(), Some("978-0-441-17271-9"));
        assert_eq!(dune.rating, Some(4.0));
        assert_eq!(dune.tags, vec!["Science Fiction".to_string()]);
        assert_eq!(dune.formats, vec!["EPUB".to_string()]);
        assert_eq!(dune.size_mb, Some(2.0));
        assert!(dune.has_cover);
        assert!(dune.added_at.is_some());
        assert!(dune.published_at.is_none());
        assert_eq!(dune.relative_path.as_deref(), Some("Frank Herbert/Dune (1)"));
    }

    #[tokio::test]
    async fn missing_database_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(LibrarySource::open(dir.path(), "metadata.db").await.is_err());
    }
}
