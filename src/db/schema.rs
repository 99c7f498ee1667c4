//! Self-migrating SQLite schema.
//!
//! Tables are created when absent, then every expected column is checked with
//! `pragma_table_info` and added when missing. Migrations are additive only,
//! with one exception: stores created before identity mappings existed carry
//! a `library_books.hardcover_slug` column, which is dropped by rebuilding the
//! table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::collections::HashSet;
use tracing::{info, instrument};

const CREATE_LIBRARY_BOOKS: &str = r#"
CREATE TABLE IF NOT EXISTS library_books (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    authors_json TEXT NOT NULL DEFAULT '[]',
    isbn TEXT,
    rating REAL,
    added_at TEXT,
    published_at TEXT,
    relative_path TEXT,
    has_cover INTEGER NOT NULL DEFAULT 0,
    formats_json TEXT NOT NULL DEFAULT '[]',
    tags_json TEXT NOT NULL DEFAULT '[]',
    publisher TEXT,
    series TEXT,
    size_mb REAL,
    description TEXT,
    cover_url TEXT,
    external_id TEXT,
    updated_at TEXT NOT NULL
)"#;

const CREATE_IDENTITY_MAPPINGS: &str = r#"
CREATE TABLE IF NOT EXISTS identity_mappings (
    local_id INTEGER PRIMARY KEY,
    external_id TEXT,
    checked_at TEXT NOT NULL,
    last_error TEXT
)"#;

const CREATE_CATALOG_SCAN: &str = r#"
CREATE TABLE IF NOT EXISTS catalog_scan (
    local_id INTEGER PRIMARY KEY,
    local_title TEXT NOT NULL,
    external_id TEXT,
    external_title TEXT,
    lists_found INTEGER NOT NULL DEFAULT 0,
    recommendations_found INTEGER NOT NULL DEFAULT 0,
    checked_at TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    base_genres_json TEXT NOT NULL DEFAULT '[]',
    lists_json TEXT NOT NULL DEFAULT '[]',
    recommendations_json TEXT NOT NULL DEFAULT '[]'
)"#;

const CREATE_SUGGESTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS suggestions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_key TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    base_genres_json TEXT NOT NULL DEFAULT '[]',
    reasons_json TEXT NOT NULL DEFAULT '[]',
    hidden INTEGER NOT NULL DEFAULT 0,
    score INTEGER,
    rank INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)"#;

const CREATE_WANTED: &str = r#"
CREATE TABLE IF NOT EXISTS wanted (
    key TEXT PRIMARY KEY,
    payload_json TEXT NOT NULL,
    source TEXT NOT NULL DEFAULT 'manual',
    created_at TEXT NOT NULL
)"#;

const CREATE_MIRROR_META: &str = r#"
CREATE TABLE IF NOT EXISTS mirror_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)"#;

const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_suggestions_source_key ON suggestions(source_key)",
    "CREATE INDEX IF NOT EXISTS idx_catalog_scan_status ON catalog_scan(status)",
];

/// Columns that later versions added, with definitions usable in `ALTER TABLE`.
const ADDITIVE_COLUMNS: &[(&str, &str, &str)] = &[
    ("library_books", "authors_json", "TEXT NOT NULL DEFAULT '[]'"),
    ("library_books", "isbn", "TEXT"),
    ("library_books", "rating", "REAL"),
    ("library_books", "added_at", "TEXT"),
    ("library_books", "published_at", "TEXT"),
    ("library_books", "relative_path", "TEXT"),
    ("library_books", "has_cover", "INTEGER NOT NULL DEFAULT 0"),
    ("library_books", "formats_json", "TEXT NOT NULL DEFAULT '[]'"),
    ("library_books", "tags_json", "TEXT NOT NULL DEFAULT '[]'"),
    ("library_books", "publisher", "TEXT"),
    ("library_books", "series", "TEXT"),
    ("library_books", "size_mb", "REAL"),
    ("library_books", "description", "TEXT"),
    ("library_books", "cover_url", "TEXT"),
    ("library_books", "external_id", "TEXT"),
    ("library_books", "updated_at", "TEXT NOT NULL DEFAULT '1970-01-01T00:00:00+00:00'"),
    ("identity_mappings", "last_error", "TEXT"),
    ("catalog_scan", "external_title", "TEXT"),
    ("catalog_scan", "base_genres_json", "TEXT NOT NULL DEFAULT '[]'"),
    ("catalog_scan", "lists_json", "TEXT NOT NULL DEFAULT '[]'"),
    ("catalog_scan", "recommendations_json", "TEXT NOT NULL DEFAULT '[]'"),
    ("suggestions", "base_genres_json", "TEXT NOT NULL DEFAULT '[]'"),
    ("suggestions", "reasons_json", "TEXT NOT NULL DEFAULT '[]'"),
    ("suggestions", "hidden", "INTEGER NOT NULL DEFAULT 0"),
    ("suggestions", "score", "INTEGER"),
    ("suggestions", "rank", "INTEGER"),
    ("wanted", "source", "TEXT NOT NULL DEFAULT 'manual'"),
];

const LEGACY_LIBRARY_COLUMN: &str = "hardcover_slug";

/// Column names of a table; empty when the table doesn't exist.
pub async fn table_columns(pool: &SqlitePool, table: &str) -> Result<HashSet<String>> {
    let names: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info(?)")
        .bind(table)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to inspect table {table}"))?;
    Ok(names.into_iter().collect())
}

#[instrument(skip_all)]
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for ddl in [
        CREATE_LIBRARY_BOOKS,
        CREATE_IDENTITY_MAPPINGS,
        CREATE_CATALOG_SCAN,
        CREATE_SUGGESTIONS,
        CREATE_WANTED,
        CREATE_MIRROR_META,
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }

    let mut tables: Vec<&str> = ADDITIVE_COLUMNS.iter().map(|(table, _, _)| *table).collect();
    tables.dedup();
    for table in tables {
        let existing = table_columns(pool, table).await?;
        for (_, column, definition) in ADDITIVE_COLUMNS.iter().filter(|(t, _, _)| *t == table) {
            if existing.contains(*column) {
                continue;
            }
            info!(table, column, "adding missing column");
            sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))
                .execute(pool)
                .await
                .with_context(|| format!("failed to add {table}.{column}"))?;
        }
    }

    if table_columns(pool, "library_books")
        .await?
        .contains(LEGACY_LIBRARY_COLUMN)
    {
        rebuild_library_books(pool).await?;
    }

    for ddl in CREATE_INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

/// Drop the legacy slug column by copying into a fresh table.
async fn rebuild_library_books(pool: &SqlitePool) -> Result<()> {
    info!(column = LEGACY_LIBRARY_COLUMN, "rebuilding library_books without legacy column");
    let keep: Vec<&str> = std::iter::once("id")
        .chain(std::iter::once("title"))
        .chain(
            ADDITIVE_COLUMNS
                .iter()
                .filter(|(table, _, _)| *table == "library_books")
                .map(|(_, column, _)| *column),
        )
        .collect();
    let columns = keep.join(", ");

    let mut tx = pool.begin().await?;
    sqlx::query(&CREATE_LIBRARY_BOOKS.replace("library_books", "library_books_rebuild"))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&format!(
        "INSERT INTO library_books_rebuild ({columns}) SELECT {columns} FROM library_books"
    ))
    .execute(&mut *tx)
    .await?;
    sqlx::query("DROP TABLE library_books")
        .execute(&mut *tx)
        .await?;
    sqlx::query("ALTER TABLE library_books_rebuild RENAME TO library_books")
        .execute(&mut *tx)
        .await?;
    tx.commit().await.context("legacy library_books rebuild failed")?;
    Ok(())
}
