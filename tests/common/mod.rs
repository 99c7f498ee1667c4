#![allow(dead_code)]

use serde_json::Value;
use shelf_sync::catalog::model::CatalogList;
use shelf_sync::catalog::{CatalogError, CatalogResult, CatalogService};
use shelf_sync::db::{self, Pool};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub async fn setup_pool() -> Pool {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

/// In-memory catalog that records every call.
#[derive(Clone, Default)]
pub struct RecordingCatalog {
    isbn_results: Arc<Mutex<HashMap<String, Vec<Value>>>>,
    title_results: Arc<Mutex<HashMap<String, Vec<Value>>>>,
    lists: Arc<Mutex<HashMap<String, Vec<CatalogList>>>>,
    list_books: Arc<Mutex<HashMap<String, Vec<Value>>>>,
    want: Arc<Mutex<Vec<Value>>>,
    add_responses: Arc<Mutex<VecDeque<CatalogResult<()>>>>,
    failing: Arc<Mutex<bool>>,
    cancel_on_call: Arc<Mutex<Option<CancellationToken>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingCatalog {
    pub async fn on_isbn(&self, isbn: &str, books: Vec<Value>) {
        self.isbn_results.lock().await.insert(isbn.to_string(), books);
    }

    pub async fn on_title(&self, title: &str, books: Vec<Value>) {
        self.title_results
            .lock()
            .await
            .insert(title.to_lowercase(), books);
    }

    pub async fn on_lists(&self, book_id: &str, lists: Vec<CatalogList>) {
        self.lists.lock().await.insert(book_id.to_string(), lists);
    }

    pub async fn on_list_books(&self, list_id: &str, books: Vec<Value>) {
        self.list_books
            .lock()
            .await
            .insert(list_id.to_string(), books);
    }

    pub async fn set_want_to_read(&self, books: Vec<Value>) {
        *self.want.lock().await = books;
    }

    pub async fn queue_add_responses(&self, responses: Vec<CatalogResult<()>>) {
        self.add_responses.lock().await.extend(responses);
    }

    /// Make every lookup fail with a server error.
    pub async fn set_failing(&self, failing: bool) {
        *self.failing.lock().await = failing;
    }

    /// Cancel `token` as soon as the next catalog call arrives.
    pub async fn cancel_on_next_call(&self, token: CancellationToken) {
        *self.cancel_on_call.lock().await = Some(token);
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    pub async fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .await
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    async fn record(&self, call: String) -> CatalogResult<()> {
        self.calls.lock().await.push(call);
        if let Some(token) = self.cancel_on_call.lock().await.take() {
            token.cancel();
        }
        if *self.failing.lock().await {
            return Err(CatalogError::Status {
                status: 502,
                body: "bad gateway".into(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CatalogService for RecordingCatalog {
    async fn search_by_isbn(&self, isbn: &str) -> CatalogResult<Vec<Value>> {
        self.record(format!("isbn:{isbn}")).await?;
        Ok(self
            .isbn_results
            .lock()
            .await
            .get(isbn)
            .cloned()
            .unwrap_or_default())
    }

    async fn search_by_title(&self, title: &str) -> CatalogResult<Vec<Value>> {
        self.record(format!("title:{title}")).await?;
        Ok(self
            .title_results
            .lock()
            .await
            .get(&title.to_lowercase())
            .cloned()
            .unwrap_or_default())
    }

    async fn lists_containing(&self, book_id: &str, limit: u32) -> CatalogResult<Vec<CatalogList>> {
        self.record(format!("lists:{book_id}")).await?;
        let mut lists = self
            .lists
            .lock()
            .await
            .get(book_id)
            .cloned()
            .unwrap_or_default();
        lists.truncate(limit as usize);
        Ok(lists)
    }

    async fn list_books(&self, list_id: &str, limit: u32) -> CatalogResult<Vec<Value>> {
        self.record(format!("list_books:{list_id}")).await?;
        let mut books = self
            .list_books
            .lock()
            .await
            .get(list_id)
            .cloned()
            .unwrap_or_default();
        books.truncate(limit as usize);
        Ok(books)
    }

    async fn add_to_list(&self, list_id: &str, book_id: &str) -> CatalogResult<()> {
        self.calls
            .lock()
            .await
            .push(format!("add:{list_id}:{book_id}"));
        self.add_responses
            .lock()
            .await
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn want_to_read(&self) -> CatalogResult<Vec<Value>> {
        self.record("want_to_read".into()).await?;
        Ok(self.want.lock().await.clone())
    }

    async fn remove_want_to_read(&self, book_id: &str) -> CatalogResult<()> {
        self.record(format!("remove_want:{book_id}")).await
    }
}

pub fn list(id: &str, name: &str) -> CatalogList {
    CatalogList {
        id: id.into(),
        name: name.into(),
        created_at: None,
    }
}

async fn library_pool(dir: &Path) -> sqlx::SqlitePool {
    let options = SqliteConnectOptions::new()
        .filename(dir.join("metadata.db"))
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap()
}

/// Create a small Calibre-shaped `metadata.db` in `dir`.
pub async fn write_library(dir: &Path, books: &[(i64, &str, Option<&str>)]) {
    let pool = library_pool(dir).await;
    for sql in [
        "CREATE TABLE IF NOT EXISTS books (id INTEGER PRIMARY KEY, title TEXT, path TEXT, has_cover BOOL DEFAULT 0, timestamp TEXT, isbn TEXT)",
        "CREATE TABLE IF NOT EXISTS identifiers (id INTEGER PRIMARY KEY, book INTEGER, type TEXT, val TEXT)",
        "DELETE FROM books",
        "DELETE FROM identifiers",
    ] {
        sqlx::query(sql).execute(&pool).await.unwrap();
    }
    for (id, title, isbn) in books {
        sqlx::query("INSERT INTO books (id, title, path, timestamp) VALUES (?, ?, ?, '2024-01-01 00:00:00+00:00')")
            .bind(id)
            .bind(title)
            .bind(format!("Author/{title} ({id})"))
            .execute(&pool)
            .await
            .unwrap();
        if let Some(isbn) = isbn {
            sqlx::query("INSERT INTO identifiers (book, type, val) VALUES (?, 'isbn', ?)")
                .bind(id)
                .bind(isbn)
                .execute(&pool)
                .await
                .unwrap();
        }
    }
    pool.close().await;
}
