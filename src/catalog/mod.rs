use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Value};
use std::any::Any;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::catalog::model::{CatalogList, GraphQlRequest, GraphQlResponse};
use crate::config;

pub mod model;

/// Fields requested for every book document.
const BOOK_FIELDS: &str = "id slug title alternative_titles rating cached_tags cached_contributors \
release_date default_physical_edition { isbn_13 isbn_10 } default_ebook_edition { isbn_13 isbn_10 }";

const WANT_TO_READ_STATUS: i64 = 1;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("rate limited by catalog (429)")]
    RateLimited,
    #[error("catalog returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("catalog query failed: {0}")]
    GraphQl(String),
    #[error("catalog transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid catalog response: {0}")]
    Decode(String),
}

impl CatalogError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, CatalogError::RateLimited)
    }
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// Operations the sync pipeline needs from the external book catalog.
///
/// Books come back as opaque JSON documents; use [`crate::payload`] to read
/// fields out of them.
#[async_trait]
pub trait CatalogService: Send + Sync + Any {
    async fn search_by_isbn(&self, isbn: &str) -> CatalogResult<Vec<Value>>;

    async fn search_by_title(&self, title: &str) -> CatalogResult<Vec<Value>>;

    /// Lists that contain `book_id`, newest first.
    async fn lists_containing(&self, book_id: &str, limit: u32)
        -> CatalogResult<Vec<CatalogList>>;

    async fn list_books(&self, list_id: &str, limit: u32) -> CatalogResult<Vec<Value>>;

    async fn add_to_list(&self, list_id: &str, book_id: &str) -> CatalogResult<()>;

    /// Books on the authenticated user's want-to-read shelf.
    async fn want_to_read(&self) -> CatalogResult<Vec<Value>>;

    async fn remove_want_to_read(&self, book_id: &str) -> CatalogResult<()>;
}

#[derive(Clone)]
pub struct CatalogClient {
    http: Client,
    endpoint: Url,
    token: String,
}

impl fmt::Debug for CatalogClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl CatalogClient {
    pub fn new(endpoint: Url, token: String) -> CatalogResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("shelf-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            endpoint,
            token,
        })
    }

    pub fn from_config(cfg: &config::Catalog) -> CatalogResult<Self> {
        let endpoint = Url::parse(cfg.endpoint.trim())
            .map_err(|e| CatalogError::Decode(format!("invalid endpoint: {e}")))?;
        Self::new(endpoint, cfg.token.clone())
    }

    pub fn build_request(&self, query: &str, variables: Value) -> CatalogResult<reqwest::Request> {
        let body = GraphQlRequest { query, variables };
        let token = self.token.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        Ok(self
            .http
            .post(self.endpoint.clone())
            .header("Authorization", format!("Bearer {token}"))
            .header("Content-Type", "application/json")
            .json(&body)
            .build()?)
    }

    /// Run one GraphQL operation and return its `data`.
    async fn execute(&self, query: &str, variables: Value) -> CatalogResult<Value> {
        let request = self.build_request(query, variables)?;
        debug!(url = %request.url(), "catalog request");
        let res = self.http.execute(request).await?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("rate limited by catalog");
            return Err(CatalogError::RateLimited);
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "catalog error response");
            return Err(CatalogError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = res.text().await?;
        parse_response(&text)
    }
}

/// Decode a `{data, errors}` envelope. A non-empty `errors` array fails the
/// call even when the HTTP status was 200.
pub fn parse_response(body: &str) -> CatalogResult<Value> {
    let parsed: GraphQlResponse =
        serde_json::from_str(body).map_err(|e| CatalogError::Decode(e.to_string()))?;
    if let Some(errors) = parsed.errors.filter(|e| !e.is_empty()) {
        let message = errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(CatalogError::GraphQl(message));
    }
    Ok(parsed.data.unwrap_or(Value::Null))
}

/// Catalog ids are integers on the wire; anything else is passed as a string.
fn id_variable(id: &str) -> Value {
    match id.trim().parse::<i64>() {
        Ok(n) => json!(n),
        Err(_) => json!(id.trim()),
    }
}

pub fn build_isbn_query(isbn: &str) -> (String, Value) {
    let query = format!(
        "query BooksByIsbn($isbn: String!) {{ editions(where: {{_or: [{{isbn_13: {{_eq: $isbn}}}}, {{isbn_10: {{_eq: $isbn}}}}]}}, limit: 5) {{ book {{ {BOOK_FIELDS} }} }} }}"
    );
    (query, json!({ "isbn": isbn }))
}

/// Escape `ILIKE` wildcards so only the surrounding `%` act as patterns.
fn ilike_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Case-insensitive substring search on the title.
pub fn build_title_query(title: &str) -> (String, Value) {
    let query = format!(
        "query BooksByTitle($title: String!) {{ books(where: {{title: {{_ilike: $title}}}}, limit: 10, order_by: {{users_count: desc}}) {{ {BOOK_FIELDS} }} }}"
    );
    let pattern = format!("%{}%", ilike_literal(title.trim()));
    (query, json!({ "title": pattern }))
}

pub fn build_lists_query(book_id: &str, limit: u32) -> (String, Value) {
    let query = "query ListsForBook($bookId: Int!, $limit: Int!) { list_books(where: {book_id: {_eq: $bookId}}, limit: $limit, order_by: {list: {created_at: desc}}) { list { id name created_at } } }".to_string();
    (query, json!({ "bookId": id_variable(book_id), "limit": limit }))
}

pub fn build_list_books_query(list_id: &str, limit: u32) -> (String, Value) {
    let query = format!(
        "query BooksInList($listId: Int!, $limit: Int!) {{ list_books(where: {{list_id: {{_eq: $listId}}}}, limit: $limit, order_by: {{position: asc}}) {{ book {{ {BOOK_FIELDS} }} }} }}"
    );
    (query, json!({ "listId": id_variable(list_id), "limit": limit }))
}

pub fn build_add_to_list_mutation(list_id: &str, book_id: &str) -> (String, Value) {
    let query = "mutation AddToList($listId: Int!, $bookId: Int!) { insert_list_book(object: {list_id: $listId, book_id: $bookId}) { id } }".to_string();
    (
        query,
        json!({ "listId": id_variable(list_id), "bookId": id_variable(book_id) }),
    )
}

pub fn build_want_to_read_query() -> (String, Value) {
    let query = format!(
        "query WantToRead($status: Int!) {{ me {{ user_books(where: {{status_id: {{_eq: $status}}}}) {{ book {{ {BOOK_FIELDS} }} }} }} }}"
    );
    (query, json!({ "status": WANT_TO_READ_STATUS }))
}

pub fn build_remove_want_to_read_mutation(book_id: &str) -> (String, Value) {
    let query = "mutation RemoveWantToRead($bookId: Int!, $status: Int!) { delete_user_books(where: {book_id: {_eq: $bookId}, status_id: {_eq: $status}}) { affected_rows } }".to_string();
    (
        query,
        json!({ "bookId": id_variable(book_id), "status": WANT_TO_READ_STATUS }),
    )
}

fn array_at<'a>(data: &'a Value, key: &str) -> &'a [Value] {
    data.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Pull `row.book` out of each row, skipping rows without a book.
pub fn books_from_rows(rows: &[Value]) -> Vec<Value> {
    rows.iter()
        .filter_map(|row| row.get("book"))
        .filter(|book| book.is_object())
        .cloned()
        .collect()
}

pub fn lists_from_rows(rows: &[Value]) -> Vec<CatalogList> {
    let mut seen = std::collections::HashSet::new();
    rows.iter()
        .filter_map(|row| row.get("list"))
        .filter_map(|list| {
            let id = crate::payload::external_id(list)?;
            let name = list
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let created_at = list
                .get("created_at")
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(CatalogList {
                id,
                name,
                created_at,
            })
        })
        .filter(|list| seen.insert(list.id.clone()))
        .collect()
}

/// `me` is an array on some deployments and an object on others.
pub fn want_to_read_from_data(data: &Value) -> Vec<Value> {
    let me = match data.get("me") {
        Some(Value::Array(items)) => items.first().cloned().unwrap_or(Value::Null),
        Some(other) => other.clone(),
        None => Value::Null,
    };
    books_from_rows(array_at(&me, "user_books"))
}

#[async_trait]
impl CatalogService for CatalogClient {
    async fn search_by_isbn(&self, isbn: &str) -> CatalogResult<Vec<Value>> {
        let (query, variables) = build_isbn_query(isbn);
        let data = self.execute(&query, variables).await?;
        Ok(books_from_rows(array_at(&data, "editions")))
    }

    async fn search_by_title(&self, title: &str) -> CatalogResult<Vec<Value>> {
        let (query, variables) = build_title_query(title);
        let data = self.execute(&query, variables).await?;
        Ok(array_at(&data, "books").to_vec())
    }

    async fn lists_containing(
        &self,
        book_id: &str,
        limit: u32,
    ) -> CatalogResult<Vec<CatalogList>> {
        let (query, variables) = build_lists_query(book_id, limit);
        let data = self.execute(&query, variables).await?;
        Ok(lists_from_rows(array_at(&data, "list_books")))
    }

    async fn list_books(&self, list_id: &str, limit: u32) -> CatalogResult<Vec<Value>> {
        let (query, variables) = build_list_books_query(list_id, limit);
        let data = self.execute(&query, variables).await?;
        Ok(books_from_rows(array_at(&data, "list_books")))
    }

    async fn add_to_list(&self, list_id: &str, book_id: &str) -> CatalogResult<()> {
        let (query, variables) = build_add_to_list_mutation(list_id, book_id);
        self.execute(&query, variables).await?;
        Ok(())
    }

    async fn want_to_read(&self) -> CatalogResult<Vec<Value>> {
        let (query, variables) = build_want_to_read_query();
        let data = self.execute(&query, variables).await?;
        Ok(want_to_read_from_data(&data))
    }

    async fn remove_want_to_read(&self, book_id: &str) -> CatalogResult<()> {
        let (query, variables) = build_remove_want_to_read_mutation(book_id);
        self.execute(&query, variables).await?;
        Ok(())
    }
}
