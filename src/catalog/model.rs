use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A user-curated list in the external catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogList {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GraphQlRequest<'a> {
    pub query: &'a str,
    pub variables: Value,
}

#[derive(Debug, Deserialize)]
pub struct GraphQlResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Option<Vec<GraphQlErrorItem>>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQlErrorItem {
    #[serde(default)]
    pub message: String,
}
