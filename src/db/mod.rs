//! Database module: schema, view models and SQL repositories.
//!
//! - `schema`: self-migrating table definitions.
//! - `model`: view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules import from `shelf_sync::db`; the repository API and the
//! commonly used view models are re-exported here.

pub mod model;
pub mod repo;
pub mod schema;

pub use repo::*;

pub use model::{
    MirrorStats, NewSuggestion, ReplaceOutcome, ScanReconcile, SuggestionUpsert, WantedReplace,
};
