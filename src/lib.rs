//! Mirror a Calibre library, match it against an external book catalog and
//! keep ranked reading suggestions up to date.

pub mod aggregator;
pub mod catalog;
pub mod config;
pub mod covers;
pub mod db;
pub mod jobs;
pub mod list_push;
pub mod logging;
pub mod model;
pub mod payload;
pub mod ranker;
pub mod resolver;
pub mod source;
pub mod sync;
pub mod wanted;
