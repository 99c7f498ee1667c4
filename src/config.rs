//! Configuration loader and validator for the library sync service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub library: Library,
    pub catalog: Catalog,
    pub schedule: Schedule,
}

/// Where the service keeps its own files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Served content (copied covers) lives here.
    pub content_dir: String,
}

/// Local library source. An empty `path` is allowed here and reported per sync cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Library {
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_metadata_file")]
    pub metadata_file: String,
}

/// External catalog endpoint and scan limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Catalog {
    pub endpoint: String,
    pub token: String,
    /// Newly resolved books are added to this list when set.
    #[serde(default)]
    pub push_list_id: Option<String>,
    pub lists_per_book: u32,
    pub items_per_list: u32,
    #[serde(default)]
    pub min_rating: Option<f64>,
    #[serde(default)]
    pub request_delay_ms: u64,
}

/// Job cadence in minutes; zero disables a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schedule {
    pub library_sync_minutes: u64,
    pub resolve_minutes: u64,
    pub want_to_read_minutes: u64,
    pub dedup_minutes: u64,
    pub resolve_batch_size: u32,
}

fn default_metadata_file() -> String {
    "metadata.db".to_string()
}

impl Config {
    /// Ensure the data and content directories exist.
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        for dir in [&self.app.data_dir, &self.app.content_dir] {
            if !dir.trim().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/shelf-sync.db", self.app.data_dir))
    }

    /// Absolute path of the library metadata database, if a library is configured.
    pub fn metadata_path(&self) -> Option<PathBuf> {
        let root = self.library.path.trim();
        if root.is_empty() {
            return None;
        }
        Some(Path::new(root).join(&self.library.metadata_file))
    }
}

impl Catalog {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }
}

impl Schedule {
    pub fn interval(minutes: u64) -> Duration {
        Duration::from_secs(minutes * 60)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Config, ConfigError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.content_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.content_dir must be non-empty"));
    }
    if cfg.library.metadata_file.trim().is_empty() {
        return Err(ConfigError::Invalid("library.metadata_file must be non-empty"));
    }

    if cfg.catalog.endpoint.trim().is_empty() {
        return Err(ConfigError::Invalid("catalog.endpoint must be non-empty"));
    }
    if reqwest::Url::parse(cfg.catalog.endpoint.trim()).is_err() {
        return Err(ConfigError::Invalid("catalog.endpoint must be an absolute URL"));
    }
    if cfg.catalog.token.trim().is_empty() {
        return Err(ConfigError::Invalid("catalog.token must be non-empty"));
    }
    if cfg.catalog.lists_per_book == 0 {
        return Err(ConfigError::Invalid("catalog.lists_per_book must be > 0"));
    }
    if cfg.catalog.items_per_list == 0 {
        return Err(ConfigError::Invalid("catalog.items_per_list must be > 0"));
    }
    if let Some(min) = cfg.catalog.min_rating {
        if !(0.0..=5.0).contains(&min) {
            return Err(ConfigError::Invalid("catalog.min_rating must be within 0..=5"));
        }
    }

    if cfg.schedule.resolve_batch_size == 0 {
        return Err(ConfigError::Invalid("schedule.resolve_batch_size must be > 0"));
    }

    Ok(())
}

/// Example configuration, also used by tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  content_dir: "./data/content"

library:
  path: "/srv/books/Calibre Library"
  metadata_file: "metadata.db"

catalog:
  endpoint: "https://api.hardcover.app/v1/graphql"
  token: "YOUR_CATALOG_API_TOKEN"
  push_list_id: "12345"
  lists_per_book: 5
  items_per_list: 20
  min_rating: 3.5
  request_delay_ms: 1100

schedule:
  library_sync_minutes: 60
  resolve_minutes: 15
  want_to_read_minutes: 30
  dedup_minutes: 360
  resolve_batch_size: 25
"#
}
