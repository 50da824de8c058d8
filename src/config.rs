use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::retry::{classify, Backoff, RetryPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub editors: EditorsConfig,

    #[serde(default)]
    pub blobs: BlobConfig,

    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,

    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,

    /// Upper bound for the `limit` of a similarity query.
    #[serde(default = "default_max_similar_results")]
    pub max_similar_results: usize,
}

fn default_page_size() -> u32 {
    50
}

fn default_max_page_size() -> u32 {
    200
}

fn default_max_similar_results() -> usize {
    100
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            max_similar_results: default_max_similar_results(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Attempts allowed for transient faults, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// How long SQLite waits on a locked database before reporting busy.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Connections kept by the pool; each request checks one out.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    25
}

fn default_backoff_max_ms() -> u64 {
    1000
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_pool_size() -> u32 {
    8
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_size: default_pool_size(),
        }
    }
}

impl StorageConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff: Backoff {
                base: Duration::from_millis(self.backoff_base_ms),
                max: Duration::from_millis(self.backoff_max_ms),
            },
            classifier: classify,
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EditorsConfig {
    /// Identities allowed to mutate the catalog. Empty allows any
    /// identity resolved by the upstream identity middleware.
    #[serde(default)]
    pub allowed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    /// Root directory holding the `originals`, `thumbnails` and `default`
    /// containers.
    #[serde(default = "default_blob_root")]
    pub root: PathBuf,
}

fn default_blob_root() -> PathBuf {
    Config::data_dir().join("blobs")
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            root: default_blob_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_image_extensions")]
    pub extensions: Vec<String>,
}

fn default_image_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "tif".to_string(),
        "tiff".to_string(),
    ]
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            extensions: default_image_extensions(),
        }
    }
}

fn default_db_path() -> PathBuf {
    Config::data_dir().join("catalog.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            catalog: CatalogConfig::default(),
            storage: StorageConfig::default(),
            editors: EditorsConfig::default(),
            blobs: BlobConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

impl Config {
    /// Load from `PHOTOCAT_CONFIG` or the default location, writing a default
    /// config file on first run.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var_os("PHOTOCAT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(Self::config_path);

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photocat")
    }

    /// Default home of the catalog file, the blob containers and the
    /// fallback log files.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photocat")
    }

    pub fn log_dir() -> PathBuf {
        Self::data_dir().join("logs")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}
