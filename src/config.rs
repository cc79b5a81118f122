//! Engine configuration, persisted as TOML in the app data directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const CONFIG_FILENAME: &str = "config.toml";
const APP_DIR: &str = "notes-smart-index";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite file holding the vector store.
    pub store_path: PathBuf,
    /// Where the ONNX model files are cached.
    pub model_cache_dir: PathBuf,
    pub source: SourceConfig,
    pub indexing: IndexingConfig,
    pub search: SearchConfig,
    pub watcher: WatcherConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Joplin database path. Auto-detected when unset.
    pub joplin_db: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub batch_size: usize,
    pub workers: usize,
    pub embed_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_limit: usize,
    pub max_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_secs: u64,
    /// Quiet period after a change before a cycle is triggered.
    pub debounce_secs: u64,
    pub retry_initial_ms: u64,
    pub retry_max_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = app_data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            store_path: data_dir.join("index.sqlite"),
            model_cache_dir: data_dir.join("models"),
            source: SourceConfig::default(),
            indexing: IndexingConfig::default(),
            search: SearchConfig::default(),
            watcher: WatcherConfig::default(),
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            workers: 4,
            embed_timeout_secs: 30,
            fetch_timeout_secs: 120,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            max_limit: 200,
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            debounce_secs: 5,
            retry_initial_ms: 500,
            retry_max_secs: 60,
        }
    }
}

impl IndexingConfig {
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_secs(self.retry_max_secs)
    }
}

impl EngineConfig {
    /// Load from `path`, or from the app data directory when `path` is None.
    /// A missing default file yields the default config; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Read(path, e)),
        };

        let config: Self = toml::from_str(&text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty TOML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let s = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write(path.to_path_buf(), e))?;
        }
        std::fs::write(path, s).map_err(|e| ConfigError::Write(path.to_path_buf(), e))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.indexing.batch_size == 0 {
            return Err(ConfigError::Invalid("indexing.batch_size must be at least 1"));
        }
        if self.indexing.workers == 0 {
            return Err(ConfigError::Invalid("indexing.workers must be at least 1"));
        }
        if self.search.default_limit == 0 || self.search.default_limit > self.search.max_limit {
            return Err(ConfigError::Invalid(
                "search.default_limit must be between 1 and search.max_limit",
            ));
        }
        if self.watcher.retry_initial_ms == 0 {
            return Err(ConfigError::Invalid("watcher.retry_initial_ms must be at least 1"));
        }
        Ok(())
    }
}

/// `<platform data dir>/notes-smart-index`, if the platform has one.
pub fn app_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join(APP_DIR))
}

/// Where [`EngineConfig::load`] looks when no path is given.
pub fn default_config_path() -> Option<PathBuf> {
    app_data_dir().map(|d| d.join(CONFIG_FILENAME))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("failed to write config {0}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}
