//! mddb Store Configuration Module
//! Handles loading and saving mddb.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::jsonl::TableOptions;

pub const CONFIG_FILE: &str = "mddb.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub version: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub tables: TablesConfig,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TablesConfig {
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            sync_writes: default_sync_writes(),
        }
    }
}

fn default_sync_writes() -> bool {
    true
}

fn default_log_filter() -> String {
    "mddb_store=info".to_string()
}

/// Platform data directory, e.g. `~/.local/share/mddb` on Linux.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mddb")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: default_data_dir(),
            tables: TablesConfig::default(),
            log_filter: default_log_filter(),
        }
    }
}

impl StoreConfig {
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: StoreConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Like [`StoreConfig::load`], but a missing file yields defaults rooted
    /// at `dir`.
    pub fn load_or_default(dir: &Path) -> Result<Self, ConfigError> {
        match Self::load(dir) {
            Err(ConfigError::NotFound(_)) => Ok(Self {
                data_dir: dir.to_path_buf(),
                ..Self::default()
            }),
            other => other,
        }
    }

    pub fn save(&self, dir: &Path) -> Result<(), ConfigError> {
        let config_path = dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Resolve a table name or path against the data directory.
    pub fn table_path(&self, table: &str) -> PathBuf {
        let path = Path::new(table);
        if path.is_absolute() || path.components().count() > 1 {
            return path.to_path_buf();
        }
        let mut path = self.data_dir.join(table);
        if path.extension().is_none() {
            path.set_extension("jsonl");
        }
        path
    }
}

impl From<&StoreConfig> for TableOptions {
    fn from(config: &StoreConfig) -> Self {
        TableOptions::default().with_sync_writes(config.tables.sync_writes)
    }
}
