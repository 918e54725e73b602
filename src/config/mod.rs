//! Configuration module for MediaFlow-RS
//!
//! This module handles runtime configuration:
//! - [`RuntimeConfig`]: scheduler, node, resource pool and logging settings
//! - [`graph::GraphConfig`]: descriptions of graphs to run
//!
//! Files are TOML unless their extension is `.json`.
//!
//! # App Data Location
//!
//! The default config file lives in the platform-appropriate location:
//! - **Linux**: `~/.local/share/dev.hxyulin.mediaflow-rs/`
//! - **macOS**: `~/Library/Application Support/dev.hxyulin.mediaflow-rs/`
//! - **Windows**: `%APPDATA%\dev.hxyulin.mediaflow-rs\`

pub mod graph;
pub mod settings;

pub use graph::{GraphConfig, LinkConfig, NodeConfig, NodeKind};
pub use settings::*;

use crate::error::{MediaFlowError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for data directories
pub const APP_ID: &str = "dev.hxyulin.mediaflow-rs";

/// Default config filename
pub const CONFIG_FILE: &str = "runtime.toml";

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir().ok_or_else(|| {
        MediaFlowError::Config("Could not determine app data directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            MediaFlowError::Config(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Get the path to the default config file
pub fn default_config_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== File Formats ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Toml,
    Json,
}

impl FileFormat {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => FileFormat::Json,
            _ => FileFormat::Toml,
        }
    }
}

fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| MediaFlowError::Config(format!("Failed to read {:?}: {}", path, e)))?;

    match FileFormat::of(path) {
        FileFormat::Json => serde_json::from_str(&content)
            .map_err(|e| MediaFlowError::Config(format!("Failed to parse {:?}: {}", path, e))),
        FileFormat::Toml => toml::from_str(&content)
            .map_err(|e| MediaFlowError::Config(format!("Failed to parse {:?}: {}", path, e))),
    }
}

fn save_file<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MediaFlowError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }
    }

    let content = match FileFormat::of(path) {
        FileFormat::Json => serde_json::to_string_pretty(value)
            .map_err(|e| MediaFlowError::Serialization(e.to_string()))?,
        FileFormat::Toml => {
            toml::to_string_pretty(value).map_err(|e| MediaFlowError::Serialization(e.to_string()))?
        }
    };

    std::fs::write(path, content)
        .map_err(|e| MediaFlowError::Config(format!("Failed to write {:?}: {}", path, e)))
}

// ==================== Runtime Config ====================

/// Everything the runtime needs besides the graph itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerSettings,

    pub node: NodeSettings,

    /// Counting pools registered with the broker
    pub resources: Vec<PoolSettings>,

    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSettings::default(),
            node: NodeSettings::default(),
            resources: PoolSettings::defaults(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load from a TOML or JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_file(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, returning defaults on any error
    pub fn load_or_default() -> Self {
        let Some(path) = default_config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load runtime config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save to a TOML or JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_file(self, path.as_ref())
    }

    /// Save to the default location
    pub fn save_default(&self) -> Result<PathBuf> {
        let path = ensure_app_data_dir()?.join(CONFIG_FILE);
        self.save(&path)?;
        Ok(path)
    }

    /// Default config as TOML text
    pub fn default_toml() -> Result<String> {
        toml::to_string_pretty(&Self::default())
            .map_err(|e| MediaFlowError::Serialization(e.to_string()))
    }

    pub fn pool(&self, name: &str) -> Option<&PoolSettings> {
        self.resources.iter().find(|p| p.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.command_queue_depth == 0 {
            return Err(MediaFlowError::Config(
                "node.command_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.scheduler.multithreaded && self.scheduler.threads == 0 {
            return Err(MediaFlowError::Config(
                "scheduler.threads must be at least 1".to_string(),
            ));
        }
        for (i, pool) in self.resources.iter().enumerate() {
            if self.resources[..i].iter().any(|p| p.name == pool.name) {
                return Err(MediaFlowError::Config(format!(
                    "resource pool '{}' declared twice",
                    pool.name
                )));
            }
        }
        Ok(())
    }
}

impl GraphConfig {
    /// Load a graph description from a TOML or JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let graph: Self = load_file(path.as_ref())?;
        graph.validate()?;
        Ok(graph)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_file(self, path.as_ref())
    }
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_runtime_config_default() {
        let config = RuntimeConfig::default();
        assert!(config.scheduler.multithreaded);
        assert_eq!(config.resources.len(), 4);
        assert_eq!(config.pool(THREAD_POOL).map(|p| p.capacity), Some(256));
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("runtime.toml");

        let mut config = RuntimeConfig::default();
        config.scheduler.threads = 6;
        config.node.not_ready_backoff_ms = 7;
        config.resources.push(PoolSettings::new("Test.Pool", 3));
        config.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_json_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runtime.json");
        RuntimeConfig::default().save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.trim_start().starts_with('{'));
        assert_eq!(RuntimeConfig::load(&path).unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = RuntimeConfig::default();
        config.node.command_queue_depth = 0;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.resources.push(PoolSettings::new(THREAD_POOL, 1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "scheduler = 3").unwrap();
        match RuntimeConfig::load(&path) {
            Err(MediaFlowError::Config(msg)) => assert!(msg.contains("Failed to parse")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_default_toml_parses() {
        let text = RuntimeConfig::default_toml().unwrap();
        let parsed: RuntimeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, RuntimeConfig::default());
    }
}
