use anyhow::{Context, Result};
use chrono::Duration;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub curator: CuratorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Optional capacity limit in bytes, mirroring the browser store quota.
    #[serde(default)]
    pub quota_bytes: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            quota_bytes: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./collectio-data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// How long a delete stays undoable.
    #[serde(default = "default_undo_ttl_ms")]
    pub undo_ttl_ms: i64,
    /// Coalescing window for persistence writes.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: i64,
    /// How long the duplicate-detected signal stays raised.
    #[serde(default = "default_duplicate_signal_ms")]
    pub duplicate_signal_ms: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            undo_ttl_ms: default_undo_ttl_ms(),
            debounce_ms: default_debounce_ms(),
            duplicate_signal_ms: default_duplicate_signal_ms(),
        }
    }
}

fn default_undo_ttl_ms() -> i64 {
    5000
}
fn default_debounce_ms() -> i64 {
    500
}
fn default_duplicate_signal_ms() -> i64 {
    4000
}

impl LifecycleConfig {
    pub fn undo_ttl(&self) -> Duration {
        Duration::milliseconds(self.undo_ttl_ms)
    }
    pub fn debounce(&self) -> Duration {
        Duration::milliseconds(self.debounce_ms)
    }
    pub fn duplicate_signal(&self) -> Duration {
        Duration::milliseconds(self.duplicate_signal_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CuratorConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
}

impl Default for CuratorConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
        }
    }
}

fn default_provider() -> String {
    "keyword".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.lifecycle.undo_ttl_ms <= 0 {
        anyhow::bail!("lifecycle.undo_ttl_ms must be > 0");
    }
    if config.lifecycle.debounce_ms <= 0 {
        anyhow::bail!("lifecycle.debounce_ms must be > 0");
    }
    if config.lifecycle.duplicate_signal_ms <= 0 {
        anyhow::bail!("lifecycle.duplicate_signal_ms must be > 0");
    }

    match config.indexer.provider.as_str() {
        "keyword" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown indexer provider: '{}'. Must be keyword or disabled.",
            other
        ),
    }
    match config.curator.provider.as_str() {
        "keyword" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown curator provider: '{}'. Must be keyword or disabled.",
            other
        ),
    }

    Ok(())
}
