//! Persisted key/value settings
//!
//! Small state the node keeps between runs, such as the network
//! configuration that last opened successfully.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Settings errors
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

/// Key/value store shared by the connection actors
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> SettingsResult<()>;
}

/// Settings held in memory only
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> SettingsResult<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Settings stored as a flat TOML table, rewritten on every change
#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileSettings {
    /// Open the store at `path`; a missing file is an empty store
    pub fn open(path: &Path) -> SettingsResult<Self> {
        let values = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for FileSettings {
    fn get(&self, key: &str) -> Option<String> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> SettingsResult<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());

        let contents = toml::to_string_pretty(&*values)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}
