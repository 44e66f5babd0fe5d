//! WoM Settings
//!
//! JSON-backed configuration files. Each component defines its own config
//! struct with a `Default` impl and persists it through `Settings<T>`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::debug;

/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "WOM_CONFIG_DIR";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(String),
    #[error("Failed to write settings: {0}")]
    WriteError(String),
    #[error("Failed to parse settings: {0}")]
    ParseError(String),
    #[error("Failed to create directory: {0}")]
    CreateDirError(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Settings file holding one config value of type `T`.
///
/// ```ignore
/// let settings: Settings<EngineConfig> = Settings::load_or_default("wom", None)?;
/// ```
pub struct Settings<T> {
    pub config: T,
    path: PathBuf,
}

impl<T: Serialize + DeserializeOwned + Default> Settings<T> {
    /// Load settings for `service`, writing defaults when no file exists yet.
    pub fn load_or_default(service: &str, custom_path: Option<&Path>) -> Result<Self> {
        let path = custom_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_settings_path(service));

        if path.exists() {
            debug!(path = %path.display(), "loading settings");
            let config = read_config(&path)?;
            Ok(Self { config, path })
        } else {
            debug!(path = %path.display(), "creating default settings");
            let settings = Self {
                config: T::default(),
                path,
            };
            settings.save()?;
            Ok(settings)
        }
    }

    /// Load settings from an existing file.
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self {
            config: read_config(path)?,
            path: path.to_path_buf(),
        })
    }

    /// Save current settings to disk.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SettingsError::CreateDirError(e.to_string()))?;
        }
        let content = serde_json::to_string_pretty(&self.config)
            .map_err(|e| SettingsError::WriteError(e.to_string()))?;
        fs::write(&self.path, content).map_err(|e| SettingsError::WriteError(e.to_string()))
    }

    /// Apply `change` to the config and persist the result.
    pub fn update(&mut self, change: impl FnOnce(&mut T)) -> Result<()> {
        change(&mut self.config);
        self.save()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|e| SettingsError::ReadError(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| SettingsError::ParseError(e.to_string()))
}

/// Default settings file path for a service.
pub fn default_settings_path(service: &str) -> PathBuf {
    config_dir_for(service).join("settings.json")
}

/// Configuration directory for a service: `$WOM_CONFIG_DIR`, then
/// `$XDG_CONFIG_HOME/<service>`, then `~/.config/<service>`.
pub fn config_dir_for(service: &str) -> PathBuf {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"));
    base.join(service.to_lowercase())
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}
