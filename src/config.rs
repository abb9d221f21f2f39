//! Persisted user preferences.
//!
//! Loaded once at startup and written back on every change. The store is
//! handed to the command layer as managed state; nothing below the
//! commands reads it.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::fstab::ledger::DEFAULT_LEDGER_DIR;
use crate::fstab::DEFAULT_FSTAB_PATH;

pub const CONFIG_FILE: &str = "config.json";
pub const DEFAULT_BASE_MOUNT: &str = "/mnt/shared";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    Light,
    #[default]
    Dark,
}

impl ThemeMode {
    pub fn toggled(self) -> Self {
        match self {
            Self::Light => Self::Dark,
            Self::Dark => Self::Light,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Accent {
    #[default]
    Green,
    Teal,
    Blue,
    Purple,
    Orange,
    Red,
    Pink,
    Indigo,
    Cyan,
    Lime,
    Amber,
    DeepOrange,
}

impl Accent {
    pub const ORDER: [Accent; 12] = [
        Accent::Green,
        Accent::Teal,
        Accent::Blue,
        Accent::Purple,
        Accent::Orange,
        Accent::Red,
        Accent::Pink,
        Accent::Indigo,
        Accent::Cyan,
        Accent::Lime,
        Accent::Amber,
        Accent::DeepOrange,
    ];

    /// Next accent in display order, wrapping around.
    pub fn next(self) -> Self {
        let idx = Self::ORDER.iter().position(|a| *a == self).unwrap_or(0);
        Self::ORDER[(idx + 1) % Self::ORDER.len()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub theme_mode: ThemeMode,
    pub accent: Accent,
    pub base_mount: String,
    pub helper_path: Option<PathBuf>,
    pub fstab_path: PathBuf,
    pub ledger_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            theme_mode: ThemeMode::default(),
            accent: Accent::default(),
            base_mount: DEFAULT_BASE_MOUNT.to_string(),
            helper_path: None,
            fstab_path: PathBuf::from(DEFAULT_FSTAB_PATH),
            ledger_dir: PathBuf::from(DEFAULT_LEDGER_DIR),
        }
    }
}

impl AppConfig {
    pub fn fstab_path_str(&self) -> String {
        self.fstab_path.to_string_lossy().to_string()
    }
}

/// Read a config file. A missing or unreadable file yields defaults.
pub fn load_config(path: &Path) -> AppConfig {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return AppConfig::default(),
    };
    match serde_json::from_str(&text) {
        Ok(config) => config,
        Err(err) => {
            log::warn!("ignoring corrupt config {}: {err}", path.display());
            AppConfig::default()
        }
    }
}

pub fn save_config(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;
    Ok(())
}

/// Write-through holder for the current config.
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: Mutex<AppConfig>,
}

impl ConfigStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = load_config(&path);
        Self {
            path: Some(path),
            current: Mutex::new(current),
        }
    }

    /// Defaults with nowhere to persist, for when no config dir exists.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            current: Mutex::new(AppConfig::default()),
        }
    }

    pub fn get(&self) -> AppConfig {
        self.current
            .lock()
            .map(|config| config.clone())
            .unwrap_or_default()
    }

    /// Applies `change` and persists the result before returning it.
    pub fn update(&self, change: impl FnOnce(&mut AppConfig)) -> Result<AppConfig> {
        let mut guard = self
            .current
            .lock()
            .map_err(|_| Error::Config("config lock poisoned".to_string()))?;
        let mut next = guard.clone();
        change(&mut next);
        if let Some(path) = &self.path {
            save_config(path, &next)?;
        }
        *guard = next.clone();
        Ok(next)
    }
}
