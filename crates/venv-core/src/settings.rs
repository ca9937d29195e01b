//! User settings persistence.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/venvdeck/settings.json
//! - Linux: ~/.config/venvdeck/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\venvdeck\settings.json

use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

use crate::packages::Backend;

/// How many recently used environments are remembered.
pub const MAX_RECENT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding every managed environment
    #[serde(default = "default_base_dir", deserialize_with = "deserialize_dir")]
    pub base_dir: PathBuf,

    /// Interpreter used for new environments; PATH lookup when unset
    #[serde(default)]
    pub default_python: Option<PathBuf>,

    /// Upgrade pip right after creating an environment
    #[serde(default = "default_true")]
    pub upgrade_installer: bool,

    /// Installer used for package operations
    #[serde(default)]
    pub installer_backend: Backend,

    /// Most recently used environment names, newest first
    #[serde(default)]
    pub recent_envs: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// `~/venv`, or `C:\venv` on Windows.
pub fn default_base_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        PathBuf::from("C:\\venv")
    }
    #[cfg(not(target_os = "windows"))]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("venv")
    }
}

/// Expand a leading `~` so hand-edited files can use it.
fn deserialize_dir<'de, D>(deserializer: D) -> std::result::Result<PathBuf, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(expand_home(&raw))
}

pub fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\') => {
            match dirs::home_dir() {
                Some(home) => home.join(rest.trim_start_matches(['/', '\\'])),
                None => PathBuf::from(raw),
            }
        }
        _ => PathBuf::from(raw),
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            default_python: None,
            upgrade_installer: true,
            installer_backend: Backend::Pip,
            recent_envs: Vec::new(),
        }
    }
}

impl Settings {
    /// Move `name` to the front of the recent list.
    pub fn add_recent(&mut self, name: &str) {
        self.recent_envs.retain(|n| n != name);
        self.recent_envs.insert(0, name.to_string());
        self.recent_envs.truncate(MAX_RECENT);
    }

    /// Drop `name` from the recent list, e.g. after deleting it.
    pub fn forget_recent(&mut self, name: &str) {
        self.recent_envs.retain(|n| n != name);
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("venvdeck")
        .join("settings.json")
}

/// Load settings from disk, returning defaults if the file doesn't exist
pub fn load_settings() -> Settings {
    load_settings_from(&settings_path())
}

/// Load settings from `path`; missing or unreadable files yield defaults.
pub fn load_settings_from(path: &Path) -> Settings {
    if !path.exists() {
        return Settings::default();
    }
    match std::fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|s| serde_json::from_str(&s).map_err(anyhow::Error::from))
    {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!("[settings] Ignoring unreadable {:?}: {}", path, e);
            Settings::default()
        }
    }
}

/// Save settings to disk
pub fn save_settings(settings: &Settings) -> Result<()> {
    save_settings_to(&settings_path(), settings)
}

pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}
