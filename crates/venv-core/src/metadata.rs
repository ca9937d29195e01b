//! Sidecar metadata stored inside each environment directory.
//!
//! The file records provenance only. Environments created by other tools
//! have none, so every reader treats it as optional.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the sidecar inside an environment directory.
pub const METADATA_FILE: &str = ".venvdeck_meta.json";

/// Value of `created_by` for environments this tool creates.
pub const CREATED_BY: &str = "venvdeck";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvMetadata {
    /// ISO-8601 creation timestamp.
    pub created: String,
    pub created_by: String,
    /// Interpreter the environment was created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
}

impl EnvMetadata {
    /// Metadata for an environment created now.
    pub fn new(name: &str, python_path: Option<&Path>) -> Self {
        Self {
            created: Local::now().to_rfc3339(),
            created_by: CREATED_BY.to_string(),
            python_path: python_path.map(|p| p.to_string_lossy().to_string()),
            name: Some(name.to_string()),
            renamed_from: None,
        }
    }

    /// Parsed `created` timestamp.
    ///
    /// Accepts RFC 3339 and naive ISO-8601 timestamps (read as local time).
    pub fn created_at(&self) -> Option<DateTime<Local>> {
        parse_timestamp(&self.created)
    }
}

pub fn metadata_path(env_path: &Path) -> PathBuf {
    env_path.join(METADATA_FILE)
}

/// Read the sidecar. `None` when it is absent or unreadable.
pub fn read_metadata(env_path: &Path) -> Option<EnvMetadata> {
    let path = metadata_path(env_path);
    let content = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&content) {
        Ok(meta) => Some(meta),
        Err(e) => {
            log::debug!("[metadata] Ignoring unreadable {:?}: {}", path, e);
            None
        }
    }
}

/// Write the sidecar.
pub fn write_metadata(env_path: &Path, meta: &EnvMetadata) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(meta)?;
    std::fs::write(metadata_path(env_path), json)?;
    Ok(())
}

fn parse_timestamp(value: &str) -> Option<DateTime<Local>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Local));
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Local.from_local_datetime(&naive).earliest()
}
