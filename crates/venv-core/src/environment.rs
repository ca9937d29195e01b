//! The environment record returned by listings, and the filesystem helpers
//! that build it without running any subprocess.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::EnvError;
use crate::metadata::{read_metadata, EnvMetadata};

/// Characters never allowed in an environment name.
const RESERVED_CHARS: &[char] = &[' ', '/', '\\', ':', '*', '?', '"', '<', '>', '|'];

const MAX_NAME_LEN: usize = 255;

/// Result of an expensive detail probe.
///
/// Distinguishes "not looked at yet" from "looked and failed", which the
/// listing UI renders differently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Probe<T> {
    /// Not probed (fast listing).
    #[default]
    Pending,
    /// The probe ran and yielded nothing usable.
    Failed,
    Value(T),
}

impl<T> Probe<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Probe::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Probe::Pending)
    }
}

impl<T> From<Option<T>> for Probe<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Probe::Value(v),
            None => Probe::Failed,
        }
    }
}

impl<T: std::fmt::Display> Probe<T> {
    /// Text for a table cell.
    pub fn display(&self) -> String {
        match self {
            Probe::Pending => "...".to_string(),
            Probe::Failed => "Unknown".to_string(),
            Probe::Value(v) => v.to_string(),
        }
    }
}

/// A directory-backed virtual environment under the base directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub path: PathBuf,
    pub interpreter_path: PathBuf,
    pub installer_path: PathBuf,
    /// The interpreter exists at `interpreter_path`.
    pub is_valid: bool,
    pub created_at: Option<DateTime<Local>>,
    pub interpreter_version: Probe<String>,
    pub package_count: Probe<usize>,
    pub size_bytes: Probe<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EnvMetadata>,
}

impl Environment {
    /// Build the record from the filesystem alone; detail probes stay
    /// [`Probe::Pending`].
    pub fn scan(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let interpreter_path = venv_launch::python_path(path);
        let installer_path = venv_launch::installer_path(path);
        let is_valid = interpreter_path.exists();
        let metadata = read_metadata(path);
        let created_at = metadata
            .as_ref()
            .and_then(EnvMetadata::created_at)
            .or_else(|| dir_created_at(path));

        Self {
            name,
            path: path.to_path_buf(),
            interpreter_path,
            installer_path,
            is_valid,
            created_at,
            interpreter_version: Probe::Pending,
            package_count: Probe::Pending,
            size_bytes: Probe::Pending,
            metadata,
        }
    }

    pub fn has_installer(&self) -> bool {
        self.installer_path.exists()
    }

    /// Shell command that activates this environment. Displayed, never run.
    pub fn activate_command(&self) -> String {
        activate_command(&self.path)
    }
}

/// Shell command that activates the environment at `env_path`.
pub fn activate_command(env_path: &Path) -> String {
    #[cfg(target_os = "windows")]
    {
        env_path
            .join("Scripts")
            .join("Activate.ps1")
            .display()
            .to_string()
    }
    #[cfg(not(target_os = "windows"))]
    {
        format!("source {}", env_path.join("bin").join("activate").display())
    }
}

/// Check an environment name before touching the filesystem.
pub fn validate_name(name: &str) -> Result<(), EnvError> {
    let invalid = |reason| EnvError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name == "." || name == ".." {
        return Err(invalid("name is reserved"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("name is too long"));
    }
    if name.chars().any(|c| c.is_control() || RESERVED_CHARS.contains(&c)) {
        return Err(invalid(
            "name contains spaces, path separators or reserved characters",
        ));
    }
    Ok(())
}

/// Directory creation time, or modification time where the platform does
/// not record creation.
fn dir_created_at(path: &Path) -> Option<DateTime<Local>> {
    let meta = std::fs::metadata(path).ok()?;
    let time = meta.created().or_else(|_| meta.modified()).ok()?;
    Some(DateTime::<Local>::from(time))
}

/// Total size of regular files under `path`, not following symlinks.
/// Entries that cannot be read are left out of the total.
pub fn dir_size(path: &Path) -> Option<u64> {
    if !path.is_dir() {
        return None;
    }
    let total = WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum::<u64>();
    Some(total)
}

/// Human-readable byte count, e.g. "12.3 MB".
pub fn human_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{:.1} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1} TB", size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::write_metadata;

    #[test]
    fn test_validate_name_accepts_common_names() {
        for name in ["demo", "data-science", "py3.12_env", "ünïcode"] {
            assert!(validate_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_validate_name_rejects_reserved() {
        for name in ["", ".", "..", "a/b", "a\\b", "my env", "x:y", "what?", "a|b", "tab\there"] {
            assert!(
                matches!(validate_name(name), Err(EnvError::InvalidName { .. })),
                "{name:?} should be rejected"
            );
        }
        assert!(validate_name(&"a".repeat(256)).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_dir_size_skips_unreadable_entries() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("readable.txt"), "hello").unwrap();
        let locked = temp.path().join("locked");
        std::fs::create_dir_all(&locked).unwrap();
        std::fs::write(locked.join("hidden.txt"), "secret").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();

        let size = dir_size(temp.path());
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        // Privileged users can still read the locked directory.
        let size = size.expect("size despite the unreadable directory");
        assert!(size == 5 || size == 11, "unexpected size {size}");
    }

    #[test]
    fn test_scan_without_interpreter_is_invalid() {
        let temp = tempfile::tempdir().unwrap();
        let env_path = temp.path().join("broken");
        std::fs::create_dir_all(&env_path).unwrap();

        let env = Environment::scan(&env_path);
        assert_eq!(env.name, "broken");
        assert!(!env.is_valid);
        assert!(env.interpreter_version.is_pending());
        assert!(env.created_at.is_some(), "falls back to directory time");
    }

    #[test]
    fn test_scan_prefers_metadata_timestamp() {
        let temp = tempfile::tempdir().unwrap();
        let env_path = temp.path().join("demo");
        let python = venv_launch::python_path(&env_path);
        std::fs::create_dir_all(python.parent().unwrap()).unwrap();
        std::fs::write(&python, "").unwrap();

        let mut meta = EnvMetadata::new("demo", None);
        meta.created = "2001-02-03T04:05:06+00:00".to_string();
        write_metadata(&env_path, &meta).unwrap();

        let env = Environment::scan(&env_path);
        assert!(env.is_valid);
        assert_eq!(env.created_at, meta.created_at());
        assert_eq!(env.metadata, Some(meta));
    }

    #[test]
    fn test_dir_size_counts_files() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("a/b")).unwrap();
        std::fs::write(temp.path().join("a/one"), vec![0u8; 100]).unwrap();
        std::fs::write(temp.path().join("a/b/two"), vec![0u8; 28]).unwrap();
        assert_eq!(dir_size(temp.path()), Some(128));
        assert_eq!(dir_size(&temp.path().join("missing")), None);
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512.0 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_probe_display_and_from_option() {
        assert_eq!(Probe::<String>::Pending.display(), "...");
        assert_eq!(Probe::<String>::from(None).display(), "Unknown");
        assert_eq!(Probe::from(Some(3usize)).display(), "3");
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn test_activate_command_unix() {
        assert_eq!(
            activate_command(Path::new("/envs/demo")),
            "source /envs/demo/bin/activate"
        );
    }
}
