//! Interpreter and fast-installer lookup.
//!
//! Finding a Python to create environments with, and finding `uv`, are the
//! only places that consult the global search path. Both sit behind the
//! [`LocatorService`] trait so the rest of the workspace can be tested with a
//! fixed locator instead of whatever happens to be installed.

use async_trait::async_trait;
use log::{debug, info};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::runner::{CommandRunner, SystemRunner};

/// Name of the fast installer executable.
pub const FAST_INSTALLER: &str = "uv";

/// Timeout for `python --version` probes.
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Directory holding executables inside an environment.
pub fn scripts_dir(env_path: &Path) -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        env_path.join("Scripts")
    }
    #[cfg(not(target_os = "windows"))]
    {
        env_path.join("bin")
    }
}

/// Compute the binary path for a tool inside a given environment directory.
pub fn binary_path_for_env(env_path: &Path, tool_name: &str) -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        scripts_dir(env_path).join(format!("{}.exe", tool_name))
    }
    #[cfg(not(target_os = "windows"))]
    {
        scripts_dir(env_path).join(tool_name)
    }
}

/// Path of the environment's own interpreter.
pub fn python_path(env_path: &Path) -> PathBuf {
    binary_path_for_env(env_path, "python")
}

/// Path of the environment's own `pip` executable.
pub fn installer_path(env_path: &Path) -> PathBuf {
    binary_path_for_env(env_path, "pip")
}

/// A Python interpreter found on the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterInfo {
    /// Version as reported by `--version`, without the `Python ` prefix.
    pub version: String,
    pub path: PathBuf,
}

/// Locates interpreters and the fast installer.
#[async_trait]
pub trait LocatorService: Send + Sync {
    /// Interpreter used to create environments when the caller names none.
    fn default_interpreter(&self) -> Option<PathBuf>;

    /// The fast installer, preferring one inside `env_path` over the system
    /// search path.
    fn find_fast_installer(&self, env_path: &Path) -> Option<PathBuf>;

    /// All distinct Python installations, newest version first.
    async fn find_interpreters(&self) -> Vec<InterpreterInfo>;
}

/// [`LocatorService`] that scans `PATH`.
pub struct SystemLocator {
    preferred: Option<PathBuf>,
    runner: Arc<dyn CommandRunner>,
}

impl Default for SystemLocator {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SystemLocator {
    /// `preferred` is returned by [`LocatorService::default_interpreter`]
    /// when it exists on disk.
    pub fn new(preferred: Option<PathBuf>) -> Self {
        Self {
            preferred,
            runner: Arc::new(SystemRunner),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    fn candidate_names() -> Vec<String> {
        let mut names = vec!["python3".to_string(), "python".to_string()];
        names.extend((6..15).map(|minor| format!("python3.{}", minor)));
        names
    }
}

#[async_trait]
impl LocatorService for SystemLocator {
    fn default_interpreter(&self) -> Option<PathBuf> {
        if let Some(ref preferred) = self.preferred {
            if preferred.exists() {
                return Some(preferred.clone());
            }
            info!(
                "[locator] Configured interpreter {:?} not found, searching PATH",
                preferred
            );
        }
        ["python3", "python"]
            .iter()
            .find_map(|name| which::which(name).ok())
            .filter(|path| !is_store_alias(path))
    }

    fn find_fast_installer(&self, env_path: &Path) -> Option<PathBuf> {
        let in_env = binary_path_for_env(env_path, FAST_INSTALLER);
        if in_env.exists() {
            return Some(in_env);
        }
        which::which(FAST_INSTALLER).ok()
    }

    async fn find_interpreters(&self) -> Vec<InterpreterInfo> {
        let mut found = Vec::new();
        let mut seen_paths = HashSet::new();
        let mut seen_versions = HashSet::new();

        for name in Self::candidate_names() {
            let Ok(path) = which::which(&name) else {
                continue;
            };
            if is_store_alias(&path) {
                continue;
            }
            let key = path.canonicalize().unwrap_or_else(|_| path.clone());
            if !seen_paths.insert(key) {
                continue;
            }

            let output = match self
                .runner
                .run(&path, &["--version".to_string()], VERSION_PROBE_TIMEOUT)
                .await
            {
                Ok(output) if output.success() => output,
                Ok(_) | Err(_) => {
                    debug!("[locator] {:?} did not report a version", path);
                    continue;
                }
            };

            let Some(version) = parse_python_version(&output.combined()) else {
                continue;
            };
            if seen_versions.insert(version.clone()) {
                found.push(InterpreterInfo { version, path });
            }
        }

        found.sort_by(|a, b| version_key(&b.version).cmp(&version_key(&a.version)));
        found
    }
}

/// The Windows Store installs `python.exe` stubs that open the store instead
/// of running anything.
fn is_store_alias(path: &Path) -> bool {
    path.to_string_lossy()
        .to_ascii_lowercase()
        .contains("windowsapps")
}

/// Extract the version from `python --version` output.
///
/// Handles both "Python 3.12.1" and a bare "3.12.1". Returns `None` unless
/// the version starts with a digit.
pub fn parse_python_version(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let version = line.strip_prefix("Python ").unwrap_or(line).trim();
    if version.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        Some(version.to_string())
    } else {
        None
    }
}

/// `major.minor` part of a version string, e.g. "3.12" for "3.12.1".
pub fn major_minor(version: &str) -> Option<String> {
    let mut parts = version.split('.');
    let major = parts.next().filter(|p| p.chars().all(|c| c.is_ascii_digit()))?;
    let minor: String = parts
        .next()?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if major.is_empty() || minor.is_empty() {
        return None;
    }
    Some(format!("{}.{}", major, minor))
}

/// Numeric sort key; non-numeric suffixes ("3.13.0rc1") sort by their
/// leading digits.
fn version_key(version: &str) -> Vec<u32> {
    version
        .split('.')
        .map(|part| {
            part.chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .unwrap_or(0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_python_version() {
        assert_eq!(
            parse_python_version("Python 3.12.1\n"),
            Some("3.12.1".to_string())
        );
        assert_eq!(parse_python_version("3.9.0"), Some("3.9.0".to_string()));
        assert_eq!(parse_python_version("\n  Python 3.8.10  "), Some("3.8.10".to_string()));
        assert_eq!(parse_python_version("command not found"), None);
        assert_eq!(parse_python_version(""), None);
    }

    #[test]
    fn test_major_minor() {
        assert_eq!(major_minor("3.12.1"), Some("3.12".to_string()));
        assert_eq!(major_minor("3.13.0rc1"), Some("3.13".to_string()));
        assert_eq!(major_minor("3"), None);
        assert_eq!(major_minor("Unknown"), None);
    }

    #[test]
    fn test_version_key_orders_numerically() {
        assert!(version_key("3.10.0") > version_key("3.9.18"));
        assert!(version_key("3.12.1") > version_key("3.12.0"));
    }

    #[test]
    fn test_env_layout_paths() {
        let env = Path::new("/envs/demo");
        #[cfg(not(target_os = "windows"))]
        {
            assert_eq!(python_path(env), PathBuf::from("/envs/demo/bin/python"));
            assert_eq!(installer_path(env), PathBuf::from("/envs/demo/bin/pip"));
        }
        #[cfg(target_os = "windows")]
        {
            assert!(python_path(env).ends_with("Scripts/python.exe"));
            assert!(installer_path(env).ends_with("Scripts/pip.exe"));
        }
    }

    #[test]
    fn test_fast_installer_prefers_environment_copy() {
        let temp = tempfile::tempdir().unwrap();
        let uv = binary_path_for_env(temp.path(), FAST_INSTALLER);
        std::fs::create_dir_all(uv.parent().unwrap()).unwrap();
        std::fs::write(&uv, "").unwrap();

        let locator = SystemLocator::default();
        assert_eq!(locator.find_fast_installer(temp.path()), Some(uv));
    }

    #[test]
    fn test_preferred_interpreter_is_used_when_present() {
        let temp = tempfile::tempdir().unwrap();
        let python = temp.path().join("python-custom");
        std::fs::write(&python, "").unwrap();

        let locator = SystemLocator::new(Some(python.clone()));
        assert_eq!(locator.default_interpreter(), Some(python));
    }

    #[test]
    fn test_store_alias_is_skipped() {
        assert!(is_store_alias(Path::new(
            r"C:\Users\me\AppData\Local\Microsoft\WindowsApps\python.exe"
        )));
        assert!(!is_store_alias(Path::new("/usr/bin/python3")));
    }
}
