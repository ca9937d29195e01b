//! Package operations inside one environment.
//!
//! Commands go either through the environment's own `python -m pip` or, when
//! selected and reachable, through `uv pip … --python <env python>`. Network
//! operations share one failure-handling path: detect the class of failure
//! from the installer output, apply the targeted remedy once, otherwise
//! surface the raw output.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use venv_launch::locator::{parse_python_version, FAST_INSTALLER};
use venv_launch::{CommandOutput, CommandRunner, LocatorService};

use crate::environment::Probe;
use crate::error::{EnvError, OpResult};
use crate::progress::{OpPhase, ProgressHandler, Silent};
use crate::timeouts;

/// Hosts marked as trusted when certificate validation is broken.
pub const TRUSTED_HOSTS: [&str; 3] = ["pypi.org", "pypi.python.org", "files.pythonhosted.org"];

/// Output fragments (lowercase) that identify a secure-transport failure.
const TRANSPORT_SIGNATURES: &[&str] = &[
    "certificate_verify_failed",
    "certificate verify failed",
    "sslerror",
    "ssl module in python is not available",
    "invalid peer certificate",
    "unknownissuer",
];

/// Output fragments (lowercase) that identify a package missing upstream.
const NOT_FOUND_SIGNATURES: &[&str] = &[
    "no matching distribution found",
    "could not find a version that satisfies",
    "not found in the package registry",
];

/// Installer implementation used for package operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// The environment's own `python -m pip`.
    #[default]
    Pip,
    /// `uv pip`, targeting the environment's interpreter.
    Uv,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Pip => write!(f, "pip"),
            Backend::Uv => write!(f, "uv"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pip" => Ok(Backend::Pip),
            "uv" => Ok(Backend::Uv),
            other => Err(format!("unknown installer backend '{}'", other)),
        }
    }
}

/// An installed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub installed_version: String,
    /// Set when the listing came from an outdated check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
}

impl Package {
    pub fn is_outdated(&self) -> bool {
        self.latest_version
            .as_deref()
            .is_some_and(|latest| latest != self.installed_version)
    }
}

/// One entry of `pip list --format=json`.
#[derive(Deserialize)]
struct ListEntry {
    name: String,
    version: String,
    #[serde(default)]
    latest_version: Option<String>,
}

/// Parse `pip list --format=json` / `uv pip list --format=json` output.
pub fn parse_package_list(json: &str) -> Option<Vec<Package>> {
    let entries: Vec<ListEntry> = serde_json::from_str(json.trim()).ok()?;
    Some(
        entries
            .into_iter()
            .map(|e| Package {
                name: e.name,
                installed_version: e.version,
                latest_version: e.latest_version,
            })
            .collect(),
    )
}

/// Whether installer output shows a certificate / TLS failure.
pub fn is_transport_failure(output: &str) -> bool {
    let lower = output.to_lowercase();
    TRANSPORT_SIGNATURES.iter().any(|s| lower.contains(s))
}

/// Whether installer output shows a package missing from the index.
pub fn is_not_found(output: &str) -> bool {
    let lower = output.to_lowercase();
    NOT_FOUND_SIGNATURES.iter().any(|s| lower.contains(s))
}

/// The specifier pip names in "No matching distribution found for X", if any.
fn missing_spec(output: &str) -> Option<String> {
    const MARKER: &str = "no matching distribution found for ";
    output.lines().find_map(|line| {
        let idx = line.to_ascii_lowercase().find(MARKER)?;
        let spec = line[idx + MARKER.len()..].trim();
        (!spec.is_empty()).then(|| spec.to_string())
    })
}

/// Resolved executable for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Invocation {
    Pip,
    Uv(PathBuf),
}

/// Package manager bound to one environment directory.
pub struct PackageManager {
    env_path: PathBuf,
    python: PathBuf,
    backend: Backend,
    runner: Arc<dyn CommandRunner>,
    locator: Arc<dyn LocatorService>,
    /// The interpreter can import `ssl`; checked once.
    transport_ok: OnceCell<bool>,
    /// Memoized fast-installer lookup; `None` means not looked up yet.
    fast_installer: Mutex<Option<Option<PathBuf>>>,
    bootstrap_attempted: AtomicBool,
}

impl PackageManager {
    pub fn new(
        env_path: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        locator: Arc<dyn LocatorService>,
    ) -> Self {
        let env_path = env_path.into();
        let python = venv_launch::python_path(&env_path);
        Self {
            env_path,
            python,
            backend: Backend::Pip,
            runner,
            locator,
            transport_ok: OnceCell::new(),
            fast_installer: Mutex::new(None),
            bootstrap_attempted: AtomicBool::new(false),
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn env_path(&self) -> &Path {
        &self.env_path
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    fn env_name(&self) -> String {
        self.env_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.env_path.display().to_string())
    }

    // ------------------------------------------------------------------
    // Cached state
    // ------------------------------------------------------------------

    /// Whether the interpreter has a working `ssl` module.
    async fn transport_ok(&self) -> bool {
        *self
            .transport_ok
            .get_or_init(|| async {
                let args = ["-c".to_string(), "import ssl".to_string()];
                match self
                    .runner
                    .run(&self.python, &args, timeouts::VERSION_PROBE)
                    .await
                {
                    Ok(out) if out.success() => true,
                    Ok(_) => {
                        warn!(
                            "[packages] {:?} cannot import ssl; using trusted hosts",
                            self.env_path
                        );
                        false
                    }
                    // The real command will surface the spawn failure.
                    Err(_) => true,
                }
            })
            .await
    }

    fn fast_installer(&self) -> Option<PathBuf> {
        let mut memo = self
            .fast_installer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        memo.get_or_insert_with(|| self.locator.find_fast_installer(&self.env_path))
            .clone()
    }

    fn forget_fast_installer(&self) {
        *self
            .fast_installer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Executable for queries: never bootstraps.
    fn query_invocation(&self) -> Invocation {
        match (self.backend, self.fast_installer()) {
            (Backend::Uv, Some(uv)) => Invocation::Uv(uv),
            _ => Invocation::Pip,
        }
    }

    /// Executable for mutating operations: bootstraps the fast installer
    /// once, then falls back to pip for this call.
    async fn invocation(&self, progress: &dyn ProgressHandler) -> Invocation {
        if self.backend == Backend::Pip {
            return Invocation::Pip;
        }
        if let Some(uv) = self.fast_installer() {
            return Invocation::Uv(uv);
        }

        let reason = if !self.bootstrap_attempted.swap(true, Ordering::SeqCst) {
            progress.on_progress(OpPhase::BootstrappingBackend {
                backend: FAST_INSTALLER.to_string(),
            });
            match self.bootstrap_fast_installer().await {
                Ok(()) => {
                    self.forget_fast_installer();
                    if let Some(uv) = self.fast_installer() {
                        info!("[packages] Bootstrapped {} at {:?}", FAST_INSTALLER, uv);
                        return Invocation::Uv(uv);
                    }
                    "installed but not found".to_string()
                }
                Err(e) => {
                    debug!("[packages] Bootstrap of {} failed: {}", FAST_INSTALLER, e);
                    "could not be installed".to_string()
                }
            }
        } else {
            "not installed".to_string()
        };

        progress.on_progress(OpPhase::BackendFallback {
            requested: FAST_INSTALLER.to_string(),
            reason,
        });
        Invocation::Pip
    }

    async fn bootstrap_fast_installer(&self) -> Result<(), EnvError> {
        let out = self
            .run_network(
                &Invocation::Pip,
                vec!["install".to_string(), FAST_INSTALLER.to_string()],
                timeouts::INSTALL,
                "Installing uv",
                &Silent,
            )
            .await?;
        if out.success() {
            Ok(())
        } else {
            Err(EnvError::CommandFailed {
                what: "Installing uv failed".to_string(),
                output: out.combined(),
            })
        }
    }

    // ------------------------------------------------------------------
    // Command construction and execution
    // ------------------------------------------------------------------

    /// Program and arguments for `sub` (subcommand first) on `inv`.
    fn command(&self, inv: &Invocation, sub: &[String]) -> (PathBuf, Vec<String>) {
        match inv {
            Invocation::Pip => {
                let mut args = vec!["-m".to_string(), "pip".to_string()];
                args.extend(sub.iter().cloned());
                (self.python.clone(), args)
            }
            Invocation::Uv(uv) => {
                let mut args = vec!["pip".to_string()];
                let mut rest = sub.iter();
                if let Some(subcommand) = rest.next() {
                    args.push(subcommand.clone());
                }
                args.push("--python".to_string());
                args.push(self.python.to_string_lossy().to_string());
                args.extend(rest.cloned());
                (uv.clone(), args)
            }
        }
    }

    fn trusted_host_args(inv: &Invocation) -> Vec<String> {
        let flag = match inv {
            Invocation::Pip => "--trusted-host",
            Invocation::Uv(_) => "--allow-insecure-host",
        };
        TRUSTED_HOSTS
            .iter()
            .flat_map(|host| [flag.to_string(), host.to_string()])
            .collect()
    }

    async fn exec(
        &self,
        inv: &Invocation,
        sub: &[String],
        timeout: Duration,
        what: &str,
    ) -> Result<CommandOutput, EnvError> {
        let (program, args) = self.command(inv, sub);
        let out = self
            .runner
            .run(&program, &args, timeout)
            .await
            .map_err(|source| EnvError::Spawn {
                program: program.clone(),
                source,
            })?;
        if out.timed_out {
            return Err(EnvError::Timeout {
                what: what.to_string(),
                limit: timeout,
            });
        }
        Ok(out)
    }

    /// Run a network-touching command with the trusted-host remedy.
    ///
    /// Trusted hosts are added up front when the interpreter has no working
    /// `ssl`; otherwise a failure showing a transport signature is retried
    /// once with them, and the retry's output replaces the first.
    async fn run_network(
        &self,
        inv: &Invocation,
        mut sub: Vec<String>,
        timeout: Duration,
        what: &str,
        progress: &dyn ProgressHandler,
    ) -> Result<CommandOutput, EnvError> {
        let preemptive = !self.transport_ok().await;
        if preemptive {
            sub.extend(Self::trusted_host_args(inv));
        }

        let out = self.exec(inv, &sub, timeout, what).await?;
        if out.success() || preemptive || !is_transport_failure(&out.combined()) {
            return Ok(out);
        }

        progress.on_progress(OpPhase::RetryingWithTrustedHosts);
        sub.extend(Self::trusted_host_args(inv));
        self.exec(inv, &sub, timeout, what).await
    }

    /// Classify the output of an install-type command.
    fn install_outcome(
        out: CommandOutput,
        requested: &str,
        failure: &str,
    ) -> Result<String, EnvError> {
        let output = out.combined();
        if out.success() {
            return Ok(output);
        }
        if is_not_found(&output) {
            return Err(EnvError::PackageNotFound {
                spec: missing_spec(&output).unwrap_or_else(|| requested.to_string()),
            });
        }
        Err(EnvError::CommandFailed {
            what: failure.to_string(),
            output,
        })
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Install packages, optionally upgrading them.
    pub async fn install(
        &self,
        packages: &[String],
        upgrade: bool,
        progress: &dyn ProgressHandler,
    ) -> OpResult {
        self.try_install(packages, upgrade, progress).await.into()
    }

    async fn try_install(
        &self,
        packages: &[String],
        upgrade: bool,
        progress: &dyn ProgressHandler,
    ) -> Result<String, EnvError> {
        if packages.is_empty() {
            return Err(EnvError::NoPackages);
        }
        let inv = self.invocation(progress).await;
        progress.on_progress(OpPhase::InstallingPackages {
            packages: packages.to_vec(),
        });

        let mut sub = vec!["install".to_string()];
        if upgrade {
            sub.push("--upgrade".to_string());
        }
        sub.extend(packages.iter().cloned());

        let out = self
            .run_network(&inv, sub, timeouts::INSTALL, "Installation", progress)
            .await?;
        Self::install_outcome(out, &packages.join(", "), "Installation failed")
    }

    /// Remove packages. Single attempt, no retry.
    pub async fn uninstall(&self, packages: &[String], progress: &dyn ProgressHandler) -> OpResult {
        self.try_uninstall(packages, progress).await.into()
    }

    async fn try_uninstall(
        &self,
        packages: &[String],
        progress: &dyn ProgressHandler,
    ) -> Result<String, EnvError> {
        if packages.is_empty() {
            return Err(EnvError::NoPackages);
        }
        let inv = self.invocation(progress).await;
        progress.on_progress(OpPhase::UninstallingPackages {
            packages: packages.to_vec(),
        });

        let mut sub = vec!["uninstall".to_string()];
        // uv never prompts and rejects -y.
        if inv == Invocation::Pip {
            sub.push("-y".to_string());
        }
        sub.extend(packages.iter().cloned());

        let out = self
            .exec(&inv, &sub, timeouts::UNINSTALL, "Uninstall")
            .await?;
        if out.success() {
            Ok(out.combined())
        } else {
            Err(EnvError::CommandFailed {
                what: "Uninstall failed".to_string(),
                output: out.combined(),
            })
        }
    }

    async fn query_list(&self, timeout: Duration) -> Option<Vec<Package>> {
        let sub = ["list".to_string(), "--format=json".to_string()];
        match self
            .exec(&self.query_invocation(), &sub, timeout, "Package listing")
            .await
        {
            Ok(out) if out.success() => parse_package_list(&out.stdout),
            Ok(out) => {
                debug!("[packages] list failed: {}", out.combined());
                None
            }
            Err(e) => {
                debug!("[packages] list failed: {}", e);
                None
            }
        }
    }

    /// Installed packages. Empty on any failure: callers that care about
    /// freshness must read an empty list as "unknown".
    pub async fn list_installed(&self) -> Vec<Package> {
        self.query_list(timeouts::LIST).await.unwrap_or_default()
    }

    /// Number of installed packages, for listings.
    pub async fn count_installed(&self) -> Probe<usize> {
        self.query_list(timeouts::PACKAGE_COUNT)
            .await
            .map(|packages| packages.len())
            .into()
    }

    /// Packages with a newer release upstream. Touches the network, so the
    /// trusted-host remedy applies. Empty on any failure.
    pub async fn list_outdated(&self, progress: &dyn ProgressHandler) -> Vec<Package> {
        let sub = vec![
            "list".to_string(),
            "--outdated".to_string(),
            "--format=json".to_string(),
        ];
        match self
            .run_network(
                &self.query_invocation(),
                sub,
                timeouts::OUTDATED,
                "Outdated check",
                progress,
            )
            .await
        {
            Ok(out) if out.success() => parse_package_list(&out.stdout).unwrap_or_default(),
            Ok(out) => {
                debug!("[packages] outdated check failed: {}", out.combined());
                Vec::new()
            }
            Err(e) => {
                debug!("[packages] outdated check failed: {}", e);
                Vec::new()
            }
        }
    }

    /// The installed-package manifest, as an opaque blob.
    pub async fn freeze(&self) -> Result<String, EnvError> {
        let out = self
            .exec(
                &self.query_invocation(),
                &["freeze".to_string()],
                timeouts::FREEZE,
                "Freeze",
            )
            .await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(EnvError::CommandFailed {
                what: "Freeze failed".to_string(),
                output: out.combined(),
            })
        }
    }

    /// Write the freeze output to `path` byte-for-byte.
    pub async fn export_requirements(&self, path: &Path) -> OpResult {
        self.try_export_requirements(path).await.into()
    }

    async fn try_export_requirements(&self, path: &Path) -> Result<String, EnvError> {
        let content = self.freeze().await?;
        if content.trim().is_empty() {
            return Err(EnvError::NothingToExport);
        }
        tokio::fs::write(path, content.as_bytes())
            .await
            .map_err(|e| EnvError::io(format!("Error exporting to {}", path.display()), e))?;
        Ok(format!("Requirements exported to {}", path.display()))
    }

    /// Bulk-install a requirements file.
    pub async fn import_requirements(
        &self,
        path: &Path,
        timeout: Option<Duration>,
        progress: &dyn ProgressHandler,
    ) -> OpResult {
        self.try_import_requirements(path, timeout, progress)
            .await
            .into()
    }

    pub(crate) async fn try_import_requirements(
        &self,
        path: &Path,
        timeout: Option<Duration>,
        progress: &dyn ProgressHandler,
    ) -> Result<String, EnvError> {
        if !path.exists() {
            return Err(EnvError::FileNotFound(path.to_path_buf()));
        }
        let inv = self.invocation(progress).await;
        progress.on_progress(OpPhase::InstallingRequirements {
            target: self.env_name(),
        });

        let sub = vec![
            "install".to_string(),
            "-r".to_string(),
            path.to_string_lossy().to_string(),
        ];
        let out = self
            .run_network(
                &inv,
                sub,
                timeout.unwrap_or(timeouts::IMPORT),
                "Installation",
                progress,
            )
            .await?;
        Self::install_outcome(
            out,
            &path.display().to_string(),
            "Some installations failed",
        )
    }

    /// `pip show` fields for one installed package.
    pub async fn show(&self, package: &str) -> Option<BTreeMap<String, String>> {
        let sub = ["show".to_string(), package.to_string()];
        let out = self
            .exec(&self.query_invocation(), &sub, timeouts::LIST, "Show")
            .await
            .ok()?;
        if !out.success() {
            return None;
        }
        let fields: BTreeMap<String, String> = out
            .stdout
            .lines()
            .filter_map(|line| line.split_once(": "))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        (!fields.is_empty()).then_some(fields)
    }

    /// Version of the environment's interpreter.
    pub async fn interpreter_version(&self) -> Probe<String> {
        interpreter_version(self.runner.as_ref(), &self.python).await
    }
}

/// `python --version` of an interpreter. Python 2 prints to stderr, so both
/// streams are read.
pub async fn interpreter_version(runner: &dyn CommandRunner, python: &Path) -> Probe<String> {
    match runner
        .run(python, &["--version".to_string()], timeouts::VERSION_PROBE)
        .await
    {
        Ok(out) if out.success() => parse_python_version(&out.combined()).into(),
        _ => Probe::Failed,
    }
}
