//! Environment lifecycle under a base directory.
//!
//! [`EnvironmentManager`] owns the rule that an environment directory and its
//! sidecar metadata agree: metadata is only written once the creation
//! subprocess succeeded, and a failed creation leaves nothing behind.
//! Clone and rename are built from freeze, create and bulk install, checking
//! for cancellation between the steps.

use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use venv_launch::{CommandOutput, CommandRunner, LocatorService};

use crate::environment::{self, dir_size, validate_name, Environment, Probe};
use crate::error::{EnvError, OpResult};
use crate::metadata::{read_metadata, write_metadata, EnvMetadata};
use crate::packages::{self, Backend, PackageManager, TRUSTED_HOSTS};
use crate::progress::{OpPhase, ProgressHandler};
use crate::timeouts;

/// Manifest written into a clone target while its packages install.
const CLONE_REQUIREMENTS: &str = "requirements_clone.txt";
/// Manifest written into a rename target while its packages install.
const RENAME_REQUIREMENTS: &str = "_rename_requirements.txt";

/// Options for [`EnvironmentManager::create`].
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Interpreter to create from; the locator's default when `None`.
    pub interpreter: Option<PathBuf>,
    /// Seed pip into the environment.
    pub include_installer: bool,
    pub system_site_packages: bool,
    /// Upgrade the seeded pip right after creation.
    pub upgrade_installer: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            interpreter: None,
            include_installer: true,
            system_site_packages: false,
            upgrade_installer: true,
        }
    }
}

pub struct EnvironmentManager {
    base_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    locator: Arc<dyn LocatorService>,
    backend: Backend,
}

impl EnvironmentManager {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        locator: Arc<dyn LocatorService>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            runner,
            locator,
            backend: Backend::Pip,
        }
    }

    /// Backend used for the reinstall step of clone and rename.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn set_base_dir(&mut self, base_dir: impl Into<PathBuf>) {
        self.base_dir = base_dir.into();
        info!("[registry] Base directory is now {:?}", self.base_dir);
    }

    pub fn env_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    /// Package manager for the named environment, sharing this manager's
    /// runner, locator and backend.
    pub fn package_manager(&self, name: &str) -> PackageManager {
        PackageManager::new(
            self.env_path(name),
            self.runner.clone(),
            self.locator.clone(),
        )
        .with_backend(self.backend)
    }

    fn existing(&self, name: &str) -> Result<PathBuf, EnvError> {
        validate_name(name)?;
        let path = self.env_path(name);
        if !path.is_dir() {
            return Err(EnvError::NotFound(name.to_string()));
        }
        Ok(path)
    }

    fn vacant(&self, name: &str) -> Result<PathBuf, EnvError> {
        validate_name(name)?;
        let path = self.env_path(name);
        if path.exists() {
            return Err(EnvError::AlreadyExists {
                name: name.to_string(),
                path,
            });
        }
        Ok(path)
    }

    // ------------------------------------------------------------------
    // Create / delete
    // ------------------------------------------------------------------

    pub async fn create(
        &self,
        name: &str,
        options: &CreateOptions,
        progress: &dyn ProgressHandler,
    ) -> OpResult {
        self.try_create(name, options, progress).await.into()
    }

    async fn try_create(
        &self,
        name: &str,
        options: &CreateOptions,
        progress: &dyn ProgressHandler,
    ) -> Result<String, EnvError> {
        validate_name(name)?;
        let interpreter = options
            .interpreter
            .clone()
            .or_else(|| self.locator.default_interpreter())
            .ok_or(EnvError::NoInterpreter)?;

        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| {
                EnvError::io(
                    format!("Cannot create base directory {}", self.base_dir.display()),
                    e,
                )
            })?;
        let path = self.vacant(name)?;

        progress.on_progress(OpPhase::CreatingEnvironment {
            name: name.to_string(),
        });
        let mut args = vec!["-m".to_string(), "venv".to_string()];
        if !options.include_installer {
            args.push("--without-pip".to_string());
        }
        if options.system_site_packages {
            args.push("--system-site-packages".to_string());
        }
        args.push(path.to_string_lossy().to_string());

        let outcome = self
            .runner
            .run(&interpreter, &args, timeouts::CREATE)
            .await;
        if let Err(e) = creation_outcome(outcome, &interpreter) {
            remove_partial(&path);
            return Err(e);
        }
        info!("[registry] Created {:?} with {:?}", path, interpreter);

        let python = venv_launch::python_path(&path);
        let cancelled = progress.is_cancelled();
        if !cancelled
            && options.include_installer
            && options.upgrade_installer
            && venv_launch::installer_path(&path).exists()
        {
            progress.on_progress(OpPhase::UpgradingInstaller);
            self.upgrade_installer(&python).await;
        }

        let meta = EnvMetadata::new(name, Some(&interpreter));
        if let Err(e) = write_metadata(&path, &meta) {
            warn!("[registry] Could not write metadata for {:?}: {}", path, e);
        }

        if cancelled {
            return Err(EnvError::Cancelled);
        }
        Ok(format!("Environment '{}' created successfully", name))
    }

    /// Best-effort `pip install --upgrade pip` with trusted hosts up front.
    async fn upgrade_installer(&self, python: &Path) {
        let mut args: Vec<String> = ["-m", "pip", "install", "--upgrade", "pip"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        for host in TRUSTED_HOSTS {
            args.push("--trusted-host".to_string());
            args.push(host.to_string());
        }
        match self
            .runner
            .run(python, &args, timeouts::INSTALLER_UPGRADE)
            .await
        {
            Ok(out) if out.success() => debug!("[registry] pip upgraded in {:?}", python),
            Ok(out) if out.timed_out => warn!("[registry] pip upgrade timed out"),
            Ok(out) => warn!("[registry] pip upgrade failed: {}", out.combined().trim()),
            Err(e) => warn!("[registry] pip upgrade could not run: {}", e),
        }
    }

    /// Remove an environment directory recursively.
    pub async fn delete(&self, name: &str, progress: &dyn ProgressHandler) -> OpResult {
        self.try_delete(name, progress).await.into()
    }

    async fn try_delete(
        &self,
        name: &str,
        progress: &dyn ProgressHandler,
    ) -> Result<String, EnvError> {
        let path = self.existing(name)?;
        progress.on_progress(OpPhase::Deleting {
            name: name.to_string(),
        });
        tokio::fs::remove_dir_all(&path)
            .await
            .map_err(|e| EnvError::io(format!("Error deleting environment '{}'", name), e))?;
        info!("[registry] Deleted {:?}", path);
        Ok(format!("Environment '{}' deleted", name))
    }

    // ------------------------------------------------------------------
    // Listing
    // ------------------------------------------------------------------

    /// Environments from the filesystem alone, sorted by name.
    pub fn list_fast(&self) -> Vec<Environment> {
        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("[registry] Cannot read {:?}: {}", self.base_dir, e);
                return Vec::new();
            }
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();
        dirs.iter().map(|path| Environment::scan(path)).collect()
    }

    /// Environments with every detail probe run.
    pub async fn list(&self) -> Vec<Environment> {
        let mut envs = self.list_fast();
        for env in &mut envs {
            self.probe(env).await;
        }
        envs
    }

    /// One environment from the filesystem alone.
    pub fn find(&self, name: &str) -> Result<Environment, EnvError> {
        let path = self.existing(name)?;
        Ok(Environment::scan(&path))
    }

    /// Full detail of one environment.
    pub async fn info(&self, name: &str) -> Option<Environment> {
        let path = self.existing(name).ok()?;
        let mut env = Environment::scan(&path);
        self.probe(&mut env).await;
        Some(env)
    }

    async fn probe(&self, env: &mut Environment) {
        let size_path = env.path.clone();
        let size = async move {
            tokio::task::spawn_blocking(move || dir_size(&size_path))
                .await
                .ok()
                .flatten()
        };

        if env.is_valid {
            let (version, count, size) = tokio::join!(
                packages::interpreter_version(self.runner.as_ref(), &env.interpreter_path),
                self.count_packages(env),
                size
            );
            env.interpreter_version = version;
            env.package_count = count;
            env.size_bytes = size.into();
        } else {
            env.interpreter_version = Probe::Failed;
            env.package_count = Probe::Failed;
            env.size_bytes = size.await.into();
        }
    }

    async fn count_packages(&self, env: &Environment) -> Probe<usize> {
        if !env.has_installer() {
            return Probe::Failed;
        }
        let args = ["list".to_string(), "--format=json".to_string()];
        match self
            .runner
            .run(&env.installer_path, &args, timeouts::PACKAGE_COUNT)
            .await
        {
            Ok(out) if out.success() => packages::parse_package_list(&out.stdout)
                .map(|list| list.len())
                .into(),
            _ => Probe::Failed,
        }
    }

    // ------------------------------------------------------------------
    // Clone / rename
    // ------------------------------------------------------------------

    /// Create `target` with the same packages as `source`.
    pub async fn clone_env(
        &self,
        source: &str,
        target: &str,
        progress: &dyn ProgressHandler,
    ) -> OpResult {
        self.try_clone(source, target, progress).await.into()
    }

    async fn try_clone(
        &self,
        source: &str,
        target: &str,
        progress: &dyn ProgressHandler,
    ) -> Result<String, EnvError> {
        let source_path = self.existing(source)?;
        self.vacant(target)?;

        let manifest = self.snapshot(source, &source_path, progress).await?;
        if progress.is_cancelled() {
            return Err(EnvError::Cancelled);
        }

        let options = self.options_like(&source_path);
        self.try_create(target, &options, progress).await?;
        if progress.is_cancelled() {
            return Err(EnvError::Cancelled);
        }

        if let Err(e) = self
            .reinstall(target, &manifest, CLONE_REQUIREMENTS, progress)
            .await
        {
            return Err(EnvError::Partial(format!(
                "Created '{}' but failed to install some packages from '{}'. \
                 Both environments exist.\n{}",
                target, source, e
            )));
        }
        Ok(format!(
            "Environment '{}' cloned to '{}' successfully",
            source, target
        ))
    }

    /// Move `old` to `new` by recreating it and reinstalling its packages.
    pub async fn rename(&self, old: &str, new: &str, progress: &dyn ProgressHandler) -> OpResult {
        self.try_rename(old, new, progress).await.into()
    }

    async fn try_rename(
        &self,
        old: &str,
        new: &str,
        progress: &dyn ProgressHandler,
    ) -> Result<String, EnvError> {
        let old_path = self.existing(old)?;
        let new_path = self.vacant(new)?;

        let manifest = self.snapshot(old, &old_path, progress).await?;
        if progress.is_cancelled() {
            return Err(EnvError::Cancelled);
        }

        let options = self.options_like(&old_path);
        self.try_create(new, &options, progress).await?;
        if progress.is_cancelled() {
            return Err(EnvError::Cancelled);
        }

        if let Err(e) = self
            .reinstall(new, &manifest, RENAME_REQUIREMENTS, progress)
            .await
        {
            return Err(EnvError::Partial(format!(
                "Created '{}' but failed to install some packages. \
                 Original '{}' preserved.\n{}",
                new, old, e
            )));
        }

        let mut meta = read_metadata(&old_path).unwrap_or_else(|| {
            let mut fresh = EnvMetadata::new(new, None);
            fresh.python_path = read_metadata(&new_path).and_then(|m| m.python_path);
            fresh
        });
        meta.name = Some(new.to_string());
        meta.renamed_from = Some(old.to_string());
        if let Err(e) = write_metadata(&new_path, &meta) {
            warn!("[registry] Could not write metadata for {:?}: {}", new_path, e);
        }

        if progress.is_cancelled() {
            return Err(EnvError::Cancelled);
        }
        progress.on_progress(OpPhase::RemovingOld {
            name: old.to_string(),
        });
        if let Err(e) = tokio::fs::remove_dir_all(&old_path).await {
            return Err(EnvError::Partial(format!(
                "Created '{}' but could not remove '{}': {}. Both environments exist.",
                new, old, e
            )));
        }
        Ok(format!("Environment '{}' renamed to '{}'", old, new))
    }

    /// Freeze an environment. No installer means an empty manifest; a
    /// failing freeze is an error.
    async fn snapshot(
        &self,
        name: &str,
        path: &Path,
        progress: &dyn ProgressHandler,
    ) -> Result<String, EnvError> {
        progress.on_progress(OpPhase::Freezing {
            name: name.to_string(),
        });
        if !venv_launch::installer_path(path).exists() {
            debug!("[registry] {:?} has no pip; nothing to carry over", path);
            return Ok(String::new());
        }
        self.package_manager(name).freeze().await
    }

    /// Creation options for a copy of the environment at `path`: same
    /// interpreter when it is still installed.
    fn options_like(&self, path: &Path) -> CreateOptions {
        let interpreter = read_metadata(path)
            .and_then(|m| m.python_path)
            .map(PathBuf::from)
            .filter(|p| p.exists());
        CreateOptions {
            interpreter,
            ..CreateOptions::default()
        }
    }

    /// Install `manifest` into `target` through a temporary requirements
    /// file, removed whatever the outcome.
    async fn reinstall(
        &self,
        target: &str,
        manifest: &str,
        file_name: &str,
        progress: &dyn ProgressHandler,
    ) -> Result<(), EnvError> {
        if manifest.trim().is_empty() {
            return Ok(());
        }
        let req_file = self.env_path(target).join(file_name);
        tokio::fs::write(&req_file, manifest.as_bytes())
            .await
            .map_err(|e| EnvError::io("Cannot write requirements file", e))?;

        let result = self
            .package_manager(target)
            .try_import_requirements(&req_file, Some(timeouts::INSTALL), progress)
            .await;

        if let Err(e) = tokio::fs::remove_file(&req_file).await {
            debug!("[registry] Could not remove {:?}: {}", req_file, e);
        }
        result.map(|_| ())
    }

    /// Shell command that activates the named environment.
    pub fn activate_command(&self, name: &str) -> Result<String, EnvError> {
        let path = self.existing(name)?;
        Ok(environment::activate_command(&path))
    }
}

fn creation_outcome(
    outcome: std::io::Result<CommandOutput>,
    interpreter: &Path,
) -> Result<(), EnvError> {
    let out = outcome.map_err(|source| EnvError::Spawn {
        program: interpreter.to_path_buf(),
        source,
    })?;
    if out.timed_out {
        return Err(EnvError::Timeout {
            what: "Environment creation".to_string(),
            limit: timeouts::CREATE,
        });
    }
    if !out.success() {
        return Err(EnvError::CommandFailed {
            what: "Failed to create environment".to_string(),
            output: out.combined(),
        });
    }
    Ok(())
}

fn remove_partial(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_dir_all(path) {
            warn!("[registry] Could not clean up {:?}: {}", path, e);
        }
    }
}
