//! Progress reporting for environment and package operations.
//!
//! Provides [`OpPhase`] events covering the steps of every multi-step
//! operation and a [`ProgressHandler`] trait that consumers implement to route
//! them to their UI layer. Each phase renders to the one-line message the
//! presentation layer shows.

use serde::{Deserialize, Serialize};

/// Steps reported while an operation runs.
///
/// Serializable for transport over IPC / `--json` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum OpPhase {
    /// Running the interpreter's environment-creation command.
    CreatingEnvironment { name: String },
    /// Pre-emptive self-upgrade of the new environment's installer.
    UpgradingInstaller,
    /// Reading the installed-package manifest of an environment.
    Freezing { name: String },
    /// Installing named packages.
    InstallingPackages { packages: Vec<String> },
    /// Installing from a requirements file into an environment.
    InstallingRequirements { target: String },
    /// Removing named packages.
    UninstallingPackages { packages: Vec<String> },
    /// A secure-transport failure was detected; retrying with trusted hosts.
    RetryingWithTrustedHosts,
    /// Installing the fast installer into the environment.
    BootstrappingBackend { backend: String },
    /// The fast installer is unavailable; this call uses pip instead.
    BackendFallback { requested: String, reason: String },
    /// Removing an environment directory.
    Deleting { name: String },
    /// Final step of a rename.
    RemovingOld { name: String },
    /// Free-form message.
    Message { text: String },
}

impl std::fmt::Display for OpPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpPhase::CreatingEnvironment { name } => {
                write!(f, "Creating environment '{}'...", name)
            }
            OpPhase::UpgradingInstaller => write!(f, "Upgrading pip..."),
            OpPhase::Freezing { name } => write!(f, "Getting packages from '{}'...", name),
            OpPhase::InstallingPackages { packages } => {
                write!(f, "Installing: {}...", packages.join(", "))
            }
            OpPhase::InstallingRequirements { target } => {
                write!(f, "Installing packages into '{}'...", target)
            }
            OpPhase::UninstallingPackages { packages } => {
                write!(f, "Uninstalling: {}...", packages.join(", "))
            }
            OpPhase::RetryingWithTrustedHosts => {
                write!(f, "Certificate verification failed, retrying with trusted hosts...")
            }
            OpPhase::BootstrappingBackend { backend } => {
                write!(f, "{} not found, installing it into the environment...", backend)
            }
            OpPhase::BackendFallback { requested, reason } => {
                write!(f, "{} unavailable ({}), using pip for this operation", requested, reason)
            }
            OpPhase::Deleting { name } => write!(f, "Deleting '{}'...", name),
            OpPhase::RemovingOld { name } => write!(f, "Removing old '{}'...", name),
            OpPhase::Message { text } => f.write_str(text),
        }
    }
}

/// Trait for receiving operation progress.
///
/// Implement this to route progress to your UI layer. Handlers are also the
/// channel through which a cancellation request reaches a running
/// operation: multi-step operations consult [`is_cancelled`] between
/// subprocess invocations.
///
/// [`is_cancelled`]: ProgressHandler::is_cancelled
pub trait ProgressHandler: Send + Sync {
    /// Called for each step of an operation.
    fn on_progress(&self, phase: OpPhase);

    /// Whether the consumer asked for the operation to stop.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Log-only progress handler.
///
/// Writes progress phases to the `log` crate at info level.
pub struct LogHandler;

impl ProgressHandler for LogHandler {
    fn on_progress(&self, phase: OpPhase) {
        match &phase {
            OpPhase::RetryingWithTrustedHosts | OpPhase::BackendFallback { .. } => {
                log::warn!("[venvdeck] {}", phase);
            }
            _ => log::info!("[venvdeck] {}", phase),
        }
    }
}

/// Handler that discards everything.
pub struct Silent;

impl ProgressHandler for Silent {
    fn on_progress(&self, _phase: OpPhase) {}
}

/// Any `Fn(&str)` closure receives the rendered message.
impl<F> ProgressHandler for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_progress(&self, phase: OpPhase) {
        self(&phase.to_string())
    }
}
