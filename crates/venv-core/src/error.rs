//! Error taxonomy and the `(success, message)` result every public
//! operation returns.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Message of the result reported for a cancelled task.
pub const CANCELLED_MESSAGE: &str = "Operation cancelled";

/// Internal error type for environment and package operations.
///
/// Never crosses a public operation boundary: [`OpResult::from`] turns it
/// into a message.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("Invalid environment name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Environment '{name}' already exists at {}", path.display())]
    AlreadyExists { name: String, path: PathBuf },

    #[error("Environment '{0}' not found")]
    NotFound(String),

    #[error("No Python interpreter found; pass one explicitly or configure a default")]
    NoInterpreter,

    #[error("No packages specified")]
    NoPackages,

    #[error("No packages to export")]
    NothingToExport,

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to run {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{what} timed out ({}s)", limit.as_secs())]
    Timeout { what: String, limit: Duration },

    #[error("{what}:\n{output}")]
    CommandFailed { what: String, output: String },

    #[error("Package not found: {spec}. Check the name and version on PyPI; the index has no distribution matching it.")]
    PackageNotFound { spec: String },

    /// An earlier step succeeded and a later one failed; the message names
    /// what now exists on disk.
    #[error("{0}")]
    Partial(String),

    #[error("{}", CANCELLED_MESSAGE)]
    Cancelled,
}

impl EnvError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        EnvError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Final outcome of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpResult {
    pub success: bool,
    pub message: String,
    /// Set only on the result a cancelled task reports.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl OpResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            cancelled: false,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            cancelled: false,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            success: false,
            message: CANCELLED_MESSAGE.to_string(),
            cancelled: true,
        }
    }
}

impl From<Result<String, EnvError>> for OpResult {
    fn from(result: Result<String, EnvError>) -> Self {
        match result {
            Ok(message) => OpResult::ok(message),
            Err(EnvError::Cancelled) => OpResult::cancelled(),
            Err(e) => OpResult::fail(e.to_string()),
        }
    }
}

impl std::fmt::Display for OpResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}
