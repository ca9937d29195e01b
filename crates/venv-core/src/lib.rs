//! Python virtual environment lifecycle and package orchestration.
//!
//! This crate drives the external toolchain (`python -m venv`, `pip`, `uv`)
//! through the [`CommandRunner`](venv_launch::CommandRunner) of
//! `venv-launch`. It includes:
//!
//! - An [`EnvironmentManager`] that creates, lists, clones, renames and
//!   deletes environments under a base directory
//! - A [`PackageManager`] per environment with pip/uv backend selection and
//!   recovery from broken certificate stores
//! - A [`CancellableTask`] that runs an operation on its own tokio task and
//!   streams progress to one consumer
//! - Sidecar metadata, project-file export and user settings
//!
//! # Progress Reporting
//!
//! Every operation accepts a [`ProgressHandler`] and reports [`OpPhase`]s.
//! The handler is also how a cancellation request reaches the operation.
//!
//! ```ignore
//! use venv_core::{CancellableTask, CreateOptions, EnvironmentManager};
//!
//! let task = CancellableTask::spawn(move |ctx| async move {
//!     manager.create("demo", &CreateOptions::default(), ctx.progress()).await
//! });
//! let result = task.drive(|msg| println!("{msg}")).await;
//! ```

pub mod environment;
pub mod error;
pub mod export;
pub mod metadata;
pub mod packages;
pub mod progress;
pub mod registry;
pub mod settings;
pub mod task;
pub mod timeouts;

// Re-export key types
pub use environment::{Environment, Probe};
pub use error::{EnvError, OpResult};
pub use export::ExportFormat;
pub use metadata::EnvMetadata;
pub use packages::{Backend, Package, PackageManager};
pub use progress::{LogHandler, OpPhase, ProgressHandler};
pub use registry::{CreateOptions, EnvironmentManager};
pub use settings::Settings;
pub use task::{CancelOutcome, CancellableTask, TaskContext, TaskEvent, TaskHandle};
