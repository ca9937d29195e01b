//! Process launching and tool lookup for venvdeck.
//!
//! This crate provides the two foundations the environment crate builds on:
//!
//! - A [`CommandRunner`] that executes `python`, `pip` and `uv` with an
//!   enforced timeout, killing the child when it expires
//! - A [`LocatorService`] that finds interpreters and the fast installer
//!   (`uv`) inside an environment or on `PATH`
//!
//! ```ignore
//! use venv_launch::{CommandRunner, SystemRunner};
//!
//! let out = SystemRunner.run(&python, &["--version".into()], timeout).await?;
//! ```

pub mod locator;
pub mod runner;

// Re-export commonly used items
pub use locator::{
    binary_path_for_env, installer_path, python_path, scripts_dir, InterpreterInfo,
    LocatorService, SystemLocator,
};
pub use runner::{CommandOutput, CommandRunner, SystemRunner};
