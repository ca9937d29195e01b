//! Per-subprocess timeouts, proportional to the expected cost of each call.

use std::time::Duration;

/// `python --version`, `python -c "import ssl"`.
pub const VERSION_PROBE: Duration = Duration::from_secs(5);
/// `pip list` used only to count packages for a listing.
pub const PACKAGE_COUNT: Duration = Duration::from_secs(10);
/// `pip freeze`.
pub const FREEZE: Duration = Duration::from_secs(15);
/// `pip list` / `pip show`.
pub const LIST: Duration = Duration::from_secs(60);
/// `python -m venv`.
pub const CREATE: Duration = Duration::from_secs(120);
/// Self-upgrade of a freshly created environment's pip.
pub const INSTALLER_UPGRADE: Duration = Duration::from_secs(60);
pub const UNINSTALL: Duration = Duration::from_secs(60);
/// `pip list --outdated` (touches the network).
pub const OUTDATED: Duration = Duration::from_secs(60);
pub const INSTALL: Duration = Duration::from_secs(300);
/// Bulk `pip install -r`.
pub const IMPORT: Duration = Duration::from_secs(600);
/// How long a caller waits for a cancelled task before calling it
/// unresponsive.
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);
