//! Project files derived from an environment's package manifest.
//!
//! Every format is rendered from the freeze output and the interpreter's
//! `major.minor` version. Renderers are pure; [`export`] does the I/O.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use venv_launch::locator::major_minor;

use crate::error::{EnvError, OpResult};
use crate::packages::PackageManager;

/// Interpreter version used when the environment's cannot be determined.
pub const DEFAULT_PYTHON_VERSION: &str = "3.12";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportFormat {
    /// `requirements.txt`, the freeze output verbatim.
    Requirements,
    /// `Dockerfile` plus `requirements.txt` next to it.
    Dockerfile,
    /// `docker-compose.yml` plus a `Dockerfile` and `requirements.txt`.
    Compose,
    /// `pyproject.toml` with the manifest as dependencies.
    Pyproject,
    /// Conda `environment.yml` installing the manifest through pip.
    Conda,
}

impl ExportFormat {
    /// Conventional file name of the primary artifact.
    pub fn default_file_name(&self) -> &'static str {
        match self {
            ExportFormat::Requirements => "requirements.txt",
            ExportFormat::Dockerfile => "Dockerfile",
            ExportFormat::Compose => "docker-compose.yml",
            ExportFormat::Pyproject => "pyproject.toml",
            ExportFormat::Conda => "environment.yml",
        }
    }
}

/// Non-empty, non-comment lines of a freeze blob.
fn requirement_lines(freeze: &str) -> impl Iterator<Item = &str> {
    freeze
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

pub fn render_dockerfile(py_ver: &str) -> String {
    format!(
        "# Generated by venvdeck\n\
         FROM python:{py_ver}-slim\n\
         \n\
         WORKDIR /app\n\
         \n\
         RUN apt-get update && apt-get install -y --no-install-recommends \\\n    gcc \\\n    && rm -rf /var/lib/apt/lists/*\n\
         \n\
         COPY requirements.txt .\n\
         RUN pip install --no-cache-dir -r requirements.txt\n\
         \n\
         COPY . .\n\
         \n\
         # CMD [\"python\", \"main.py\"]\n"
    )
}

/// Minimal Dockerfile that accompanies a compose file.
fn render_compose_dockerfile(py_ver: &str) -> String {
    format!(
        "FROM python:{py_ver}-slim\n\
         WORKDIR /app\n\
         COPY requirements.txt .\n\
         RUN pip install --no-cache-dir -r requirements.txt\n\
         COPY . .\n"
    )
}

pub fn render_compose(service: &str) -> String {
    format!(
        "# Generated by venvdeck\n\
         version: '3.8'\n\
         \n\
         services:\n  \
           app:\n    \
             build: .\n    \
             container_name: {service}\n    \
             ports:\n      \
               - \"8000:8000\"\n    \
             volumes:\n      \
               - .:/app\n    \
             environment:\n      \
               - PYTHONUNBUFFERED=1\n"
    )
}

pub fn render_pyproject(project: &str, py_ver: &str, freeze: &str) -> String {
    let deps: String = requirement_lines(freeze)
        .map(|line| format!("    \"{}\",\n", line.replace('"', "\\\"")))
        .collect();
    format!(
        "[build-system]\n\
         requires = [\"setuptools>=68.0\", \"wheel\"]\n\
         build-backend = \"setuptools.build_meta\"\n\
         \n\
         [project]\n\
         name = \"{project}\"\n\
         version = \"0.1.0\"\n\
         requires-python = \">={py_ver}\"\n\
         dependencies = [\n{deps}]\n"
    )
}

pub fn render_conda(env_name: &str, py_ver: &str, freeze: &str) -> String {
    let deps: String = requirement_lines(freeze)
        .map(|line| format!("    - {}\n", line))
        .collect();
    format!(
        "name: {env_name}\n\
         channels:\n  - defaults\n  - conda-forge\n\
         dependencies:\n  - python={py_ver}\n  - pip\n  - pip:\n{deps}"
    )
}

/// Files (path, content) that make up `format`, with the primary artifact
/// at `output` and companions in the same directory.
pub fn render(
    format: ExportFormat,
    output: &Path,
    env_name: &str,
    py_ver: &str,
    freeze: &str,
) -> Vec<(PathBuf, String)> {
    let dir = output.parent().unwrap_or_else(|| Path::new(""));
    let requirements = (dir.join("requirements.txt"), freeze.to_string());
    match format {
        ExportFormat::Requirements => vec![(output.to_path_buf(), freeze.to_string())],
        ExportFormat::Dockerfile => vec![
            (output.to_path_buf(), render_dockerfile(py_ver)),
            requirements,
        ],
        ExportFormat::Compose => vec![
            (output.to_path_buf(), render_compose(env_name)),
            (dir.join("Dockerfile"), render_compose_dockerfile(py_ver)),
            requirements,
        ],
        ExportFormat::Pyproject => vec![(
            output.to_path_buf(),
            render_pyproject(env_name, py_ver, freeze),
        )],
        ExportFormat::Conda => vec![(output.to_path_buf(), render_conda(env_name, py_ver, freeze))],
    }
}

/// Freeze the environment behind `packages` and write `format` to `output`.
pub async fn export(
    packages: &PackageManager,
    format: ExportFormat,
    output: &Path,
) -> OpResult {
    try_export(packages, format, output).await.into()
}

async fn try_export(
    packages: &PackageManager,
    format: ExportFormat,
    output: &Path,
) -> Result<String, EnvError> {
    let freeze = packages.freeze().await?;
    if freeze.trim().is_empty() {
        return Err(EnvError::NothingToExport);
    }
    let py_ver = packages
        .interpreter_version()
        .await
        .value()
        .and_then(|v| major_minor(v))
        .unwrap_or_else(|| DEFAULT_PYTHON_VERSION.to_string());
    let env_name = packages
        .env_path()
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "app".to_string());

    let files = render(format, output, &env_name, &py_ver, &freeze);
    let mut written = Vec::with_capacity(files.len());
    for (path, content) in files {
        tokio::fs::write(&path, content.as_bytes())
            .await
            .map_err(|e| EnvError::io(format!("Error writing {}", path.display()), e))?;
        written.push(path.display().to_string());
    }
    log::info!("[export] Wrote {:?} for '{}'", format, env_name);
    Ok(format!("Exported: {}", written.join(", ")))
}
