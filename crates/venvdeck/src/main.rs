use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};
use venv_core::environment::human_size;
use venv_core::export::{self, ExportFormat};
use venv_core::settings::{load_settings, save_settings};
use venv_core::{
    timeouts, Backend, CancelOutcome, CancellableTask, CreateOptions, Environment,
    EnvironmentManager, OpResult, Package, PackageManager, Settings, TaskContext, TaskEvent,
};
use venv_launch::{LocatorService, SystemLocator, SystemRunner};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding the environments (default: from settings, ~/venv)
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new environment
    Create {
        name: String,
        /// Interpreter to create the environment with
        #[arg(long)]
        python: Option<PathBuf>,
        /// Do not seed pip into the environment
        #[arg(long)]
        without_pip: bool,
        /// Give the environment access to the interpreter's site-packages
        #[arg(long)]
        system_site_packages: bool,
        /// Skip upgrading pip after creation
        #[arg(long)]
        no_upgrade_pip: bool,
        /// Install a requirements file once the environment exists
        #[arg(short, long)]
        requirements: Option<PathBuf>,
    },
    /// Delete an environment
    Delete {
        name: String,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// List environments
    List {
        /// Skip version, package and size probes
        #[arg(long)]
        fast: bool,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Show details of one environment
    Info {
        name: String,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Copy an environment and its packages under a new name
    Clone { source: String, target: String },
    /// Rename an environment (recreates it and reinstalls its packages)
    Rename { old: String, new: String },
    /// Install packages into an environment
    Install {
        env: String,
        #[arg(required = true)]
        packages: Vec<String>,
        /// Upgrade packages that are already installed
        #[arg(short = 'U', long)]
        upgrade: bool,
        /// Installer to use (default: from settings)
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
    },
    /// Remove packages from an environment
    Uninstall {
        env: String,
        #[arg(required = true)]
        packages: Vec<String>,
        /// Installer to use (default: from settings)
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
    },
    /// List the packages installed in an environment
    Packages {
        env: String,
        /// Only packages with a newer release
        #[arg(long)]
        outdated: bool,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Print an environment's installed-package manifest
    Freeze { name: String },
    /// Write requirements or project files derived from an environment
    Export {
        env: String,
        #[arg(long, value_enum, default_value = "requirements")]
        format: FormatArg,
        /// Output file (default: the format's conventional name in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Install a requirements file into an environment
    Import {
        env: String,
        file: PathBuf,
        /// Installer to use (default: from settings)
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
    },
    /// Print the shell command that activates an environment
    Activate { name: String },
    /// List Python interpreters found on this system
    Pythons {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Pip,
    Uv,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Pip => Backend::Pip,
            BackendArg::Uv => Backend::Uv,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Requirements,
    Dockerfile,
    Compose,
    Pyproject,
    Conda,
}

impl From<FormatArg> for ExportFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Requirements => ExportFormat::Requirements,
            FormatArg::Dockerfile => ExportFormat::Dockerfile,
            FormatArg::Compose => ExportFormat::Compose,
            FormatArg::Pyproject => ExportFormat::Pyproject,
            FormatArg::Conda => ExportFormat::Conda,
        }
    }
}

#[derive(Tabled)]
struct EnvTableRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "PYTHON")]
    python: String,
    #[tabled(rename = "PACKAGES")]
    packages: String,
    #[tabled(rename = "SIZE")]
    size: String,
    #[tabled(rename = "CREATED")]
    created: String,
    #[tabled(rename = "STATUS")]
    status: String,
}

impl From<&Environment> for EnvTableRow {
    fn from(env: &Environment) -> Self {
        EnvTableRow {
            name: env.name.clone(),
            python: env.interpreter_version.display(),
            packages: env.package_count.display(),
            size: env
                .size_bytes
                .value()
                .map(|b| human_size(*b))
                .unwrap_or_else(|| env.size_bytes.display()),
            created: env
                .created_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string()),
            status: (if env.is_valid { "ok" } else { "broken" }).to_string(),
        }
    }
}

#[derive(Tabled)]
struct PackageTableRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "VERSION")]
    version: String,
    #[tabled(rename = "LATEST")]
    latest: String,
}

impl From<&Package> for PackageTableRow {
    fn from(package: &Package) -> Self {
        PackageTableRow {
            name: package.name.clone(),
            version: package.installed_version.clone(),
            latest: package
                .latest_version
                .clone()
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Serialize, Tabled)]
struct PythonTableRow {
    #[tabled(rename = "VERSION")]
    version: String,
    #[tabled(rename = "PATH")]
    path: String,
}

/// Shorten a path for display by replacing home directory with ~
fn shorten_path(path: &Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(relative) = path.strip_prefix(&home) {
            return format!("~/{}", relative.display());
        }
    }
    path.display().to_string()
}

/// Shared state for one invocation.
struct App {
    settings: Settings,
    manager: Arc<EnvironmentManager>,
    locator: Arc<SystemLocator>,
}

impl App {
    fn new(base_dir: Option<PathBuf>) -> Self {
        let settings = load_settings();
        let base_dir = base_dir.unwrap_or_else(|| settings.base_dir.clone());
        let runner = Arc::new(SystemRunner);
        let locator = Arc::new(
            SystemLocator::new(settings.default_python.clone()).with_runner(runner.clone()),
        );
        let manager = EnvironmentManager::new(base_dir, runner, locator.clone())
            .with_backend(settings.installer_backend);
        Self {
            settings,
            manager: Arc::new(manager),
            locator,
        }
    }

    /// Package manager for an existing, working environment.
    fn packages(&self, env: &str, backend: Option<BackendArg>) -> Result<PackageManager> {
        let found = self.manager.find(env)?;
        if !found.is_valid {
            anyhow::bail!(
                "Environment '{}' has no interpreter at {}",
                env,
                found.interpreter_path.display()
            );
        }
        let backend = backend.map(Backend::from).unwrap_or(self.settings.installer_backend);
        Ok(self.manager.package_manager(env).with_backend(backend))
    }

    /// Record `name` as recently used. Failure to persist is not fatal.
    fn touch_recent(&mut self, name: &str) {
        self.settings.add_recent(name);
        if let Err(e) = save_settings(&self.settings) {
            log::warn!("Could not save settings: {}", e);
        }
    }

    fn forget_recent(&mut self, name: &str) {
        self.settings.forget_recent(name);
        if let Err(e) = save_settings(&self.settings) {
            log::warn!("Could not save settings: {}", e);
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main(cli.command, cli.base_dir))
}

async fn async_main(command: Commands, base_dir: Option<PathBuf>) -> Result<()> {
    let mut app = App::new(base_dir);

    match command {
        Commands::Create {
            name,
            python,
            without_pip,
            system_site_packages,
            no_upgrade_pip,
            requirements,
        } => {
            let options = CreateOptions {
                interpreter: python,
                include_installer: !without_pip,
                system_site_packages,
                upgrade_installer: app.settings.upgrade_installer && !no_upgrade_pip,
            };
            create_env(&mut app, name, options, requirements).await?
        }
        Commands::Delete { name, yes } => delete_env(&mut app, name, yes).await?,
        Commands::List { fast, json } => list_envs(&app, fast, json).await?,
        Commands::Info { name, json } => show_env(&app, &name, json).await?,
        Commands::Clone { source, target } => {
            let manager = app.manager.clone();
            let (src, dst) = (source.clone(), target.clone());
            run_task(move |ctx| async move { manager.clone_env(&src, &dst, ctx.progress()).await })
                .await?;
            app.touch_recent(&target);
        }
        Commands::Rename { old, new } => {
            let manager = app.manager.clone();
            let (from, to) = (old.clone(), new.clone());
            run_task(move |ctx| async move { manager.rename(&from, &to, ctx.progress()).await })
                .await?;
            app.forget_recent(&old);
            app.touch_recent(&new);
        }
        Commands::Install {
            env,
            packages,
            upgrade,
            backend,
        } => {
            let pm = app.packages(&env, backend)?;
            run_task(move |ctx| async move { pm.install(&packages, upgrade, ctx.progress()).await })
                .await?;
            app.touch_recent(&env);
        }
        Commands::Uninstall {
            env,
            packages,
            backend,
        } => {
            let pm = app.packages(&env, backend)?;
            run_task(move |ctx| async move { pm.uninstall(&packages, ctx.progress()).await })
                .await?;
            app.touch_recent(&env);
        }
        Commands::Packages {
            env,
            outdated,
            json,
        } => list_packages(&app, &env, outdated, json).await?,
        Commands::Freeze { name } => {
            let pm = app.packages(&name, None)?;
            print!("{}", pm.freeze().await?);
        }
        Commands::Export {
            env,
            format,
            output,
        } => {
            let pm = app.packages(&env, None)?;
            let format = ExportFormat::from(format);
            let output = output.unwrap_or_else(|| PathBuf::from(format.default_file_name()));
            let result = match format {
                ExportFormat::Requirements => pm.export_requirements(&output).await,
                other => export::export(&pm, other, &output).await,
            };
            report(result)?;
        }
        Commands::Import { env, file, backend } => {
            let pm = app.packages(&env, backend)?;
            run_task(move |ctx| async move {
                pm.import_requirements(&file, None, ctx.progress()).await
            })
            .await?;
            app.touch_recent(&env);
        }
        Commands::Activate { name } => {
            println!("{}", app.manager.activate_command(&name)?);
        }
        Commands::Pythons { json } => list_pythons(&app, json).await?,
    }

    Ok(())
}

/// Turn a final result into the process outcome.
fn report(result: OpResult) -> Result<()> {
    if result.success {
        println!("{}", result.message);
        Ok(())
    } else {
        anyhow::bail!("{}", result.message)
    }
}

/// Run an operation as a cancellable task, printing progress to stderr.
/// Ctrl+C requests cancellation and waits a bounded time for the task.
async fn run_task<F, Fut>(op: F) -> Result<()>
where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = OpResult> + Send + 'static,
{
    let mut handle = CancellableTask::spawn(op);
    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(TaskEvent::Progress(message)) => eprintln!("{}", message),
                Some(TaskEvent::Finished(result)) => return report(result),
                None => anyhow::bail!("Operation ended without a result"),
            },
            _ = tokio::signal::ctrl_c(), if !handle.is_cancelled() => {
                eprintln!("\nCancelling...");
                if handle.cancel_and_wait(timeouts::CANCEL_GRACE).await
                    == CancelOutcome::Unresponsive
                {
                    anyhow::bail!(
                        "Operation did not stop within {}s; partial state may remain",
                        timeouts::CANCEL_GRACE.as_secs()
                    );
                }
            }
        }
    }
}

async fn create_env(
    app: &mut App,
    name: String,
    options: CreateOptions,
    requirements: Option<PathBuf>,
) -> Result<()> {
    let manager = app.manager.clone();
    let env = name.clone();
    run_task(move |ctx| async move {
        let created = manager.create(&env, &options, ctx.progress()).await;
        let Some(file) = requirements else {
            return created;
        };
        if !created.success || ctx.is_cancelled() {
            return created;
        }
        let imported = manager
            .package_manager(&env)
            .import_requirements(&file, None, ctx.progress())
            .await;
        if imported.success {
            OpResult::ok(format!("{}\n{}", created.message, imported.message.trim_end()))
        } else {
            OpResult::fail(format!(
                "Environment '{}' created, but installing {} failed:\n{}",
                env,
                file.display(),
                imported.message
            ))
        }
    })
    .await?;
    app.touch_recent(&name);
    Ok(())
}

async fn delete_env(app: &mut App, name: String, yes: bool) -> Result<()> {
    let env = app.manager.find(&name)?;
    if !yes {
        eprint!(
            "Delete environment '{}' at {}? [y/N] ",
            name,
            shorten_path(&env.path)
        );
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") {
            eprintln!("Cancelled.");
            return Ok(());
        }
    }
    let manager = app.manager.clone();
    let target = name.clone();
    run_task(move |ctx| async move { manager.delete(&target, ctx.progress()).await }).await?;
    app.forget_recent(&name);
    Ok(())
}

async fn list_envs(app: &App, fast: bool, json: bool) -> Result<()> {
    let envs = if fast {
        app.manager.list_fast()
    } else {
        app.manager.list().await
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&envs)?);
        return Ok(());
    }
    if envs.is_empty() {
        println!(
            "No environments found in {}",
            shorten_path(app.manager.base_dir())
        );
        return Ok(());
    }

    let rows: Vec<EnvTableRow> = envs.iter().map(EnvTableRow::from).collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    Ok(())
}

async fn show_env(app: &App, name: &str, json: bool) -> Result<()> {
    let Some(env) = app.manager.info(name).await else {
        anyhow::bail!("Environment '{}' not found", name);
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&env)?);
        return Ok(());
    }

    println!("Name:        {}", env.name);
    println!("Path:        {}", shorten_path(&env.path));
    println!("Status:      {}", if env.is_valid { "ok" } else { "broken" });
    println!("Python:      {}", env.interpreter_version.display());
    println!("Packages:    {}", env.package_count.display());
    println!(
        "Size:        {}",
        env.size_bytes
            .value()
            .map(|b| human_size(*b))
            .unwrap_or_else(|| env.size_bytes.display())
    );
    if let Some(created) = env.created_at {
        println!("Created:     {}", created.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(meta) = &env.metadata {
        if let Some(python) = &meta.python_path {
            println!("Created by:  {} ({})", meta.created_by, python);
        }
        if let Some(old) = &meta.renamed_from {
            println!("Renamed from: {}", old);
        }
    }
    println!("Activate:    {}", env.activate_command());
    Ok(())
}

async fn list_packages(app: &App, env: &str, outdated: bool, json: bool) -> Result<()> {
    let pm = app.packages(env, None)?;
    let packages = if outdated {
        pm.list_outdated(&venv_core::LogHandler).await
    } else {
        pm.list_installed().await
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&packages)?);
        return Ok(());
    }
    if packages.is_empty() {
        if outdated {
            println!("All packages are up to date (or the index could not be reached).");
        } else {
            println!("No packages found in '{}'.", env);
        }
        return Ok(());
    }

    let rows: Vec<PackageTableRow> = packages.iter().map(PackageTableRow::from).collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    Ok(())
}

async fn list_pythons(app: &App, json: bool) -> Result<()> {
    let rows: Vec<PythonTableRow> = app
        .locator
        .find_interpreters()
        .await
        .into_iter()
        .map(|info| PythonTableRow {
            version: info.version,
            path: shorten_path(&info.path),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No Python interpreters found on PATH.");
        return Ok(());
    }
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    Ok(())
}
