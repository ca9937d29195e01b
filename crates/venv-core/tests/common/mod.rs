//! Scripted stand-in for `python`, `pip` and `uv`.
//!
//! `FakeToolchain` implements `CommandRunner` by interpreting the argument
//! lists the crate issues: `-m venv` creates the directory layout, pip
//! subcommands mutate an in-memory package set per environment. Every call is
//! recorded so tests can assert on what was run.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use venv_core::progress::{OpPhase, ProgressHandler};
use venv_launch::{CommandOutput, CommandRunner, InterpreterInfo, LocatorService};

pub const FAKE_VERSION: &str = "3.11.4";

/// Flags that take a value and never name a package.
const VALUE_FLAGS: &[&str] = &["--trusted-host", "--allow-insecure-host", "--python"];

#[derive(Default)]
pub struct FakeState {
    /// Installed packages per environment directory.
    pub envs: HashMap<PathBuf, BTreeMap<String, String>>,
    pub calls: Vec<(PathBuf, Vec<String>)>,
    /// Network calls (`install`, `list --outdated`) without trusted hosts
    /// that fail with a certificate error before one succeeds.
    pub transport_failures: usize,
    /// Calls carrying any of these arguments (`"install"`, `"venv"`, ...)
    /// are reported as killed after their timeout.
    pub timeout_on: HashSet<String>,
    /// `python -c "import ssl"` fails.
    pub broken_ssl: bool,
    /// Packages the index does not have.
    pub missing: HashSet<String>,
    /// Packages whose install fails with a build error.
    pub broken: HashSet<String>,
    /// Packages reported by `list --outdated`, with their latest version.
    pub outdated: HashMap<String, String>,
    pub fail_venv: bool,
    pub fail_freeze: bool,
    /// Delay before answering any pip install.
    pub install_delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct FakeToolchain {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F: FnOnce(&mut FakeState)>(&self, f: F) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn calls(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls whose arguments contain `needle`.
    pub fn calls_with(&self, needle: &str) -> Vec<(PathBuf, Vec<String>)> {
        self.calls()
            .into_iter()
            .filter(|(_, args)| args.iter().any(|a| a == needle))
            .collect()
    }

    pub fn packages(&self, env_path: &Path) -> BTreeMap<String, String> {
        self.state
            .lock()
            .unwrap()
            .envs
            .get(env_path)
            .cloned()
            .unwrap_or_default()
    }

    fn dispatch(&self, program: &Path, args: &[String]) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        state.calls.push((program.to_path_buf(), args.to_vec()));

        let file = program
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let is_venv = args.len() >= 3 && args[0] == "-m" && args[1] == "venv";
        if args.iter().any(|a| state.timeout_on.contains(a)) {
            if is_venv {
                // A killed `venv` leaves a half-built directory behind.
                if let Some(target) = args.last() {
                    std::fs::create_dir_all(venv_launch::scripts_dir(Path::new(target))).unwrap();
                }
            }
            return CommandOutput::timeout();
        }
        if is_venv {
            return create_venv(&mut state, args);
        }
        match file.as_str() {
            "uv" => {
                // uv pip <sub> --python <python> <rest...>
                let Some(pos) = args.iter().position(|a| a == "--python") else {
                    return CommandOutput::failed(2, "error: no --python given");
                };
                let env = env_of(Path::new(&args[pos + 1]));
                let mut sub = vec![args[1].clone()];
                sub.extend(args[pos + 2..].iter().cloned());
                pip(&mut state, &env, &sub)
            }
            "pip" => {
                let env = env_of(program);
                pip(&mut state, &env, args)
            }
            _ => {
                let env = env_of(program);
                match args.first().map(String::as_str) {
                    Some("--version") => CommandOutput::ok(format!("Python {}\n", FAKE_VERSION)),
                    Some("-c") if state.broken_ssl => CommandOutput::failed(
                        1,
                        "ModuleNotFoundError: No module named '_ssl'\n",
                    ),
                    Some("-c") => CommandOutput::ok(""),
                    Some("-m") if args.get(1).map(String::as_str) == Some("pip") => {
                        pip(&mut state, &env, &args[2..])
                    }
                    _ => CommandOutput::failed(2, "unsupported invocation"),
                }
            }
        }
    }
}

/// `<env>/bin/python` -> `<env>`.
fn env_of(program: &Path) -> PathBuf {
    program
        .parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

fn create_venv(state: &mut FakeState, args: &[String]) -> CommandOutput {
    let Some(target) = args.last().map(PathBuf::from) else {
        return CommandOutput::failed(2, "usage: venv dir");
    };
    let with_pip = !args.iter().any(|a| a == "--without-pip");

    let python = venv_launch::python_path(&target);
    std::fs::create_dir_all(python.parent().unwrap()).unwrap();
    if state.fail_venv {
        return CommandOutput::failed(1, "Error: ensurepip failed\n");
    }
    std::fs::write(&python, "").unwrap();

    let mut packages = BTreeMap::new();
    if with_pip {
        std::fs::write(venv_launch::installer_path(&target), "").unwrap();
        packages.insert("pip".to_string(), "23.0".to_string());
    }
    state.envs.insert(target, packages);
    CommandOutput::ok("")
}

/// Positional arguments of a pip subcommand.
fn positionals(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if VALUE_FLAGS.contains(&arg.as_str()) {
            iter.next();
        } else if !arg.starts_with('-') {
            out.push(arg.clone());
        }
    }
    out
}

fn split_spec(spec: &str) -> (String, Option<String>) {
    match spec.split_once("==") {
        Some((name, version)) => (name.trim().to_lowercase(), Some(version.trim().to_string())),
        None => (spec.trim().to_lowercase(), None),
    }
}

fn to_json(packages: &[(String, String, Option<String>)]) -> String {
    let entries: Vec<serde_json::Value> = packages
        .iter()
        .map(|(name, version, latest)| match latest {
            Some(latest) => {
                serde_json::json!({"name": name, "version": version, "latest_version": latest})
            }
            None => serde_json::json!({"name": name, "version": version}),
        })
        .collect();
    serde_json::to_string(&entries).unwrap()
}

fn pip(state: &mut FakeState, env: &Path, args: &[String]) -> CommandOutput {
    let Some(sub) = args.first() else {
        return CommandOutput::failed(2, "usage: pip <command>");
    };
    let trusted = args
        .iter()
        .any(|a| a == "--trusted-host" || a == "--allow-insecure-host");
    let rest = &args[1..];

    let networked = match sub.as_str() {
        "install" => true,
        "list" => rest.iter().any(|a| a == "--outdated"),
        _ => false,
    };
    if networked && !trusted && state.transport_failures > 0 {
        state.transport_failures -= 1;
        return CommandOutput::failed(
            1,
            "WARNING: Retrying after connection broken by 'SSLError(SSLCertVerificationError(1, '[SSL: CERTIFICATE_VERIFY_FAILED] certificate verify failed: unable to get local issuer certificate'))'\n",
        );
    }

    match sub.as_str() {
        "install" => {

            let mut specs = Vec::new();
            let mut iter = rest.iter();
            while let Some(arg) = iter.next() {
                if arg == "-r" {
                    let Some(file) = iter.next() else {
                        return CommandOutput::failed(2, "-r needs a file");
                    };
                    let Ok(content) = std::fs::read_to_string(file) else {
                        return CommandOutput::failed(1, "Could not open requirements file");
                    };
                    specs.extend(
                        content
                            .lines()
                            .map(str::trim)
                            .filter(|l| !l.is_empty() && !l.starts_with('#'))
                            .map(str::to_string),
                    );
                } else if VALUE_FLAGS.contains(&arg.as_str()) {
                    iter.next();
                } else if !arg.starts_with('-') {
                    specs.push(arg.clone());
                }
            }

            for spec in &specs {
                let (name, _) = split_spec(spec);
                if state.missing.contains(&name) {
                    return CommandOutput::failed(
                        1,
                        format!(
                            "ERROR: Could not find a version that satisfies the requirement {spec} (from versions: none)\nERROR: No matching distribution found for {spec}\n"
                        ),
                    );
                }
                if state.broken.contains(&name) {
                    return CommandOutput::failed(
                        1,
                        format!(
                            "error: subprocess-exited-with-error\n  Building wheel for {name} failed\n"
                        ),
                    );
                }
            }

            let installed = state.envs.entry(env.to_path_buf()).or_default();
            for spec in &specs {
                let (name, version) = split_spec(spec);
                let version = version
                    .or_else(|| installed.get(&name).cloned())
                    .unwrap_or_else(|| "1.0".to_string());
                if name == "uv" {
                    std::fs::write(venv_launch::binary_path_for_env(env, "uv"), "").unwrap();
                }
                installed.insert(name, version);
            }
            CommandOutput::ok(format!("Successfully installed {}\n", specs.join(" ")))
        }
        "uninstall" => {
            let installed = state.envs.entry(env.to_path_buf()).or_default();
            for name in positionals(rest) {
                installed.remove(&name.to_lowercase());
            }
            CommandOutput::ok("Successfully uninstalled\n")
        }
        "list" => {
            let installed = state.envs.get(env).cloned().unwrap_or_default();
            let entries: Vec<_> = if rest.iter().any(|a| a == "--outdated") {
                installed
                    .iter()
                    .filter_map(|(name, version)| {
                        state
                            .outdated
                            .get(name)
                            .map(|latest| (name.clone(), version.clone(), Some(latest.clone())))
                    })
                    .collect()
            } else {
                installed
                    .iter()
                    .map(|(name, version)| (name.clone(), version.clone(), None))
                    .collect()
            };
            CommandOutput::ok(to_json(&entries))
        }
        "freeze" => {
            if state.fail_freeze {
                return CommandOutput::failed(1, "freeze: environment is corrupt\n");
            }
            let installed = state.envs.get(env).cloned().unwrap_or_default();
            let lines: String = installed
                .iter()
                .filter(|(name, _)| name.as_str() != "pip")
                .map(|(name, version)| format!("{}=={}\n", name, version))
                .collect();
            CommandOutput::ok(lines)
        }
        "show" => {
            let installed = state.envs.get(env).cloned().unwrap_or_default();
            let Some(name) = positionals(rest).into_iter().next() else {
                return CommandOutput::failed(1, "ERROR: Please provide a package name\n");
            };
            match installed.get(&name.to_lowercase()) {
                Some(version) => CommandOutput::ok(format!(
                    "Name: {}\nVersion: {}\nSummary: fake package\nRequires: \n",
                    name, version
                )),
                None => {
                    CommandOutput::failed(1, format!("WARNING: Package(s) not found: {}\n", name))
                }
            }
        }
        other => CommandOutput::failed(2, format!("ERROR: unknown command \"{}\"\n", other)),
    }
}

#[async_trait]
impl CommandRunner for FakeToolchain {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        _timeout: Duration,
    ) -> std::io::Result<CommandOutput> {
        let is_install = args.iter().any(|a| a == "install");
        let delay = self.state.lock().unwrap().install_delay;
        if let (true, Some(delay)) = (is_install, delay) {
            tokio::time::sleep(delay).await;
        }
        Ok(self.dispatch(program, args))
    }
}

/// Locator with a fixed default interpreter and optional global `uv`.
pub struct FixedLocator {
    pub interpreter: Option<PathBuf>,
    pub uv: Option<PathBuf>,
}

impl FixedLocator {
    pub fn new() -> Self {
        Self {
            interpreter: Some(PathBuf::from("/usr/bin/python3")),
            uv: None,
        }
    }
}

#[async_trait]
impl LocatorService for FixedLocator {
    fn default_interpreter(&self) -> Option<PathBuf> {
        self.interpreter.clone()
    }

    fn find_fast_installer(&self, env_path: &Path) -> Option<PathBuf> {
        let in_env = venv_launch::binary_path_for_env(env_path, "uv");
        if in_env.exists() {
            return Some(in_env);
        }
        self.uv.clone()
    }

    async fn find_interpreters(&self) -> Vec<InterpreterInfo> {
        self.interpreter
            .iter()
            .map(|path| InterpreterInfo {
                version: FAKE_VERSION.to_string(),
                path: path.clone(),
            })
            .collect()
    }
}

/// Records rendered progress messages and cancels once a chosen phase is
/// reported.
#[derive(Default)]
pub struct Recorder {
    pub messages: Mutex<Vec<String>>,
    pub cancel_on: Option<fn(&OpPhase) -> bool>,
    cancelled: std::sync::atomic::AtomicBool,
}

impl Recorder {
    pub fn cancelling_on(pred: fn(&OpPhase) -> bool) -> Self {
        Self {
            cancel_on: Some(pred),
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl ProgressHandler for Recorder {
    fn on_progress(&self, phase: OpPhase) {
        if self.cancel_on.is_some_and(|pred| pred(&phase)) {
            self.cancelled
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
        self.messages.lock().unwrap().push(phase.to_string());
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }
}
