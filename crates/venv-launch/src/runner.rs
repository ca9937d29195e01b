//! Subprocess execution with an enforced timeout.
//!
//! Every interaction with `python`, `pip` or `uv` goes through a
//! [`CommandRunner`]. The default [`SystemRunner`] spawns real processes;
//! tests substitute a scripted runner so the orchestration logic can be
//! exercised without a Python toolchain.

use async_trait::async_trait;
use log::{debug, warn};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Process-creation flag that stops Windows from opening a console window
/// for every child of a windowed parent.
#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Grace period for draining pipes after a timed-out child has been killed.
/// Grandchildren may still hold the pipes open; after this we give up on
/// the remaining output.
const DRAIN_AFTER_KILL: Duration = Duration::from_millis(500);

/// Captured result of one subprocess invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed or ended by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// The runner killed the process because it exceeded its timeout.
    pub timed_out: bool,
}

impl CommandOutput {
    /// A successful (exit code 0) result with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// A failed result with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    /// A result describing a process killed after its timeout.
    pub fn timeout() -> Self {
        Self {
            timed_out: true,
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stdout followed by stderr, the way installers are usually read.
    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len());
        out.push_str(&self.stdout);
        out.push_str(&self.stderr);
        out
    }
}

/// Runs external programs.
///
/// Implementations must enforce `timeout` themselves (kill the process, not
/// merely stop waiting for it) and report it through
/// [`CommandOutput::timed_out`]. An `Err` is reserved for failing to start
/// the program at all.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Duration,
    ) -> std::io::Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Duration,
    ) -> std::io::Result<CommandOutput> {
        let started = Instant::now();
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(target_os = "windows")]
        cmd.creation_flags(CREATE_NO_WINDOW);

        debug!("[runner] {} {}", program.display(), args.join(" "));

        let mut child = cmd.spawn()?;
        let stdout_pipe = child.stdout.take().map(Drain::spawn);
        let stderr_pipe = child.stderr.take().map(Drain::spawn);

        let deadline = started + timeout;
        let (exit_code, mut timed_out) =
            match tokio::time::timeout_at(deadline.into(), child.wait()).await {
                Ok(status) => (status?.code(), false),
                Err(_) => {
                    warn!(
                        "[runner] {} exceeded {}s, killing",
                        program.display(),
                        timeout.as_secs()
                    );
                    if let Err(e) = child.kill().await {
                        warn!("[runner] Failed to kill {}: {}", program.display(), e);
                    }
                    (None, true)
                }
            };

        // Descendants can keep the pipes open after the child exits, so
        // draining is bounded by the same deadline.
        let drain_deadline = if timed_out {
            Instant::now() + DRAIN_AFTER_KILL
        } else {
            deadline
        };
        let ((stdout, stdout_done), (stderr, stderr_done)) = tokio::join!(
            Drain::collect(stdout_pipe, drain_deadline),
            Drain::collect(stderr_pipe, drain_deadline),
        );
        if !timed_out && !(stdout_done && stderr_done) {
            warn!(
                "[runner] {} exited but its output stayed open past {}s",
                program.display(),
                timeout.as_secs()
            );
            timed_out = true;
        }

        debug!(
            "[runner] {} finished in {}ms (exit={:?}, timed_out={})",
            program.display(),
            started.elapsed().as_millis(),
            exit_code,
            timed_out
        );

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
            timed_out,
        })
    }
}

/// Background reader for one output pipe. Bytes are kept in a shared
/// buffer so whatever arrived before a deadline is still reported.
struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl Drain {
    fn spawn<R>(mut pipe: R) -> Self
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = buf.clone();
        let task = tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        sink.lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .extend_from_slice(&chunk[..n]);
                    }
                    // A read error only truncates the captured output.
                    Err(_) => break,
                }
            }
        });
        Self { buf, task }
    }

    /// Captured text, and whether the pipe reached end-of-file before
    /// `deadline`.
    async fn collect(drain: Option<Self>, deadline: Instant) -> (String, bool) {
        let Some(mut drain) = drain else {
            return (String::new(), true);
        };
        let done = match tokio::time::timeout_at(deadline.into(), &mut drain.task).await {
            Ok(_) => true,
            Err(_) => {
                drain.task.abort();
                false
            }
        };
        let bytes = drain.buf.lock().unwrap_or_else(PoisonError::into_inner);
        let text = String::from_utf8_lossy(&bytes).into_owned();
        (text, done)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh() -> PathBuf {
        PathBuf::from("/bin/sh")
    }

    fn script(s: &str) -> Vec<String> {
        vec!["-c".to_string(), s.to_string()]
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let out = SystemRunner
            .run(&sh(), &script("echo out; echo err 1>&2"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert_eq!(out.combined(), "out\nerr\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_a_timeout() {
        let out = SystemRunner
            .run(&sh(), &script("exit 3"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let started = Instant::now();
        let out = SystemRunner
            .run(&sh(), &script("echo early; exec sleep 30"), Duration::from_millis(300))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
        assert_eq!(out.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_background_descendant_cannot_outlive_timeout() {
        let started = Instant::now();
        let out = SystemRunner
            .run(&sh(), &script("sleep 8 & echo hi"), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(out.timed_out);
        assert!(!out.success());
        assert_eq!(out.stdout.trim(), "hi");
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let result = SystemRunner
            .run(
                Path::new("/nonexistent/definitely-not-here"),
                &[],
                Duration::from_secs(1),
            )
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_output_constructors() {
        assert!(CommandOutput::ok("x").success());
        assert!(!CommandOutput::failed(1, "boom").success());
        assert!(!CommandOutput::timeout().success());
        assert!(CommandOutput::timeout().timed_out);
    }
}
