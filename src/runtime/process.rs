//! Cancellable subprocess execution.
//!
//! # Responsibilities
//! - Spawn external programs with explicit stdin/stdout/stderr wiring
//! - Enforce an optional deadline
//! - Honour cancellation via [`ShutdownSignal`]
//! - Escalate SIGTERM → SIGKILL after `term_grace`

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::runtime::ShutdownSignal;

/// Errors raised while running a subprocess.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} I/O error: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("{program} timed out after {after:?}")]
    Timeout { program: String, after: Duration },

    #[error("{program} cancelled")]
    Cancelled { program: String },
}

impl ProcessError {
    /// Exit code of a failed process, if it exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessError::Failed { status, .. } => status.code(),
            _ => None,
        }
    }
}

/// Description of a command to run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
    /// Capture stdout/stderr instead of inheriting them.
    pub capture: bool,
    pub timeout: Option<Duration>,
    pub term_grace: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            stdin: None,
            capture: true,
            timeout: None,
            term_grace: Duration::from_secs(10),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    pub fn inherit_output(mut self) -> Self {
        self.capture = false;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn term_grace(mut self, grace: Duration) -> Self {
        self.term_grace = grace;
        self
    }

    fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Collected output of a successful run.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut(Duration),
    Cancelled,
}

/// Run a command to completion.
///
/// A non-zero exit status is reported as [`ProcessError::Failed`]. On
/// deadline or cancellation the child receives SIGTERM, then SIGKILL once
/// `term_grace` has elapsed.
pub async fn run(
    spec: &CommandSpec,
    cancel: Option<ShutdownSignal>,
) -> Result<CommandOutput, ProcessError> {
    let command_line = spec.display();
    tracing::debug!(command = %command_line, "Running command");

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);
    if spec.capture {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    }
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    if let (Some(bytes), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
        stdin
            .write_all(bytes)
            .await
            .map_err(|source| ProcessError::Io {
                program: spec.program.clone(),
                source,
            })?;
    }

    let stdout_task = child.stdout.take().map(|mut out| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf).await;
            buf
        })
    });
    let stderr_task = child.stderr.take().map(|mut err| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf).await;
            buf
        })
    });

    let deadline = async {
        match spec.timeout {
            Some(after) => {
                tokio::time::sleep(after).await;
                after
            }
            None => std::future::pending().await,
        }
    };
    let cancelled = async {
        match cancel {
            Some(mut signal) => signal.recv().await,
            None => std::future::pending().await,
        }
    };

    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        after = deadline => Outcome::TimedOut(after),
        _ = cancelled => Outcome::Cancelled,
    };

    match outcome {
        Outcome::Exited(status) => {
            let status = status.map_err(|source| ProcessError::Io {
                program: spec.program.clone(),
                source,
            })?;
            let stdout = match stdout_task {
                Some(task) => task.await.unwrap_or_default(),
                None => Vec::new(),
            };
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => Vec::new(),
            };
            if !status.success() {
                return Err(ProcessError::Failed {
                    program: command_line,
                    status,
                    stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
                });
            }
            Ok(CommandOutput { stdout, stderr })
        }
        Outcome::TimedOut(after) => {
            tracing::warn!(command = %command_line, timeout = ?after, "Command deadline exceeded");
            terminate(&mut child, spec.term_grace).await;
            Err(ProcessError::Timeout {
                program: command_line,
                after,
            })
        }
        Outcome::Cancelled => {
            tracing::warn!(command = %command_line, "Command cancelled");
            terminate(&mut child, spec.term_grace).await;
            Err(ProcessError::Cancelled { program: command_line })
        }
    }
}

/// SIGTERM, then SIGKILL if the child outlives `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        send_signal(pid, libc::SIGTERM);
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// Send `signal` to `pid`. Failures are logged.
pub fn send_signal(pid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        tracing::warn!(pid, "PID out of range");
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        tracing::warn!(
            pid,
            signal,
            error = %std::io::Error::last_os_error(),
            "Failed to signal process"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Shutdown;

    #[tokio::test]
    async fn captures_stdout() {
        let spec = CommandSpec::new("sh").args(["-c", "echo hello"]);
        let out = run(&spec, None).await.unwrap();
        assert_eq!(out.stdout_str().trim(), "hello");
    }

    #[tokio::test]
    async fn passes_stdin_and_env() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "cat; printf %s \"$GREETING\""])
            .envs([("GREETING", "world")])
            .stdin("hello ");
        let out = run(&spec, None).await.unwrap();
        assert_eq!(out.stdout_str(), "hello world");
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let spec = CommandSpec::new("sh").args(["-c", "echo oops >&2; exit 3"]);
        let err = run(&spec, None).await.unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert!(err.to_string().contains("oops"));
    }

    #[tokio::test]
    async fn deadline_kills_child() {
        let spec = CommandSpec::new("sleep")
            .arg("30")
            .timeout(Duration::from_millis(100))
            .term_grace(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let err = run(&spec, None).await.unwrap_err();
        assert!(
            matches!(&err, ProcessError::Timeout { program, .. } if program == "sleep 30"),
            "{err}"
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_stops_child() {
        let shutdown = Shutdown::new();
        let spec = CommandSpec::new("sleep")
            .arg("30")
            .term_grace(Duration::from_millis(100));
        let signal = shutdown.subscribe();
        let handle = tokio::spawn(async move { run(&spec, Some(signal)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let spec = CommandSpec::new("/nonexistent/conductor-test-binary");
        let err = run(&spec, None).await.unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
