//! Subprocess execution with cooperative cancellation
//!
//! [`ProcessRunner::run`] spawns a command, tees its stdout into an optional
//! progress log, and waits for whichever comes first: exit, cancellation or the
//! execution time limit. Cancellation and timeouts terminate the process with
//! SIGTERM, escalating to SIGKILL after a grace period.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use super::command::CommandLine;
use super::procfs;
use crate::error::{ExecutionError, Result};
use crate::types::OperationId;

/// Called with the PID right after the process starts
pub type SpawnHook = Box<dyn FnOnce(u32) + Send>;

/// Per-run options
pub struct RunOptions {
    /// Cancels the run when triggered
    pub cancel: CancellationToken,
    /// Maximum execution time
    pub timeout: Option<Duration>,
    /// File receiving a copy of stdout while the process runs; removed afterwards
    pub output_log: Option<PathBuf>,
    /// PID callback
    pub on_spawn: Option<SpawnHook>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            timeout: None,
            output_log: None,
            on_spawn: None,
        }
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("timeout", &self.timeout)
            .field("output_log", &self.output_log)
            .field("on_spawn", &self.on_spawn.is_some())
            .finish()
    }
}

/// Captured result of a finished process
#[derive(Clone, Debug)]
pub struct RunOutput {
    /// Exit code, None when killed by a signal
    pub exit_code: Option<i32>,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Process id
    pub pid: u32,
    /// Wall time
    pub elapsed: Duration,
}

impl RunOutput {
    /// Exit code 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

enum Outcome {
    Exited(std::process::ExitStatus),
    Cancelled,
    TimedOut(Duration),
}

/// Runs and terminates subprocesses
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    grace: Duration,
    settle: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            settle: Duration::from_millis(200),
        }
    }
}

impl ProcessRunner {
    /// Runner with a custom SIGTERM grace window and post-kill settle delay
    pub fn new(grace: Duration, settle: Duration) -> Self {
        Self { grace, settle }
    }

    /// Run `command` to completion
    ///
    /// A nonzero exit is not an error here; callers interpret exit codes.
    /// Cancellation returns [`ExecutionError::Cancelled`], exceeding the time
    /// limit returns [`ExecutionError::TimedOut`].
    pub async fn run(&self, command: &CommandLine, mut options: RunOptions) -> Result<RunOutput> {
        let mut cmd = command.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| ExecutionError::SpawnFailed {
            program: command.program.display().to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| ExecutionError::SpawnFailed {
            program: command.program.display().to_string(),
            reason: "process exited before its pid could be read".to_string(),
        })?;

        tracing::debug!(pid, command = %command.display(), "spawned subprocess");
        if let Some(hook) = options.on_spawn.take() {
            hook(pid);
        }

        let stdout_task = tokio::spawn(capture(
            child.stdout.take(),
            options.output_log.clone(),
            OUTPUT_LIMIT,
        ));
        let stderr_task = tokio::spawn(capture(child.stderr.take(), None, OUTPUT_LIMIT));

        let limit = options.timeout;
        let deadline = async move {
            match limit {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status?),
            _ = options.cancel.cancelled() => Outcome::Cancelled,
            limit = deadline => Outcome::TimedOut(limit),
        };

        let result = match outcome {
            Outcome::Exited(status) => {
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                Ok(RunOutput {
                    exit_code: status.code(),
                    stdout,
                    stderr,
                    pid,
                    elapsed: started.elapsed(),
                })
            }
            Outcome::Cancelled => {
                tracing::info!(pid, "cancelling subprocess");
                self.terminate_child(&mut child, pid).await;
                stdout_task.abort();
                stderr_task.abort();
                Err(ExecutionError::Cancelled.into())
            }
            Outcome::TimedOut(limit) => {
                tracing::warn!(
                    pid,
                    limit_secs = limit.as_secs(),
                    "subprocess exceeded maximum execution time"
                );
                self.terminate_child(&mut child, pid).await;
                stdout_task.abort();
                stderr_task.abort();
                Err(ExecutionError::TimedOut {
                    after_secs: limit.as_secs(),
                }
                .into())
            }
        };

        if let Some(log) = &options.output_log {
            let _ = tokio::fs::remove_file(log).await;
        }
        result
    }

    /// Terminate a process this runner does not own
    ///
    /// Sends SIGTERM, waits up to the grace window, then SIGKILL. Returns
    /// whether a live process was signalled.
    pub async fn cancel(&self, pid: u32) -> bool {
        if !procfs::is_alive(pid) {
            return false;
        }
        if !send_signal(pid, Signal::Term) {
            return false;
        }

        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline && procfs::is_alive(pid) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if procfs::is_alive(pid) {
            tracing::warn!(pid, grace_ms = self.grace.as_millis(), "process ignored SIGTERM, sending SIGKILL");
            send_signal(pid, Signal::Kill);
        }
        self.confirm_gone(pid).await;
        true
    }

    async fn terminate_child(&self, child: &mut Child, pid: u32) {
        send_signal(pid, Signal::Term);
        if tokio::time::timeout(self.grace, child.wait()).await.is_err() {
            tracing::warn!(pid, grace_ms = self.grace.as_millis(), "process ignored SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                tracing::warn!(pid, error = %e, "failed to kill subprocess");
            }
        }
        self.confirm_gone(pid).await;
    }

    async fn confirm_gone(&self, pid: u32) -> bool {
        tokio::time::sleep(self.settle).await;
        if procfs::is_alive(pid) {
            tracing::warn!(pid, "process still present after termination");
            false
        } else {
            true
        }
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

fn send_signal(pid: u32, signal: Signal) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    #[cfg(unix)]
    {
        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: pid is a positive single-process id, never 0 or -1.
        unsafe { libc::kill(pid as libc::pid_t, sig) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = signal;
        false
    }
}

/// Captured bytes kept per stream; older output goes first, whole lines at a time
const OUTPUT_LIMIT: usize = 8 << 20;

/// Trim `buffer` to at most its last `limit` bytes, starting on a line boundary
fn keep_tail(buffer: &mut Vec<u8>, limit: usize) -> usize {
    if buffer.len() <= limit {
        return 0;
    }
    let mut cut = buffer.len() - limit;
    if let Some(newline) = buffer[cut..].iter().position(|&b| b == b'\n') {
        cut += newline + 1;
    }
    buffer.drain(..cut);
    cut
}

async fn capture<R>(stream: Option<R>, log: Option<PathBuf>, limit: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(mut stream) = stream else {
        return String::new();
    };

    let mut log_file = match &log {
        Some(path) => match tokio::fs::File::create(path).await {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "cannot create progress log");
                None
            }
        },
        None => None,
    };

    let mut collected = Vec::new();
    let mut dropped = 0;
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                collected.extend_from_slice(&buf[..n]);
                // Trimming at twice the limit keeps the drain cost amortised
                if collected.len() > limit.saturating_mul(2) {
                    dropped += keep_tail(&mut collected, limit);
                }
                if let Some(file) = log_file.as_mut()
                    && file.write_all(&buf[..n]).await.is_err()
                {
                    log_file = None;
                }
            }
        }
    }
    dropped += keep_tail(&mut collected, limit);
    if dropped > 0 {
        tracing::debug!(dropped_bytes = dropped, "subprocess output exceeded capture limit, kept the tail");
    }
    String::from_utf8_lossy(&collected).into_owned()
}

/// Progress log path for an operation
pub fn progress_log_path(scratch_dir: &Path, operation_id: &OperationId) -> PathBuf {
    scratch_dir.join(format!("{}.log", operation_id))
}

/// Remove scratch files whose names start with the operation id
pub async fn cleanup_scratch(scratch_dir: &Path, operation_id: &OperationId) -> usize {
    let Ok(mut entries) = tokio::fs::read_dir(scratch_dir).await else {
        return 0;
    };
    let prefix = operation_id.as_str();
    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        // op ids share a prefix with longer ids, so require a separator
        let matches = name
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('.') || rest.starts_with('_'));
        if matches && tokio::fs::remove_file(entry.path()).await.is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::debug!(operation_id = %operation_id, removed, "removed scratch files");
    }
    removed
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn sh(script: &str) -> CommandLine {
        CommandLine::new("/bin/sh").arg("-c").arg(script)
    }

    fn fast_runner() -> ProcessRunner {
        ProcessRunner::new(Duration::from_millis(300), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let output = fast_runner()
            .run(&sh("echo out; echo err >&2; exit 3"), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(output.pid > 0);
    }

    #[tokio::test]
    async fn spawn_hook_receives_pid() {
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        let output = fast_runner()
            .run(
                &sh("exit 0"),
                RunOptions {
                    on_spawn: Some(Box::new(move |pid| {
                        *seen_clone.lock().unwrap() = Some(pid);
                    })),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(output.pid));
    }

    #[tokio::test]
    async fn env_and_working_directory_are_applied() {
        let dir = TempDir::new().unwrap();
        let line = sh("pwd; echo $PAR2PROTECT_OPERATION_ID")
            .current_dir(dir.path())
            .env("PAR2PROTECT_OPERATION_ID", "op_42");
        let output = fast_runner().run(&line, RunOptions::default()).await.unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(output.stdout.contains(&canonical.display().to_string()));
        assert!(output.stdout.contains("op_42"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_failure() {
        let result = fast_runner()
            .run(&CommandLine::new("/nonexistent/par2"), RunOptions::default())
            .await;
        assert!(matches!(
            result,
            Err(crate::Error::Execution(ExecutionError::SpawnFailed { .. }))
        ));
    }

    #[tokio::test]
    async fn cancellation_terminates_the_process() {
        let token = CancellationToken::new();
        let pid = Arc::new(Mutex::new(0u32));
        let pid_clone = pid.clone();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = fast_runner()
            .run(
                &sh("sleep 30"),
                RunOptions {
                    cancel: token,
                    on_spawn: Some(Box::new(move |p| *pid_clone.lock().unwrap() = p)),
                    ..Default::default()
                },
            )
            .await;

        assert!(matches!(
            result,
            Err(crate::Error::Execution(ExecutionError::Cancelled))
        ));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!procfs::is_alive(*pid.lock().unwrap()));
    }

    #[tokio::test]
    async fn stubborn_process_is_killed_after_grace() {
        let token = CancellationToken::new();
        token.cancel();
        let result = fast_runner()
            .run(
                &sh("trap '' TERM; sleep 30"),
                RunOptions {
                    cancel: token,
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(
            result,
            Err(crate::Error::Execution(ExecutionError::Cancelled))
        ));
    }

    #[tokio::test]
    async fn timeout_is_distinct_from_cancellation() {
        let result = fast_runner()
            .run(
                &sh("sleep 30"),
                RunOptions {
                    timeout: Some(Duration::from_millis(100)),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(
            result,
            Err(crate::Error::Execution(ExecutionError::TimedOut { .. }))
        ));
    }

    #[tokio::test]
    async fn progress_log_is_written_then_removed() {
        let dir = TempDir::new().unwrap();
        let id = OperationId::parse("op_abc").unwrap();
        let log = progress_log_path(dir.path(), &id);
        let line = sh(&format!(
            "printf 'Processing: 50.0%%\\r'; test -s {} && echo seen",
            log.display()
        ));
        let output = fast_runner()
            .run(
                &line,
                RunOptions {
                    output_log: Some(log.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(output.stdout.contains("50.0%"));
        assert!(!log.exists());
    }

    #[tokio::test]
    async fn capture_keeps_only_the_tail_of_long_output() {
        let mut output = String::new();
        for i in 0..1000 {
            output.push_str(&format!("Target: \"file{:04}\" - found.\n", i));
        }
        let captured = capture(Some(output.as_bytes()), None, 256).await;

        assert!(captured.len() <= 256);
        assert!(captured.starts_with("Target: "), "cut mid-line: {:?}", captured);
        assert!(captured.ends_with("\"file0999\" - found.\n"));
        assert!(!captured.contains("file0000"));
    }

    #[test]
    fn keep_tail_leaves_short_output_alone() {
        let mut buffer = b"one\ntwo\n".to_vec();
        assert_eq!(keep_tail(&mut buffer, 64), 0);
        assert_eq!(buffer, b"one\ntwo\n");

        assert_eq!(keep_tail(&mut buffer, 5), 4);
        assert_eq!(buffer, b"two\n");
    }

    #[tokio::test]
    async fn cancel_foreign_pid() {
        let mut child = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30")
            .spawn()
            .unwrap();
        let pid = child.id();

        assert!(fast_runner().cancel(pid).await);
        let _ = child.wait();
        assert!(!procfs::is_alive(pid));
        assert!(!fast_runner().cancel(pid).await, "already gone");
    }

    #[tokio::test]
    async fn cleanup_scratch_matches_only_the_operation() {
        let dir = TempDir::new().unwrap();
        let id = OperationId::parse("op_ab").unwrap();
        std::fs::write(dir.path().join("op_ab.log"), "x").unwrap();
        std::fs::write(dir.path().join("op_ab_stderr"), "x").unwrap();
        std::fs::write(dir.path().join("op_abcd.log"), "x").unwrap();
        std::fs::write(dir.path().join("other.log"), "x").unwrap();

        assert_eq!(cleanup_scratch(dir.path(), &id).await, 2);
        assert!(dir.path().join("op_abcd.log").exists());
        assert!(dir.path().join("other.log").exists());
    }
}
